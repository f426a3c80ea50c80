//! Data model shared by the engine and its Job Store.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use uuid::Uuid;

/// How to reach a PostgreSQL server. Opaque to the engine beyond what's needed
/// to open a connection; supplied by the caller via the Job Store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSpec {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    #[serde(default)]
    pub tls: TlsSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsSpec {
    pub enabled: bool,
    pub mode: TlsMode,
    pub verify_peer: bool,
}

impl Default for TlsSpec {
    fn default() -> Self {
        TlsSpec {
            enabled: false,
            mode: TlsMode::Disable,
            verify_peer: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsMode {
    Disable,
    Prefer,
    Require,
}

/// One per-table replication strategy. A closed sum type: the Coordinator
/// dispatches on it directly rather than through a trait object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rule {
    Schema,
    Overwrite,
    Upsert,
    #[serde(rename = "ignore")]
    Ignore,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableTask {
    pub table_name: String,
    pub rule: Rule,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub job_id: Uuid,
    pub source_connection_id: Uuid,
    pub target_connection_id: Uuid,
    pub global_rule: Rule,
    pub tasks: Vec<TableTask>,
}

/// A column as reported by `information_schema.columns`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub data_type: String,
    pub udt_name: String,
    pub is_nullable: bool,
    pub character_maximum_length: Option<i32>,
    pub numeric_precision: Option<i32>,
    pub numeric_scale: Option<i32>,
    pub column_default: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceDescriptor {
    pub name: String,
    pub increment: i64,
    pub minimum_value: i64,
    pub start_value: i64,
    pub owning_table: String,
    pub owning_column: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    Primary,
    Unique,
    Foreign,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstraintDescriptor {
    pub kind: ConstraintKind,
    pub name: String,
    pub columns: Vec<String>,
    pub referenced_table: Option<String>,
    pub referenced_columns: Vec<String>,
    pub on_update: Option<String>,
    pub on_delete: Option<String>,
}

/// An index, replayed verbatim from its `pg_indexes.indexdef` text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDescriptor {
    pub name: String,
    pub definition: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableResult {
    pub table: String,
    pub rule: Rule,
    pub rows_migrated: Option<u64>,
    pub status: TableStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: Uuid,
    pub source_connection_id: Uuid,
    pub target_connection_id: Uuid,
    pub status: JobStatus,
    pub result: Vec<TableResult>,
    pub duration_ms: Option<u64>,
    pub error_message: Option<String>,
}

impl JobRecord {
    pub fn pending(spec: &JobSpec) -> Self {
        JobRecord {
            job_id: spec.job_id,
            source_connection_id: spec.source_connection_id,
            target_connection_id: spec.target_connection_id,
            status: JobStatus::Running,
            result: Vec::new(),
            duration_ms: None,
            error_message: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    pub job_id: Uuid,
    pub table_name: Option<String>,
    pub level: LogLevel,
    pub message: String,
    #[serde(skip, default = "SystemTime::now")]
    pub timestamp: SystemTime,
}

impl LogEvent {
    pub fn info(job_id: Uuid, table_name: Option<&str>, message: impl Into<String>) -> Self {
        LogEvent {
            job_id,
            table_name: table_name.map(str::to_string),
            level: LogLevel::Info,
            message: message.into(),
            timestamp: SystemTime::now(),
        }
    }

    pub fn warning(job_id: Uuid, table_name: Option<&str>, message: impl Into<String>) -> Self {
        LogEvent {
            job_id,
            table_name: table_name.map(str::to_string),
            level: LogLevel::Warning,
            message: message.into(),
            timestamp: SystemTime::now(),
        }
    }

    pub fn error(job_id: Uuid, table_name: Option<&str>, message: impl Into<String>) -> Self {
        LogEvent {
            job_id,
            table_name: table_name.map(str::to_string),
            level: LogLevel::Error,
            message: message.into(),
            timestamp: SystemTime::now(),
        }
    }
}

/// Columns of a table classified once, up front, instead of re-checked per
/// value during row preparation.
#[derive(Debug, Clone, Default)]
pub struct ColumnClassification {
    pub json_columns: std::collections::HashSet<String>,
    pub array_columns: std::collections::HashSet<String>,
}

impl ColumnClassification {
    pub fn from_columns(columns: &[ColumnDescriptor]) -> Self {
        let mut json_columns = std::collections::HashSet::new();
        let mut array_columns = std::collections::HashSet::new();
        for col in columns {
            if is_json_type(&col.data_type, &col.udt_name) {
                json_columns.insert(col.name.clone());
            } else if is_array_type(&col.data_type, &col.udt_name) {
                array_columns.insert(col.name.clone());
            }
        }
        ColumnClassification {
            json_columns,
            array_columns,
        }
    }
}

pub fn is_json_type(data_type: &str, udt_name: &str) -> bool {
    matches!(data_type, "json" | "jsonb") || matches!(udt_name, "json" | "jsonb")
}

pub fn is_array_type(data_type: &str, udt_name: &str) -> bool {
    data_type.eq_ignore_ascii_case("ARRAY") || udt_name.starts_with('_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(name: &str, data_type: &str, udt_name: &str) -> ColumnDescriptor {
        ColumnDescriptor {
            name: name.to_string(),
            data_type: data_type.to_string(),
            udt_name: udt_name.to_string(),
            is_nullable: true,
            character_maximum_length: None,
            numeric_precision: None,
            numeric_scale: None,
            column_default: None,
        }
    }

    #[test]
    fn classifies_json_and_jsonb() {
        let cols = vec![col("a", "json", "json"), col("b", "jsonb", "jsonb")];
        let classification = ColumnClassification::from_columns(&cols);
        assert!(classification.json_columns.contains("a"));
        assert!(classification.json_columns.contains("b"));
        assert!(classification.array_columns.is_empty());
    }

    #[test]
    fn classifies_array_by_data_type_or_udt_prefix() {
        let cols = vec![
            col("tags", "ARRAY", "_text"),
            col("scores", "integer", "_int4"),
        ];
        let classification = ColumnClassification::from_columns(&cols);
        assert!(classification.array_columns.contains("tags"));
        assert!(classification.array_columns.contains("scores"));
    }

    #[test]
    fn plain_column_is_neither() {
        let cols = vec![col("name", "text", "text")];
        let classification = ColumnClassification::from_columns(&cols);
        assert!(classification.json_columns.is_empty());
        assert!(classification.array_columns.is_empty());
    }

    #[test]
    fn rule_serializes_to_wire_vocabulary() {
        assert_eq!(serde_json::to_string(&Rule::Schema).unwrap(), "\"schema\"");
        assert_eq!(
            serde_json::to_string(&Rule::Overwrite).unwrap(),
            "\"overwrite\""
        );
        assert_eq!(serde_json::to_string(&Rule::Upsert).unwrap(), "\"upsert\"");
        assert_eq!(serde_json::to_string(&Rule::Ignore).unwrap(), "\"ignore\"");
    }
}
