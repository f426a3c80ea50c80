//! Schema Replayer: creates target tables, sequences, primary keys, adds
//! missing columns, and synchronizes indexes — non-destructively.

use crate::introspect;
use crate::types::ColumnDescriptor;
use anyhow::Context;
use tokio_postgres::Client;

static IDENT_RE_CHARS: &str = "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789_";

/// Validates an identifier before it is spliced into SQL text. A name that
/// fails this check cannot be made safe by quoting alone (it could itself
/// contain a closing quote), so the caller aborts rather than quoting it.
pub fn quote_ident(name: &str) -> anyhow::Result<String> {
    let mut chars = name.chars();
    let first_ok = chars.next().map(|c| c.is_ascii_alphabetic() || c == '_').unwrap_or(false);
    let rest_ok = name.chars().all(|c| IDENT_RE_CHARS.contains(c));
    if !first_ok || !rest_ok || name.is_empty() {
        anyhow::bail!("identifier '{name}' does not match [A-Za-z_][A-Za-z0-9_]*");
    }
    Ok(format!("\"{name}\""))
}

/// Emits the SQL type for a source column per the fixed type mapping table.
pub fn map_column_type(col: &ColumnDescriptor) -> String {
    match col.data_type.as_str() {
        "character varying" => format!(
            "varchar({})",
            col.character_maximum_length.unwrap_or(255)
        ),
        "character" => format!("char({})", col.character_maximum_length.unwrap_or(1)),
        "numeric" => format!(
            "numeric({},{})",
            col.numeric_precision.unwrap_or(10),
            col.numeric_scale.unwrap_or(2)
        ),
        "integer" | "bigint" | "smallint" | "boolean" | "text" | "json" | "jsonb" | "uuid"
        | "date" | "bytea" | "real" => col.data_type.clone(),
        "double precision" => "double precision".to_string(),
        "timestamp without time zone" => "timestamp".to_string(),
        "timestamp with time zone" => "timestamptz".to_string(),
        "time without time zone" => "time".to_string(),
        "ARRAY" => {
            let element = col.udt_name.strip_prefix('_').unwrap_or(&col.udt_name);
            format!("{element}[]")
        }
        _ => {
            if !col.udt_name.is_empty() {
                col.udt_name.clone()
            } else {
                col.data_type.clone()
            }
        }
    }
}

/// Default value used to backfill existing rows when a `NOT NULL` column is
/// added incrementally. `None` means the `ADD COLUMN` may fail; that failure
/// is reported as a column-level error, not fatal for the table.
pub fn null_fill_default(col: &ColumnDescriptor) -> Option<&'static str> {
    match col.data_type.as_str() {
        "integer" | "bigint" | "smallint" | "numeric" | "real" | "double precision" => Some("0"),
        "boolean" => Some("false"),
        "text" | "character varying" | "character" => Some("''"),
        "json" | "jsonb" => Some("'{}'"),
        "timestamp without time zone" | "timestamp with time zone" => Some("NOW()"),
        "date" => Some("CURRENT_DATE"),
        "uuid" => Some("gen_random_uuid()"),
        _ => None,
    }
}

pub struct SchemaChanges {
    pub table_created: bool,
    pub sequences_created: u32,
    pub columns_added: Vec<String>,
    pub errors: Vec<String>,
}

impl SchemaChanges {
    fn empty() -> Self {
        SchemaChanges {
            table_created: false,
            sequences_created: 0,
            columns_added: Vec::new(),
            errors: Vec::new(),
        }
    }
}

/// Replays source schema for `table` onto the target connection. Returns the
/// set of structural changes made; never deletes or alters existing columns.
pub async fn replay_schema(
    source: &Client,
    target: &Client,
    table: &str,
) -> anyhow::Result<SchemaChanges> {
    let source_columns = introspect::columns(source, table).await?;
    if source_columns.is_empty() {
        anyhow::bail!("table not found in source");
    }

    let mut changes = SchemaChanges::empty();

    if !introspect::table_exists(target, table).await? {
        create_table(target, table, &source_columns, &mut changes).await?;
    } else {
        add_missing_columns(target, table, &source_columns, &mut changes).await?;
    }

    sync_indexes(source, target, table).await?;

    Ok(changes)
}

async fn create_table(
    target: &Client,
    table: &str,
    source_columns: &[ColumnDescriptor],
    changes: &mut SchemaChanges,
) -> anyhow::Result<()> {
    let quoted_table = quote_ident(table)?;

    let nextval_columns: Vec<&ColumnDescriptor> = source_columns
        .iter()
        .filter(|c| {
            c.column_default
                .as_deref()
                .map(|d| d.contains("nextval("))
                .unwrap_or(false)
        })
        .collect();

    for col in &nextval_columns {
        if let Some(default) = &col.column_default {
            if let Some(seq_name) = introspect::extract_nextval_sequence_name(default) {
                let quoted_seq = quote_ident(&seq_name)?;
                target
                    .execute(
                        &format!("CREATE SEQUENCE IF NOT EXISTS {quoted_seq}"),
                        &[],
                    )
                    .await
                    .with_context(|| format!("creating sequence {seq_name}"))?;
                changes.sequences_created += 1;
            }
        }
    }

    let mut column_defs = Vec::new();
    for col in source_columns {
        let quoted_col = quote_ident(&col.name)?;
        let sql_type = map_column_type(col);
        let mut def = format!("{quoted_col} {sql_type}");
        if !col.is_nullable {
            def.push_str(" NOT NULL");
        }
        let is_sequence_default = col
            .column_default
            .as_deref()
            .map(|d| d.contains("nextval("))
            .unwrap_or(false);
        if !is_sequence_default {
            if let Some(default) = &col.column_default {
                def.push_str(&format!(" DEFAULT {default}"));
            }
        }
        column_defs.push(def);
    }

    target
        .execute(
            &format!("CREATE TABLE {quoted_table} ({})", column_defs.join(", ")),
            &[],
        )
        .await
        .with_context(|| format!("creating table {table}"))?;
    changes.table_created = true;

    for col in &nextval_columns {
        if let Some(default) = &col.column_default {
            if let Some(seq_name) = introspect::extract_nextval_sequence_name(default) {
                let quoted_seq = quote_ident(&seq_name)?;
                let quoted_col = quote_ident(&col.name)?;
                target
                    .execute(
                        &format!(
                            "ALTER TABLE {quoted_table} ALTER COLUMN {quoted_col} SET DEFAULT nextval('{seq_name}'::regclass)"
                        ),
                        &[],
                    )
                    .await
                    .with_context(|| format!("setting default on {}.{}", table, col.name))?;
                target
                    .execute(
                        &format!(
                            "ALTER SEQUENCE {quoted_seq} OWNED BY {quoted_table}.{quoted_col}"
                        ),
                        &[],
                    )
                    .await
                    .with_context(|| format!("setting sequence ownership for {seq_name}"))?;
            }
        }
    }

    // Primary key recovery from serial columns. The authoritative primary key
    // comes from C2's introspection probe against the source; this
    // approximation is used only to give a freshly-created target a PK at
    // all. See the open question recorded in DESIGN.md.
    if !nextval_columns.is_empty() {
        let pk_columns: Vec<String> = nextval_columns
            .iter()
            .map(|c| quote_ident(&c.name))
            .collect::<anyhow::Result<_>>()?;
        let pk_name = quote_ident(&format!("{table}_pkey"))?;
        target
            .execute(
                &format!(
                    "ALTER TABLE {quoted_table} ADD CONSTRAINT {pk_name} PRIMARY KEY ({})",
                    pk_columns.join(", ")
                ),
                &[],
            )
            .await
            .with_context(|| format!("declaring primary key on {table}"))?;
    }

    Ok(())
}

async fn add_missing_columns(
    target: &Client,
    table: &str,
    source_columns: &[ColumnDescriptor],
    changes: &mut SchemaChanges,
) -> anyhow::Result<()> {
    let target_columns = introspect::columns(target, table).await?;
    let existing: std::collections::HashSet<&str> =
        target_columns.iter().map(|c| c.name.as_str()).collect();

    let quoted_table = quote_ident(table)?;

    for col in source_columns {
        if existing.contains(col.name.as_str()) {
            continue;
        }

        if let Some(default) = &col.column_default {
            if default.contains("nextval(") {
                if let Some(seq_name) = introspect::extract_nextval_sequence_name(default) {
                    let quoted_seq = quote_ident(&seq_name)?;
                    if let Err(e) = target
                        .execute(
                            &format!("CREATE SEQUENCE IF NOT EXISTS {quoted_seq}"),
                            &[],
                        )
                        .await
                    {
                        changes
                            .errors
                            .push(format!("creating sequence {seq_name}: {e}"));
                        continue;
                    }
                    changes.sequences_created += 1;
                }
            }
        }

        let quoted_col = match quote_ident(&col.name) {
            Ok(q) => q,
            Err(e) => {
                changes.errors.push(e.to_string());
                continue;
            }
        };
        let sql_type = map_column_type(col);
        let mut stmt = format!("ALTER TABLE {quoted_table} ADD COLUMN {quoted_col} {sql_type}");

        let has_own_default = col
            .column_default
            .as_deref()
            .map(|d| !d.contains("nextval("))
            .unwrap_or(false);

        if has_own_default {
            // Defaults are preserved verbatim; only a NOT NULL column with no
            // default of its own falls back to the null-fill table.
            stmt.push_str(&format!(" DEFAULT {}", col.column_default.as_deref().unwrap()));
            if !col.is_nullable {
                stmt.push_str(" NOT NULL");
            }
        } else if !col.is_nullable {
            match null_fill_default(col) {
                Some(default) => {
                    stmt.push_str(&format!(" NOT NULL DEFAULT {default}"));
                }
                None => {
                    // No safe default known; attempt the bare ADD and report
                    // failure as a column-level error rather than aborting.
                }
            }
        }

        match target.execute(&stmt, &[]).await {
            Ok(_) => changes.columns_added.push(col.name.clone()),
            Err(e) => changes
                .errors
                .push(format!("adding column {}: {e}", col.name)),
        }
    }

    Ok(())
}

async fn sync_indexes(
    source: &Client,
    target: &Client,
    table: &str,
) -> anyhow::Result<()> {
    let source_indexes = introspect::indexes(source, table).await?;
    let target_indexes = introspect::indexes(target, table).await?;
    let existing: std::collections::HashSet<&str> =
        target_indexes.iter().map(|i| i.name.as_str()).collect();

    for idx in &source_indexes {
        if existing.contains(idx.name.as_str()) {
            continue;
        }
        target
            .execute(&idx.definition, &[])
            .await
            .with_context(|| format!("replaying index {}", idx.name))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(data_type: &str, udt_name: &str) -> ColumnDescriptor {
        ColumnDescriptor {
            name: "c".to_string(),
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
    fn maps_varchar_with_default_length() {
        assert_eq!(map_column_type(&col("character varying", "varchar")), "varchar(255)");
    }

    #[test]
    fn maps_varchar_with_explicit_length() {
        let mut c = col("character varying", "varchar");
        c.character_maximum_length = Some(32);
        assert_eq!(map_column_type(&c), "varchar(32)");
    }

    #[test]
    fn maps_numeric_with_defaults() {
        assert_eq!(map_column_type(&col("numeric", "numeric")), "numeric(10,2)");
    }

    #[test]
    fn maps_numeric_with_explicit_precision_scale() {
        let mut c = col("numeric", "numeric");
        c.numeric_precision = Some(18);
        c.numeric_scale = Some(4);
        assert_eq!(map_column_type(&c), "numeric(18,4)");
    }

    #[test]
    fn maps_identity_types_verbatim() {
        for t in ["integer", "bigint", "smallint", "boolean", "text", "json", "jsonb", "uuid", "date", "bytea", "real"] {
            assert_eq!(map_column_type(&col(t, t)), t);
        }
    }

    #[test]
    fn maps_timestamp_variants() {
        assert_eq!(map_column_type(&col("timestamp without time zone", "timestamp")), "timestamp");
        assert_eq!(map_column_type(&col("timestamp with time zone", "timestamptz")), "timestamptz");
        assert_eq!(map_column_type(&col("time without time zone", "time")), "time");
    }

    #[test]
    fn maps_array_by_stripping_leading_underscore() {
        assert_eq!(map_column_type(&col("ARRAY", "_text")), "text[]");
        assert_eq!(map_column_type(&col("ARRAY", "_int4")), "int4[]");
    }

    #[test]
    fn maps_unknown_to_udt_name_else_data_type() {
        assert_eq!(map_column_type(&col("point", "point")), "point");
        assert_eq!(map_column_type(&col("mystery", "")), "mystery");
    }

    #[test]
    fn null_fill_defaults_cover_the_spec_table() {
        assert_eq!(null_fill_default(&col("integer", "int4")), Some("0"));
        assert_eq!(null_fill_default(&col("boolean", "bool")), Some("false"));
        assert_eq!(null_fill_default(&col("text", "text")), Some("''"));
        assert_eq!(null_fill_default(&col("jsonb", "jsonb")), Some("'{}'"));
        assert_eq!(
            null_fill_default(&col("timestamp with time zone", "timestamptz")),
            Some("NOW()")
        );
        assert_eq!(null_fill_default(&col("date", "date")), Some("CURRENT_DATE"));
        assert_eq!(null_fill_default(&col("uuid", "uuid")), Some("gen_random_uuid()"));
        assert_eq!(null_fill_default(&col("point", "point")), None);
    }

    #[test]
    fn quote_ident_accepts_ascii_identifiers() {
        assert_eq!(quote_ident("users").unwrap(), "\"users\"");
        assert_eq!(quote_ident("_private").unwrap(), "\"_private\"");
    }

    #[test]
    fn quote_ident_rejects_names_with_quotes_or_leading_digits() {
        assert!(quote_ident("1bad").is_err());
        assert!(quote_ident("evil\"; DROP TABLE x; --").is_err());
        assert!(quote_ident("").is_err());
    }
}
