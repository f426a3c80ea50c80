//! Job Store: the persistence adapter the engine depends on but does not
//! own. Treated as a sink interface — the engine never couples to a
//! particular storage technology beyond this trait.

use crate::types::{ConnectionSpec, JobRecord, LogEvent};
use async_trait::async_trait;
use deadpool_postgres::Pool;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum JobStoreError {
    #[error("connection {0} not found")]
    NotFound(Uuid),
    #[error("job store error: {0}")]
    Other(#[from] anyhow::Error),
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn load_connection(&self, id: Uuid) -> Result<ConnectionSpec, JobStoreError>;
    async fn update_job(&self, record: &JobRecord) -> Result<(), JobStoreError>;
    /// Best-effort: a failure here is logged and swallowed by the caller,
    /// never allowed to block data motion.
    async fn append_log(&self, event: LogEvent) -> Result<(), JobStoreError>;
}

/// In-memory Job Store used by unit and integration tests.
#[derive(Default)]
pub struct InMemoryJobStore {
    connections: Mutex<HashMap<Uuid, ConnectionSpec>>,
    jobs: Mutex<HashMap<Uuid, JobRecord>>,
    logs: Mutex<Vec<LogEvent>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_connection(&self, id: Uuid, spec: ConnectionSpec) {
        self.connections.lock().await.insert(id, spec);
    }

    pub async fn job(&self, id: Uuid) -> Option<JobRecord> {
        self.jobs.lock().await.get(&id).cloned()
    }

    pub async fn logs(&self) -> Vec<LogEvent> {
        self.logs.lock().await.clone()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn load_connection(&self, id: Uuid) -> Result<ConnectionSpec, JobStoreError> {
        self.connections
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or(JobStoreError::NotFound(id))
    }

    async fn update_job(&self, record: &JobRecord) -> Result<(), JobStoreError> {
        self.jobs.lock().await.insert(record.job_id, record.clone());
        Ok(())
    }

    async fn append_log(&self, event: LogEvent) -> Result<(), JobStoreError> {
        self.logs.lock().await.push(event);
        Ok(())
    }
}

/// Job Store backed by the three tables in the persisted state layout:
/// `connections`, `migrations`, `migration_logs`.
pub struct PostgresJobStore {
    pool: Pool,
}

impl PostgresJobStore {
    pub fn new(pool: Pool) -> Self {
        PostgresJobStore { pool }
    }

    pub async fn init_tables(&self) -> anyhow::Result<()> {
        let client = self.pool.get().await?;
        client
            .batch_execute(
                "
                CREATE TABLE IF NOT EXISTS connections (
                    id UUID PRIMARY KEY,
                    name TEXT NOT NULL,
                    host TEXT NOT NULL,
                    port INTEGER NOT NULL,
                    database TEXT NOT NULL,
                    username TEXT NOT NULL,
                    password TEXT NOT NULL,
                    ssl BOOLEAN NOT NULL DEFAULT false,
                    ssl_mode TEXT NOT NULL DEFAULT 'prefer',
                    verify_peer BOOLEAN NOT NULL DEFAULT true,
                    status TEXT NOT NULL DEFAULT 'active',
                    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
                );

                CREATE TABLE IF NOT EXISTS migrations (
                    id UUID PRIMARY KEY,
                    source_connection_id UUID NOT NULL,
                    target_connection_id UUID NOT NULL,
                    status TEXT NOT NULL,
                    global_rule TEXT NOT NULL,
                    collections JSONB NOT NULL,
                    result JSONB,
                    duration_ms BIGINT,
                    error_message TEXT,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
                );

                CREATE TABLE IF NOT EXISTS migration_logs (
                    id UUID PRIMARY KEY,
                    migration_id UUID NOT NULL,
                    collection_name TEXT NOT NULL,
                    level TEXT NOT NULL,
                    message TEXT NOT NULL,
                    metadata JSONB,
                    timestamp TIMESTAMPTZ NOT NULL DEFAULT now()
                );
                ",
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn load_connection(&self, id: Uuid) -> Result<ConnectionSpec, JobStoreError> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| JobStoreError::Other(e.into()))?;
        let row = client
            .query_opt(
                "SELECT host, port, database, username, password, ssl, ssl_mode, verify_peer \
                 FROM connections WHERE id = $1",
                &[&id],
            )
            .await
            .map_err(|e| JobStoreError::Other(e.into()))?
            .ok_or(JobStoreError::NotFound(id))?;

        let ssl: bool = row.get(5);
        let ssl_mode: String = row.get(6);
        let verify_peer: bool = row.get(7);
        let mode = match ssl_mode.as_str() {
            "require" => crate::types::TlsMode::Require,
            "prefer" => crate::types::TlsMode::Prefer,
            _ => crate::types::TlsMode::Disable,
        };

        Ok(ConnectionSpec {
            host: row.get(0),
            port: row.get::<_, i32>(1) as u16,
            database: row.get(2),
            user: row.get(3),
            password: row.get(4),
            tls: crate::types::TlsSpec {
                enabled: ssl,
                mode,
                verify_peer,
            },
        })
    }

    async fn update_job(&self, record: &JobRecord) -> Result<(), JobStoreError> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| JobStoreError::Other(e.into()))?;
        let status = match record.status {
            crate::types::JobStatus::Pending => "pending",
            crate::types::JobStatus::Running => "running",
            crate::types::JobStatus::Completed => "completed",
            crate::types::JobStatus::Failed => "failed",
        };
        let result_json = serde_json::to_value(&record.result)
            .map_err(|e| JobStoreError::Other(e.into()))?;

        client
            .execute(
                "UPDATE migrations SET status = $2, result = $3, duration_ms = $4, \
                 error_message = $5, updated_at = now() WHERE id = $1",
                &[
                    &record.job_id,
                    &status,
                    &result_json,
                    &record.duration_ms.map(|d| d as i64),
                    &record.error_message,
                ],
            )
            .await
            .map_err(|e| JobStoreError::Other(e.into()))?;
        Ok(())
    }

    async fn append_log(&self, event: LogEvent) -> Result<(), JobStoreError> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| JobStoreError::Other(e.into()))?;
        let level = match event.level {
            crate::types::LogLevel::Info => "info",
            crate::types::LogLevel::Warning => "warning",
            crate::types::LogLevel::Error => "error",
        };
        client
            .execute(
                "INSERT INTO migration_logs (id, migration_id, collection_name, level, message) \
                 VALUES ($1, $2, $3, $4, $5)",
                &[
                    &Uuid::new_v4(),
                    &event.job_id,
                    &event.table_name.unwrap_or_default(),
                    &level,
                    &event.message,
                ],
            )
            .await
            .map_err(|e| JobStoreError::Other(e.into()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JobStatus, TableResult, TableStatus};

    #[tokio::test]
    async fn in_memory_store_round_trips_connection() {
        let store = InMemoryJobStore::new();
        let id = Uuid::new_v4();
        let spec = ConnectionSpec {
            host: "localhost".to_string(),
            port: 5432,
            database: "db".to_string(),
            user: "u".to_string(),
            password: "p".to_string(),
            tls: Default::default(),
        };
        store.insert_connection(id, spec.clone()).await;
        let loaded = store.load_connection(id).await.unwrap();
        assert_eq!(loaded.host, spec.host);
    }

    #[tokio::test]
    async fn in_memory_store_reports_missing_connection() {
        let store = InMemoryJobStore::new();
        let err = store.load_connection(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, JobStoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn in_memory_store_accumulates_logs_in_order() {
        let store = InMemoryJobStore::new();
        let job_id = Uuid::new_v4();
        store
            .append_log(LogEvent::info(job_id, Some("t"), "first"))
            .await
            .unwrap();
        store
            .append_log(LogEvent::error(job_id, Some("t"), "second"))
            .await
            .unwrap();
        let logs = store.logs().await;
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].message, "first");
        assert_eq!(logs[1].message, "second");
    }

    #[tokio::test]
    async fn in_memory_store_update_job_is_idempotent() {
        let store = InMemoryJobStore::new();
        let job_id = Uuid::new_v4();
        let mut record = JobRecord {
            job_id,
            source_connection_id: Uuid::new_v4(),
            target_connection_id: Uuid::new_v4(),
            status: JobStatus::Running,
            result: vec![],
            duration_ms: None,
            error_message: None,
        };
        store.update_job(&record).await.unwrap();
        record.status = JobStatus::Completed;
        record.result.push(TableResult {
            table: "t".to_string(),
            rule: crate::types::Rule::Overwrite,
            rows_migrated: Some(2),
            status: TableStatus::Success,
            error: None,
        });
        store.update_job(&record).await.unwrap();
        let loaded = store.job(job_id).await.unwrap();
        assert_eq!(loaded.status, JobStatus::Completed);
        assert_eq!(loaded.result.len(), 1);
    }
}
