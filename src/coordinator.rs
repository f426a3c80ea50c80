//! Migration Coordinator: the engine's single entry point. Loads connection
//! details from the Job Store, opens one pool per side, and walks the job's
//! table list dispatching each to its rule, isolating per-table failure from
//! the rest of the job.

use crate::config::EngineConfig;
use crate::types::{
    ColumnClassification, JobRecord, JobSpec, JobStatus, LogEvent, Rule, TableResult, TableStatus,
};
use crate::{data_replicate, introspect, job_store::JobStore, pool};
use std::time::Instant;

/// Runs `spec` to completion against `job_store`, returning the final
/// `JobRecord`. Never returns an `Err`: every failure mode (missing
/// connection, pool exhaustion, a table erroring out) is folded into the
/// record's `status`/`error_message`/per-table results instead, so the
/// caller always has a record to persist.
pub async fn run(spec: JobSpec, config: &EngineConfig, job_store: &dyn JobStore) -> JobRecord {
    let started = Instant::now();
    let mut record = JobRecord::pending(&spec);

    let result = run_inner(&spec, config, job_store, &mut record).await;

    if let Err(e) = result {
        record.status = JobStatus::Failed;
        record.error_message = Some(e.to_string());
        let _ = job_store
            .append_log(LogEvent::error(spec.job_id, None, e.to_string()))
            .await;
    } else {
        // A table failing its own migration is isolated to its TableResult;
        // the job itself only fails when connection setup (steps 1-2) never
        // let the per-table loop run at all.
        record.status = JobStatus::Completed;
    }

    record.duration_ms = Some(started.elapsed().as_millis() as u64);
    let _ = job_store.update_job(&record).await;
    record
}

/// The part of `run` that can fail as a whole (connection setup). Once both
/// pools are open, failures are scoped to individual tables and recorded in
/// `record.result` rather than propagated.
async fn run_inner(
    spec: &JobSpec,
    config: &EngineConfig,
    job_store: &dyn JobStore,
    record: &mut JobRecord,
) -> anyhow::Result<()> {
    let source_spec = job_store
        .load_connection(spec.source_connection_id)
        .await
        .map_err(|e| anyhow::anyhow!("loading source connection: {e}"))?;
    let target_spec = job_store
        .load_connection(spec.target_connection_id)
        .await
        .map_err(|e| anyhow::anyhow!("loading target connection: {e}"))?;

    let source_pool = pool::build_pool(&source_spec, config.pool_max_size)?;
    let target_pool = pool::build_pool(&target_spec, config.pool_max_size)?;

    let source_client = source_pool.get().await?;
    let target_client = target_pool.get().await?;

    if let Some(timeout) = config.statement_timeout_duration()? {
        let ms = timeout.as_millis();
        source_client
            .execute(&format!("SET statement_timeout = '{ms}ms'"), &[])
            .await?;
        target_client
            .execute(&format!("SET statement_timeout = '{ms}ms'"), &[])
            .await?;
    }

    for task in &spec.tasks {
        let outcome = run_table(
            &source_client,
            &target_client,
            &task.table_name,
            task.rule,
            spec.job_id,
            job_store,
        )
        .await;

        let result = match outcome {
            Ok(rows_migrated) => TableResult {
                table: task.table_name.clone(),
                rule: task.rule,
                rows_migrated,
                status: TableStatus::Success,
                error: None,
            },
            Err(e) => {
                let _ = job_store
                    .append_log(LogEvent::error(
                        spec.job_id,
                        Some(&task.table_name),
                        format!("table migration failed: {e}"),
                    ))
                    .await;
                TableResult {
                    table: task.table_name.clone(),
                    rule: task.rule,
                    rows_migrated: None,
                    status: TableStatus::Failed,
                    error: Some(e.to_string()),
                }
            }
        };
        record.result.push(result);
    }

    Ok(())
}

/// Dispatches one table to its rule. A closed match over `Rule` rather than
/// a trait object: the four strategies are fixed at compile time.
async fn run_table(
    source: &tokio_postgres::Client,
    target: &tokio_postgres::Client,
    table: &str,
    rule: Rule,
    job_id: uuid::Uuid,
    job_store: &dyn JobStore,
) -> anyhow::Result<Option<u64>> {
    let rule_name = match rule {
        Rule::Schema => "schema",
        Rule::Overwrite => "overwrite",
        Rule::Upsert => "upsert",
        Rule::Ignore => "ignore",
    };
    let _ = job_store
        .append_log(LogEvent::info(
            job_id,
            Some(table),
            format!("Starting migration with rule: {rule_name}"),
        ))
        .await;

    let source_columns = introspect::columns(source, table).await?;
    let classification = ColumnClassification::from_columns(&source_columns);
    let _ = job_store
        .append_log(LogEvent::info(
            job_id,
            Some(table),
            format!(
                "json columns: {:?}, array columns: {:?}",
                classification.json_columns, classification.array_columns
            ),
        ))
        .await;

    match rule {
        Rule::Schema => {
            let n = data_replicate::schema_only(source, target, table).await?;
            Ok(Some(n))
        }
        Rule::Overwrite => {
            let n = data_replicate::overwrite(source, target, table, job_id, job_store).await?;
            Ok(Some(n))
        }
        Rule::Upsert => {
            let n = data_replicate::upsert(source, target, table, job_id, job_store).await?;
            Ok(Some(n))
        }
        Rule::Ignore => {
            let n = data_replicate::insert_ignore(source, target, table, job_id, job_store).await?;
            Ok(Some(n))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_store::InMemoryJobStore;
    use crate::types::ConnectionSpec;
    use uuid::Uuid;

    #[tokio::test]
    async fn fails_whole_job_when_source_connection_is_missing() {
        let store = InMemoryJobStore::new();
        let spec = JobSpec {
            job_id: Uuid::new_v4(),
            source_connection_id: Uuid::new_v4(),
            target_connection_id: Uuid::new_v4(),
            global_rule: Rule::Schema,
            tasks: vec![],
        };
        let record = run(spec, &EngineConfig::default(), &store).await;
        assert_eq!(record.status, JobStatus::Failed);
        assert!(record.error_message.is_some());
    }

    #[tokio::test]
    async fn fails_whole_job_when_target_connection_is_missing() {
        let store = InMemoryJobStore::new();
        let source_id = Uuid::new_v4();
        store
            .insert_connection(
                source_id,
                ConnectionSpec {
                    host: "localhost".to_string(),
                    port: 5432,
                    database: "db".to_string(),
                    user: "u".to_string(),
                    password: "p".to_string(),
                    tls: Default::default(),
                },
            )
            .await;
        let spec = JobSpec {
            job_id: Uuid::new_v4(),
            source_connection_id: source_id,
            target_connection_id: Uuid::new_v4(),
            global_rule: Rule::Schema,
            tasks: vec![],
        };
        let record = run(spec, &EngineConfig::default(), &store).await;
        assert_eq!(record.status, JobStatus::Failed);
    }
}
