//! Data Replicator: batched copy implementing overwrite / upsert /
//! insert-ignore, plus the zero-rows schema-only rule.

use crate::config::OVERWRITE_BATCH_SIZE;
use crate::ddl::{self, quote_ident};
use crate::introspect;
use crate::type_prep::{self, ColumnKind, PreparedValue};
use crate::types::{ColumnClassification, ColumnDescriptor, LogEvent};
use anyhow::Context;
use serde_json::Value;
use std::future::Future;
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::{Client, Row};
use uuid::Uuid;

/// Runs `body` with the connection's `session_replication_role` set to
/// `replica`, restoring it on every exit path including an error from
/// `body` itself.
async fn with_replica_session<F, Fut, T>(client: &Client, body: F) -> anyhow::Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    client
        .execute("SET session_replication_role = replica", &[])
        .await
        .context("entering replica session")?;
    let result = body().await;
    if let Err(e) = client
        .execute("SET session_replication_role = DEFAULT", &[])
        .await
    {
        tracing::warn!("failed to restore session_replication_role: {e}");
    }
    result
}

/// Reads a driver row into a generic JSON map, keyed by column name, using
/// the column's reported Postgres type to pick the right `FromSql` impl.
pub fn row_to_json_map(row: &Row) -> anyhow::Result<serde_json::Map<String, Value>> {
    let mut map = serde_json::Map::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let value = pg_value_to_json(row, idx, column.type_())?;
        map.insert(column.name().to_string(), value);
    }
    Ok(map)
}

fn pg_value_to_json(row: &Row, idx: usize, ty: &Type) -> anyhow::Result<Value> {
    use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};

    let value = match *ty {
        Type::BOOL => row.try_get::<_, Option<bool>>(idx)?.map(Value::Bool),
        Type::INT2 => row
            .try_get::<_, Option<i16>>(idx)?
            .map(|v| Value::Number(v.into())),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(idx)?
            .map(|v| Value::Number(v.into())),
        Type::INT8 => row
            .try_get::<_, Option<i64>>(idx)?
            .map(|v| Value::Number(v.into())),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(idx)?
            .and_then(|v| serde_json::Number::from_f64(v as f64))
            .map(Value::Number),
        Type::FLOAT8 => row
            .try_get::<_, Option<f64>>(idx)?
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number),
        Type::NUMERIC => row
            .try_get::<_, Option<rust_decimal::Decimal>>(idx)?
            .map(|v| Value::String(v.to_string())),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => {
            row.try_get::<_, Option<String>>(idx)?.map(Value::String)
        }
        Type::TIMESTAMP => row
            .try_get::<_, Option<NaiveDateTime>>(idx)?
            .map(|v| Value::String(v.format("%Y-%m-%dT%H:%M:%S%.f").to_string())),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)?
            .map(|v| Value::String(v.to_rfc3339())),
        Type::DATE => row
            .try_get::<_, Option<NaiveDate>>(idx)?
            .map(|v| Value::String(v.to_string())),
        Type::TIME => row
            .try_get::<_, Option<NaiveTime>>(idx)?
            .map(|v| Value::String(v.to_string())),
        Type::JSON | Type::JSONB => row.try_get::<_, Option<Value>>(idx)?,
        Type::UUID => row
            .try_get::<_, Option<Uuid>>(idx)?
            .map(|v| Value::String(v.to_string())),
        Type::BYTEA => row
            .try_get::<_, Option<Vec<u8>>>(idx)?
            .map(|v| Value::String(hex_encode(&v))),
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY => row
            .try_get::<_, Option<Vec<Option<String>>>>(idx)?
            .map(|v| Value::Array(v.into_iter().map(|s| s.map(Value::String).unwrap_or(Value::Null)).collect())),
        Type::INT4_ARRAY => row
            .try_get::<_, Option<Vec<Option<i32>>>>(idx)?
            .map(|v| Value::Array(v.into_iter().map(|n| n.map(|n| Value::Number(n.into())).unwrap_or(Value::Null)).collect())),
        Type::INT8_ARRAY => row
            .try_get::<_, Option<Vec<Option<i64>>>>(idx)?
            .map(|v| Value::Array(v.into_iter().map(|n| n.map(|n| Value::Number(n.into())).unwrap_or(Value::Null)).collect())),
        Type::BOOL_ARRAY => row
            .try_get::<_, Option<Vec<Option<bool>>>>(idx)?
            .map(|v| Value::Array(v.into_iter().map(|b| b.map(Value::Bool).unwrap_or(Value::Null)).collect())),
        _ => {
            // Fall back to text representation for anything not handled
            // above rather than failing the whole row.
            row.try_get::<_, Option<String>>(idx)
                .ok()
                .flatten()
                .map(Value::String)
        }
    };
    Ok(value.unwrap_or(Value::Null))
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::from("\\x");
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Prepares a full row for insertion, returning owned SQL-literal text per
/// column (JSON already serialized, arrays already encoded) in schedule
/// order.
fn prepare_row(
    map: &serde_json::Map<String, Value>,
    schedule: &[(String, ColumnKind)],
) -> Vec<PreparedValue> {
    schedule
        .iter()
        .map(|(name, kind)| {
            let value = map.get(name).unwrap_or(&Value::Null);
            type_prep::prepare_value(*kind, value)
        })
        .collect()
}

/// Boxes prepared values for binding, picking the `None` shape that matches
/// the column's parameter type: array columns bind a `text[]` parameter, so
/// a null array column must bind `Option<Vec<_>>::None` rather than
/// `Option<String>::None`, or the driver rejects it client-side before the
/// cast below ever runs.
fn prepared_to_sql(
    values: &[PreparedValue],
    kinds: &[ColumnKind],
) -> Vec<Box<dyn ToSql + Sync + Send>> {
    values
        .iter()
        .zip(kinds.iter())
        .map(|(v, kind)| -> Box<dyn ToSql + Sync + Send> {
            match (v, kind) {
                (PreparedValue::Null, ColumnKind::Array) => Box::new(Option::<Vec<Option<String>>>::None),
                (PreparedValue::Null, _) => Box::new(Option::<String>::None),
                (PreparedValue::Text(s), _) => Box::new(s.clone()),
                (PreparedValue::Json(s), _) => Box::new(s.clone()),
                (PreparedValue::TextArray(items), _) => Box::new(items.clone()),
            }
        })
        .collect()
}

/// tokio-postgres resolves an unconstrained parameter's type from how it's
/// used (here, the target column), then checks the bound Rust value's
/// `ToSql::accepts` against that resolved type before anything is sent to
/// the server. Every `PreparedValue` is bound as text (or `text[]` for
/// arrays), so casting straight to the column's type would pin the
/// parameter to that type and reject the text/array binding with the same
/// `WrongType` error we're working around. Casting through an explicit
/// intermediate type first (`::text` or `::text[]`) pins the parameter to
/// that type instead, and the second cast then coerces the value server-side.
fn cast_suffix(col: &ColumnDescriptor, kind: ColumnKind) -> String {
    let mapped = ddl::map_column_type(col);
    match kind {
        ColumnKind::Array => format!("::text[]::{mapped}"),
        ColumnKind::Json | ColumnKind::Plain => format!("::text::{mapped}"),
    }
}

fn build_casts(columns: &[ColumnDescriptor], schedule: &[(String, ColumnKind)]) -> Vec<String> {
    columns
        .iter()
        .zip(schedule.iter())
        .map(|(col, (_, kind))| cast_suffix(col, *kind))
        .collect()
}

fn build_kinds(schedule: &[(String, ColumnKind)]) -> Vec<ColumnKind> {
    schedule.iter().map(|(_, kind)| *kind).collect()
}

/// Renders `$1::cast1, $2::cast2, ...` starting at `base + 1`.
fn placeholders_with_casts(casts: &[String], base: usize) -> String {
    casts
        .iter()
        .enumerate()
        .map(|(i, cast)| format!("${}{cast}", base + i + 1))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Rule: schema-only. Reports the number of columns added, never rows.
pub async fn schema_only(
    source: &Client,
    target: &Client,
    table: &str,
) -> anyhow::Result<u64> {
    let changes = ddl::replay_schema(source, target, table).await?;
    Ok(changes.columns_added.len() as u64)
}

/// Rule: overwrite. Truncates (if non-empty) and reloads in 500-row batches.
pub async fn overwrite(
    source: &Client,
    target: &Client,
    table: &str,
    job_id: Uuid,
    job_store: &dyn crate::job_store::JobStore,
) -> anyhow::Result<u64> {
    if !introspect::table_exists(target, table).await? {
        ddl::replay_schema(source, target, table).await?;
        let _ = job_store
            .append_log(LogEvent::info(
                job_id,
                Some(table),
                "target table did not exist, created via schema replay",
            ))
            .await;
    }

    let source_columns = introspect::columns(source, table).await?;
    let classification = ColumnClassification::from_columns(&source_columns);
    let column_names: Vec<String> = source_columns.iter().map(|c| c.name.clone()).collect();
    let schedule = type_prep::build_schedule(&column_names, &classification);
    let casts = build_casts(&source_columns, &schedule);
    let kinds = build_kinds(&schedule);

    let quoted_table = quote_ident(table)?;

    if !introspect::table_is_empty(target, table).await? {
        with_replica_session(target, || async {
            target
                .execute(&format!("TRUNCATE TABLE {quoted_table} CASCADE"), &[])
                .await
                .context("truncating target table")?;
            Ok(())
        })
        .await?;
    }

    let mut total_migrated: u64 = 0;
    let mut offset: i64 = 0;
    loop {
        let query = format!(
            "SELECT * FROM {quoted_table} LIMIT {OVERWRITE_BATCH_SIZE} OFFSET {offset}"
        );
        let rows = source.query(&query, &[]).await.context("fetching batch from source")?;
        let batch_len = rows.len();
        if batch_len == 0 {
            break;
        }

        let prepared_rows: Vec<Vec<PreparedValue>> = rows
            .iter()
            .map(|r| -> anyhow::Result<Vec<PreparedValue>> {
                Ok(prepare_row(&row_to_json_map(r)?, &schedule))
            })
            .collect::<anyhow::Result<_>>()?;

        let inserted = with_replica_session(target, || async {
            insert_batch(
                target,
                &quoted_table,
                &column_names,
                &prepared_rows,
                &casts,
                &kinds,
                job_id,
                table,
                job_store,
            )
            .await
        })
        .await?;

        total_migrated += inserted;
        offset += batch_len as i64;

        if batch_len < OVERWRITE_BATCH_SIZE {
            break;
        }
    }

    reset_sequences(source, target, table, &source_columns).await?;
    replay_unique_constraints(source, target, table).await?;

    Ok(total_migrated)
}

/// Bulk-inserts a batch; on failure, falls back to per-row insert within the
/// same (already acquired) replica session, counting only rows that succeed.
async fn insert_batch(
    target: &Client,
    quoted_table: &str,
    column_names: &[String],
    rows: &[Vec<PreparedValue>],
    casts: &[String],
    kinds: &[ColumnKind],
    job_id: Uuid,
    table: &str,
    job_store: &dyn crate::job_store::JobStore,
) -> anyhow::Result<u64> {
    if rows.is_empty() {
        return Ok(0);
    }

    let quoted_columns: Vec<String> = column_names
        .iter()
        .map(|c| quote_ident(c))
        .collect::<anyhow::Result<_>>()?;

    let mut values_sql = Vec::new();
    let mut all_params: Vec<Box<dyn ToSql + Sync + Send>> = Vec::new();
    for row in rows {
        let base = all_params.len();
        values_sql.push(format!("({})", placeholders_with_casts(casts, base)));
        all_params.extend(prepared_to_sql(row, kinds));
    }

    let stmt = format!(
        "INSERT INTO {quoted_table} ({}) VALUES {}",
        quoted_columns.join(", "),
        values_sql.join(", ")
    );
    let param_refs: Vec<&(dyn ToSql + Sync)> =
        all_params.iter().map(|p| p.as_ref() as &(dyn ToSql + Sync)).collect();

    match target.execute(&stmt, &param_refs).await {
        Ok(n) => Ok(n),
        Err(e) => {
            let _ = job_store
                .append_log(LogEvent::warning(
                    job_id,
                    Some(table),
                    format!("batch insert failed ({e}), falling back to per-row insert"),
                ))
                .await;
            insert_rows_one_by_one(
                target,
                quoted_table,
                &quoted_columns,
                rows,
                casts,
                kinds,
                job_id,
                table,
                job_store,
            )
            .await
        }
    }
}

async fn insert_rows_one_by_one(
    target: &Client,
    quoted_table: &str,
    quoted_columns: &[String],
    rows: &[Vec<PreparedValue>],
    casts: &[String],
    kinds: &[ColumnKind],
    job_id: Uuid,
    table: &str,
    job_store: &dyn crate::job_store::JobStore,
) -> anyhow::Result<u64> {
    let placeholders_sql = placeholders_with_casts(casts, 0);
    let stmt = format!(
        "INSERT INTO {quoted_table} ({}) VALUES ({placeholders_sql})",
        quoted_columns.join(", ")
    );

    let mut succeeded = 0u64;
    for row in rows {
        let params = prepared_to_sql(row, kinds);
        let param_refs: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|p| p.as_ref() as &(dyn ToSql + Sync)).collect();
        match target.execute(&stmt, &param_refs).await {
            Ok(_) => succeeded += 1,
            Err(e) => {
                let payload = format!("{row:?}");
                let truncated: String = payload.chars().take(200).collect();
                let _ = job_store
                    .append_log(LogEvent::error(
                        job_id,
                        Some(table),
                        format!("row insert failed: {e}; payload: {truncated}"),
                    ))
                    .await;
            }
        }
    }
    Ok(succeeded)
}

async fn reset_sequences(
    source: &Client,
    target: &Client,
    table: &str,
    source_columns: &[ColumnDescriptor],
) -> anyhow::Result<()> {
    let sequences = introspect::sequences(source, table, source_columns).await?;
    for seq in sequences {
        let quoted_col = quote_ident(&seq.owning_column)?;
        let quoted_table = quote_ident(table)?;
        let row = target
            .query_one(
                &format!("SELECT max({quoted_col})::bigint FROM {quoted_table}"),
                &[],
            )
            .await
            .with_context(|| format!("reading max({}) for sequence reset", seq.owning_column))?;
        let max: Option<i64> = row.get(0);
        let next = max.map(|m| m + 1).unwrap_or(1);
        target
            .execute(
                "SELECT setval($1, $2, false)",
                &[&seq.name, &next],
            )
            .await
            .with_context(|| format!("resetting sequence {}", seq.name))?;
    }
    Ok(())
}

async fn replay_unique_constraints(
    source: &Client,
    target: &Client,
    table: &str,
) -> anyhow::Result<()> {
    let constraints = introspect::unique_constraints(source, table).await?;
    let quoted_table = quote_ident(table)?;
    for c in constraints {
        let quoted_name = quote_ident(&c.name)?;
        let quoted_cols: Vec<String> = c
            .columns
            .iter()
            .map(|col| quote_ident(col))
            .collect::<anyhow::Result<_>>()?;
        let stmt = format!(
            "ALTER TABLE {quoted_table} ADD CONSTRAINT {quoted_name} UNIQUE ({})",
            quoted_cols.join(", ")
        );
        if let Err(e) = target.execute(&stmt, &[]).await {
            if !e.to_string().contains("already exists") {
                return Err(e).context("replaying unique constraint");
            }
        }
    }
    Ok(())
}

/// Rule: upsert. Reads all source rows (no batching), inserts with
/// `ON CONFLICT (<pk>) DO UPDATE SET <all non-pk columns> = EXCLUDED.*`.
pub async fn upsert(
    source: &Client,
    target: &Client,
    table: &str,
    job_id: Uuid,
    job_store: &dyn crate::job_store::JobStore,
) -> anyhow::Result<u64> {
    let source_columns = introspect::columns(source, table).await?;
    let classification = ColumnClassification::from_columns(&source_columns);
    let column_names: Vec<String> = source_columns.iter().map(|c| c.name.clone()).collect();
    let schedule = type_prep::build_schedule(&column_names, &classification);
    let casts = build_casts(&source_columns, &schedule);
    let kinds = build_kinds(&schedule);

    let mut pk_columns = introspect::primary_key(target, table).await?;
    if pk_columns.is_empty() {
        pk_columns = vec!["id".to_string()];
    }

    let quoted_table = quote_ident(table)?;
    let quoted_columns: Vec<String> = column_names
        .iter()
        .map(|c| quote_ident(c))
        .collect::<anyhow::Result<_>>()?;
    let quoted_pk: Vec<String> = pk_columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<anyhow::Result<_>>()?;

    let non_pk_columns: Vec<&String> = column_names
        .iter()
        .filter(|c| !pk_columns.contains(c))
        .collect();
    let set_clause: Vec<String> = non_pk_columns
        .iter()
        .map(|c| {
            let q = quote_ident(c)?;
            Ok(format!("{q} = EXCLUDED.{q}"))
        })
        .collect::<anyhow::Result<_>>()?;

    let placeholders_sql = placeholders_with_casts(&casts, 0);
    let stmt = format!(
        "INSERT INTO {quoted_table} ({}) VALUES ({placeholders_sql}) \
         ON CONFLICT ({}) DO UPDATE SET {}",
        quoted_columns.join(", "),
        quoted_pk.join(", "),
        set_clause.join(", "),
    );

    let quoted_source_table = quote_ident(table)?;
    let rows = source
        .query(&format!("SELECT * FROM {quoted_source_table}"), &[])
        .await
        .context("fetching rows for upsert")?;

    let mut succeeded = 0u64;
    for row in &rows {
        let map = row_to_json_map(row)?;
        let prepared = prepare_row(&map, &schedule);
        let params = prepared_to_sql(&prepared, &kinds);
        let param_refs: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|p| p.as_ref() as &(dyn ToSql + Sync)).collect();
        match target.execute(&stmt, &param_refs).await {
            Ok(_) => succeeded += 1,
            Err(e) => {
                let _ = job_store
                    .append_log(LogEvent::error(job_id, Some(table), format!("upsert row failed: {e}")))
                    .await;
            }
        }
    }

    Ok(succeeded)
}

/// Rule: insert-ignore. Reads all source rows; duplicate-key / unique
/// violations are silently skipped (the rule's defining behavior); anything
/// else is logged.
pub async fn insert_ignore(
    source: &Client,
    target: &Client,
    table: &str,
    job_id: Uuid,
    job_store: &dyn crate::job_store::JobStore,
) -> anyhow::Result<u64> {
    let source_columns = introspect::columns(source, table).await?;
    let classification = ColumnClassification::from_columns(&source_columns);
    let column_names: Vec<String> = source_columns.iter().map(|c| c.name.clone()).collect();
    let schedule = type_prep::build_schedule(&column_names, &classification);
    let casts = build_casts(&source_columns, &schedule);
    let kinds = build_kinds(&schedule);

    let quoted_table = quote_ident(table)?;
    let quoted_columns: Vec<String> = column_names
        .iter()
        .map(|c| quote_ident(c))
        .collect::<anyhow::Result<_>>()?;
    let placeholders_sql = placeholders_with_casts(&casts, 0);
    let stmt = format!(
        "INSERT INTO {quoted_table} ({}) VALUES ({placeholders_sql})",
        quoted_columns.join(", "),
    );

    let rows = source
        .query(&format!("SELECT * FROM {quoted_table}"), &[])
        .await
        .context("fetching rows for insert-ignore")?;

    let mut succeeded = 0u64;
    for row in &rows {
        let map = row_to_json_map(row)?;
        let prepared = prepare_row(&map, &schedule);
        let params = prepared_to_sql(&prepared, &kinds);
        let param_refs: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|p| p.as_ref() as &(dyn ToSql + Sync)).collect();
        match target.execute(&stmt, &param_refs).await {
            Ok(_) => succeeded += 1,
            Err(e) => {
                let msg = e.to_string();
                if msg.contains("duplicate key") || msg.contains("unique constraint") {
                    continue;
                }
                let _ = job_store
                    .append_log(LogEvent::error(job_id, Some(table), format!("insert-ignore row failed: {e}")))
                    .await;
            }
        }
    }

    Ok(succeeded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ColumnDescriptor;

    fn column(data_type: &str, udt_name: &str) -> ColumnDescriptor {
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
    fn placeholders_with_casts_pins_parameter_type_then_casts() {
        let casts = vec!["::text::integer".to_string(), "::text::jsonb".to_string()];
        assert_eq!(
            placeholders_with_casts(&casts, 0),
            "$1::text::integer, $2::text::jsonb"
        );
    }

    #[test]
    fn placeholders_with_casts_honors_base_offset_for_batched_rows() {
        let casts = vec!["::text::integer".to_string()];
        assert_eq!(placeholders_with_casts(&casts, 2), "$3::text::integer");
    }

    #[test]
    fn cast_suffix_pins_plain_and_json_params_as_text() {
        let int_col = column("integer", "int4");
        assert_eq!(cast_suffix(&int_col, ColumnKind::Plain), "::text::integer");

        let json_col = column("jsonb", "jsonb");
        assert_eq!(cast_suffix(&json_col, ColumnKind::Json), "::text::jsonb");
    }

    #[test]
    fn cast_suffix_pins_array_params_as_text_array() {
        let array_col = column("ARRAY", "_int4");
        assert_eq!(cast_suffix(&array_col, ColumnKind::Array), "::text[]::int4[]");
    }

    #[test]
    fn hex_encode_produces_postgres_bytea_hex_format() {
        assert_eq!(hex_encode(&[0x00, 0xff, 0x1a]), "\\x00ff1a");
    }

    #[test]
    fn prepare_row_falls_back_to_null_for_missing_column() {
        let map = serde_json::Map::new();
        let schedule = vec![("missing".to_string(), ColumnKind::Plain)];
        let prepared = prepare_row(&map, &schedule);
        assert_eq!(prepared, vec![PreparedValue::Null]);
    }

    #[test]
    fn prepared_to_sql_binds_null_array_as_typed_none() {
        let values = vec![PreparedValue::Null];
        let kinds = vec![ColumnKind::Array];
        let boxed = prepared_to_sql(&values, &kinds);
        assert_eq!(boxed.len(), 1);
    }
}
