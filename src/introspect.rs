//! Catalog Introspector: read-only queries against `information_schema` and
//! `pg_catalog`. Every result is ordered deterministically.

use crate::types::{ColumnDescriptor, ConstraintDescriptor, ConstraintKind, IndexDescriptor, SequenceDescriptor};
use anyhow::Context;
use tokio_postgres::Client;

pub async fn columns(
    client: &Client,
    table: &str,
) -> anyhow::Result<Vec<ColumnDescriptor>> {
    let rows = client
        .query(
            "SELECT column_name, data_type, udt_name, is_nullable, \
             character_maximum_length, numeric_precision, numeric_scale, column_default \
             FROM information_schema.columns \
             WHERE table_schema = 'public' AND table_name = $1 \
             ORDER BY ordinal_position",
            &[&table],
        )
        .await
        .with_context(|| format!("introspecting columns of {table}"))?;

    Ok(rows
        .iter()
        .map(|row| ColumnDescriptor {
            name: row.get(0),
            data_type: row.get(1),
            udt_name: row.get(2),
            is_nullable: row.get::<_, String>(3) == "YES",
            character_maximum_length: row.get(4),
            numeric_precision: row.get(5),
            numeric_scale: row.get(6),
            column_default: row.get(7),
        })
        .collect())
}

pub async fn sequences(
    client: &Client,
    table: &str,
    columns: &[ColumnDescriptor],
) -> anyhow::Result<Vec<SequenceDescriptor>> {
    let mut out = Vec::new();
    for col in columns {
        let Some(default) = &col.column_default else {
            continue;
        };
        let Some(seq_name) = extract_nextval_sequence_name(default) else {
            continue;
        };

        let row = client
            .query_opt(
                "SELECT sequencename, increment_by, min_value, start_value \
                 FROM pg_sequences WHERE sequencename = $1",
                &[&seq_name],
            )
            .await
            .with_context(|| format!("introspecting sequence {seq_name}"))?;

        if let Some(row) = row {
            out.push(SequenceDescriptor {
                name: row.get(0),
                increment: row.get(1),
                minimum_value: row.get(2),
                start_value: row.get(3),
                owning_table: table.to_string(),
                owning_column: col.name.clone(),
            });
        }
    }
    Ok(out)
}

/// Extracts the sequence name from a `column_default` of shape
/// `nextval('schema.seq_name'::regclass)`, taking the last dotted component
/// and stripping quotes.
pub fn extract_nextval_sequence_name(column_default: &str) -> Option<String> {
    let start = column_default.find("nextval(")? + "nextval(".len();
    let rest = &column_default[start..];
    let quote_start = rest.find('\'')? + 1;
    let quote_end = rest[quote_start..].find('\'')? + quote_start;
    let inner = &rest[quote_start..quote_end];
    let last_component = inner.rsplit('.').next().unwrap_or(inner);
    Some(last_component.trim_matches('"').to_string())
}

pub async fn primary_key(
    client: &Client,
    table: &str,
) -> anyhow::Result<Vec<String>> {
    let rows = client
        .query(
            "SELECT a.attname \
             FROM pg_index i \
             JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey) \
             JOIN pg_class c ON c.oid = i.indrelid \
             WHERE c.relname = $1 AND i.indisprimary \
             ORDER BY array_position(i.indkey, a.attnum)",
            &[&table],
        )
        .await
        .with_context(|| format!("introspecting primary key of {table}"))?;

    Ok(rows.iter().map(|row| row.get(0)).collect())
}

pub async fn unique_constraints(
    client: &Client,
    table: &str,
) -> anyhow::Result<Vec<ConstraintDescriptor>> {
    let rows = client
        .query(
            "SELECT tc.constraint_name, kcu.column_name \
             FROM information_schema.table_constraints tc \
             JOIN information_schema.key_column_usage kcu \
               ON tc.constraint_name = kcu.constraint_name AND tc.table_schema = kcu.table_schema \
             WHERE tc.table_schema = 'public' AND tc.table_name = $1 AND tc.constraint_type = 'UNIQUE' \
             ORDER BY tc.constraint_name, kcu.ordinal_position",
            &[&table],
        )
        .await
        .with_context(|| format!("introspecting unique constraints of {table}"))?;

    let mut by_name: std::collections::BTreeMap<String, Vec<String>> = Default::default();
    for row in &rows {
        let name: String = row.get(0);
        let column: String = row.get(1);
        by_name.entry(name).or_default().push(column);
    }

    Ok(by_name
        .into_iter()
        .map(|(name, columns)| ConstraintDescriptor {
            kind: ConstraintKind::Unique,
            name,
            columns,
            referenced_table: None,
            referenced_columns: Vec::new(),
            on_update: None,
            on_delete: None,
        })
        .collect())
}

pub async fn foreign_keys(
    client: &Client,
    table: &str,
) -> anyhow::Result<Vec<ConstraintDescriptor>> {
    let rows = client
        .query(
            "SELECT con.conname, \
                    array_agg(att.attname ORDER BY u.ord) AS columns, \
                    ref.relname AS referenced_table, \
                    array_agg(refatt.attname ORDER BY u.ord) AS referenced_columns, \
                    con.confupdtype, con.confdeltype \
             FROM pg_constraint con \
             JOIN pg_class cl ON cl.oid = con.conrelid \
             JOIN pg_class ref ON ref.oid = con.confrelid \
             JOIN unnest(con.conkey, con.confkey) WITH ORDINALITY AS u(attnum, confattnum, ord) ON true \
             JOIN pg_attribute att ON att.attrelid = con.conrelid AND att.attnum = u.attnum \
             JOIN pg_attribute refatt ON refatt.attrelid = con.confrelid AND refatt.attnum = u.confattnum \
             WHERE cl.relname = $1 AND con.contype = 'f' \
             GROUP BY con.conname, ref.relname, con.confupdtype, con.confdeltype",
            &[&table],
        )
        .await
        .with_context(|| format!("introspecting foreign keys of {table}"))?;

    Ok(rows
        .iter()
        .map(|row| ConstraintDescriptor {
            kind: ConstraintKind::Foreign,
            name: row.get(0),
            columns: row.get(1),
            referenced_table: Some(row.get(2)),
            referenced_columns: row.get(3),
            on_update: Some(map_referential_action(row.get::<_, i8>(4) as u8 as char)),
            on_delete: Some(map_referential_action(row.get::<_, i8>(5) as u8 as char)),
        })
        .collect())
}

fn map_referential_action(action: char) -> String {
    match action {
        'a' => "NO ACTION",
        'r' => "RESTRICT",
        'c' => "CASCADE",
        'n' => "SET NULL",
        'd' => "SET DEFAULT",
        _ => "NO ACTION",
    }
    .to_string()
}

pub async fn indexes(
    client: &Client,
    table: &str,
) -> anyhow::Result<Vec<IndexDescriptor>> {
    let rows = client
        .query(
            "SELECT indexname, indexdef FROM pg_indexes \
             WHERE schemaname = 'public' AND tablename = $1 AND indexname NOT LIKE '%\\_pkey' ESCAPE '\\' \
             ORDER BY indexname",
            &[&table],
        )
        .await
        .with_context(|| format!("introspecting indexes of {table}"))?;

    Ok(rows
        .iter()
        .map(|row| IndexDescriptor {
            name: row.get(0),
            definition: row.get(1),
        })
        .collect())
}

pub async fn table_exists(client: &Client, table: &str) -> anyhow::Result<bool> {
    let row = client
        .query_one(
            "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
             WHERE table_schema = 'public' AND table_name = $1)",
            &[&table],
        )
        .await
        .with_context(|| format!("checking existence of {table}"))?;
    Ok(row.get(0))
}

pub async fn table_is_empty(client: &Client, table: &str) -> anyhow::Result<bool> {
    let quoted = crate::ddl::quote_ident(table)?;
    let row = client
        .query_one(&format!("SELECT NOT EXISTS (SELECT 1 FROM {quoted})"), &[])
        .await
        .with_context(|| format!("checking emptiness of {table}"))?;
    Ok(row.get(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_sequence_name_from_nextval_default() {
        assert_eq!(
            extract_nextval_sequence_name("nextval('public.t_id_seq'::regclass)"),
            Some("t_id_seq".to_string())
        );
    }

    #[test]
    fn extracts_sequence_name_without_schema_prefix() {
        assert_eq!(
            extract_nextval_sequence_name("nextval('t_id_seq'::regclass)"),
            Some("t_id_seq".to_string())
        );
    }

    #[test]
    fn extracts_sequence_name_with_quoted_identifier() {
        assert_eq!(
            extract_nextval_sequence_name("nextval('\"public\".\"Weird_Seq\"'::regclass)"),
            Some("Weird_Seq".to_string())
        );
    }

    #[test]
    fn non_nextval_default_yields_none() {
        assert_eq!(extract_nextval_sequence_name("0"), None);
        assert_eq!(extract_nextval_sequence_name("now()"), None);
    }

    #[test]
    fn referential_action_mapping() {
        assert_eq!(map_referential_action('c'), "CASCADE");
        assert_eq!(map_referential_action('n'), "SET NULL");
        assert_eq!(map_referential_action('x'), "NO ACTION");
    }
}
