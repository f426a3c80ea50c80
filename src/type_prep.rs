//! Type Preparer: normalizes a source row into a target-insertable row given
//! the JSON/ARRAY column classification computed once per table by the
//! Catalog Introspector.

use crate::types::ColumnClassification;
use serde_json::Value;

/// A single prepared parameter, ready to bind positionally.
#[derive(Debug, Clone, PartialEq)]
pub enum PreparedValue {
    Null,
    Text(String),
    /// Already-correct JSON text for a JSON/JSONB column.
    Json(String),
    /// Array elements as text, one per element, `None` for a SQL NULL
    /// element. Bound as a native `text[]` parameter and cast element-wise
    /// on the target side rather than spliced into a `{...}` literal.
    TextArray(Vec<Option<String>>),
}

/// How a column's values are converted, computed once per table so hot-path
/// row preparation never re-checks column names or types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Json,
    Array,
    Plain,
}

/// A column-indexed schedule: `(column_name, kind)` built once per table and
/// walked positionally for every row, avoiding per-row map lookups.
pub fn build_schedule(
    column_names: &[String],
    classification: &ColumnClassification,
) -> Vec<(String, ColumnKind)> {
    column_names
        .iter()
        .map(|name| {
            let kind = if classification.json_columns.contains(name) {
                ColumnKind::Json
            } else if classification.array_columns.contains(name) {
                ColumnKind::Array
            } else {
                ColumnKind::Plain
            };
            (name.clone(), kind)
        })
        .collect()
}

/// Prepares a single value per the column's kind.
pub fn prepare_value(kind: ColumnKind, value: &Value) -> PreparedValue {
    if value.is_null() {
        return PreparedValue::Null;
    }

    match kind {
        ColumnKind::Json => prepare_json_value(value),
        ColumnKind::Array => prepare_array_value(value),
        ColumnKind::Plain => prepare_plain_value(value),
    }
}

fn prepare_json_value(value: &Value) -> PreparedValue {
    match value {
        Value::String(s) => {
            // A text value for a JSON column: pass through if it already
            // parses as JSON, otherwise wrap it as a JSON string literal.
            if serde_json::from_str::<Value>(s).is_ok() {
                PreparedValue::Json(s.clone())
            } else {
                PreparedValue::Json(
                    serde_json::to_string(&Value::String(s.clone()))
                        .unwrap_or_else(|_| "null".to_string()),
                )
            }
        }
        Value::Object(_) | Value::Array(_) => PreparedValue::Json(
            serde_json::to_string(value).unwrap_or_else(|_| "null".to_string()),
        ),
        other => PreparedValue::Json(other.to_string()),
    }
}

fn prepare_array_value(value: &Value) -> PreparedValue {
    match value {
        Value::Array(items) => PreparedValue::TextArray(
            items
                .iter()
                .map(|item| match item {
                    Value::Null => None,
                    Value::String(s) => Some(s.clone()),
                    other => Some(other.to_string()),
                })
                .collect(),
        ),
        Value::String(s) if s.starts_with('{') => PreparedValue::TextArray(parse_pg_array_literal(s)),
        Value::String(s) => PreparedValue::TextArray(vec![Some(s.clone())]),
        other => PreparedValue::TextArray(vec![Some(other.to_string())]),
    }
}

fn prepare_plain_value(value: &Value) -> PreparedValue {
    match value {
        // A structured value outside a declared JSON/ARRAY column: best
        // effort serialize so the driver receives text it can store.
        Value::Object(_) => match serde_json::to_string(value) {
            Ok(s) => PreparedValue::Json(s),
            Err(_) => PreparedValue::Null,
        },
        Value::String(s) => PreparedValue::Text(s.clone()),
        other => PreparedValue::Text(other.to_string()),
    }
}

/// Parses a PostgreSQL array literal (`{a,"b c",NULL}`) into its elements,
/// unescaping quoted entries and treating a bare `NULL` token as a SQL NULL.
fn parse_pg_array_literal(literal: &str) -> Vec<Option<String>> {
    let inner = literal
        .strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
        .unwrap_or(literal);
    if inner.is_empty() {
        return Vec::new();
    }

    let mut elements = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut was_quoted = false;
    let mut chars = inner.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if !in_quotes => {
                in_quotes = true;
                was_quoted = true;
            }
            '"' if in_quotes => in_quotes = false,
            '\\' if in_quotes => {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            ',' if !in_quotes => {
                elements.push(finish_array_element(&current, was_quoted));
                current.clear();
                was_quoted = false;
            }
            _ => current.push(c),
        }
    }
    elements.push(finish_array_element(&current, was_quoted));
    elements
}

fn finish_array_element(raw: &str, was_quoted: bool) -> Option<String> {
    if !was_quoted && raw.eq_ignore_ascii_case("NULL") {
        None
    } else {
        Some(raw.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn null_value_is_always_null() {
        assert_eq!(prepare_value(ColumnKind::Json, &Value::Null), PreparedValue::Null);
        assert_eq!(prepare_value(ColumnKind::Array, &Value::Null), PreparedValue::Null);
        assert_eq!(prepare_value(ColumnKind::Plain, &Value::Null), PreparedValue::Null);
    }

    #[test]
    fn json_column_serializes_structured_value() {
        let v = json!({"k": [1, 2]});
        assert_eq!(
            prepare_value(ColumnKind::Json, &v),
            PreparedValue::Json("{\"k\":[1,2]}".to_string())
        );
    }

    #[test]
    fn json_column_passes_through_valid_json_text() {
        let v = Value::String("{\"k\":1}".to_string());
        assert_eq!(
            prepare_value(ColumnKind::Json, &v),
            PreparedValue::Json("{\"k\":1}".to_string())
        );
    }

    #[test]
    fn json_column_wraps_invalid_json_text_as_string_literal() {
        let v = Value::String("not json".to_string());
        assert_eq!(
            prepare_value(ColumnKind::Json, &v),
            PreparedValue::Json("\"not json\"".to_string())
        );
    }

    #[test]
    fn array_column_encodes_native_sequence() {
        let v = json!(["a", "b\"c", "d\\e", null]);
        assert_eq!(
            prepare_value(ColumnKind::Array, &v),
            PreparedValue::TextArray(vec![
                Some("a".to_string()),
                Some("b\"c".to_string()),
                Some("d\\e".to_string()),
                None,
            ])
        );
    }

    #[test]
    fn array_column_passes_through_existing_literal() {
        let v = Value::String("{1,2,3}".to_string());
        assert_eq!(
            prepare_value(ColumnKind::Array, &v),
            PreparedValue::TextArray(vec![
                Some("1".to_string()),
                Some("2".to_string()),
                Some("3".to_string()),
            ])
        );
    }

    #[test]
    fn array_literal_with_quoted_elements_and_null_parses() {
        let v = Value::String("{\"a,b\",NULL,\"c\\\"d\"}".to_string());
        assert_eq!(
            prepare_value(ColumnKind::Array, &v),
            PreparedValue::TextArray(vec![
                Some("a,b".to_string()),
                None,
                Some("c\"d".to_string()),
            ])
        );
    }

    #[test]
    fn array_of_numbers_has_no_quotes() {
        let v = json!([1, 2, 3]);
        assert_eq!(
            prepare_value(ColumnKind::Array, &v),
            PreparedValue::TextArray(vec![
                Some("1".to_string()),
                Some("2".to_string()),
                Some("3".to_string()),
            ])
        );
    }

    #[test]
    fn plain_column_passes_scalar_through() {
        let v = Value::String("hello".to_string());
        assert_eq!(prepare_value(ColumnKind::Plain, &v), PreparedValue::Text("hello".to_string()));
    }

    #[test]
    fn plain_column_serializes_unexpected_object() {
        let v = json!({"a": 1});
        assert_eq!(
            prepare_value(ColumnKind::Plain, &v),
            PreparedValue::Json("{\"a\":1}".to_string())
        );
    }

    #[test]
    fn schedule_is_column_indexed_and_positional() {
        let mut classification = ColumnClassification::default();
        classification.json_columns.insert("data".to_string());
        classification.array_columns.insert("tags".to_string());
        let names = vec!["id".to_string(), "data".to_string(), "tags".to_string()];
        let schedule = build_schedule(&names, &classification);
        assert_eq!(
            schedule,
            vec![
                ("id".to_string(), ColumnKind::Plain),
                ("data".to_string(), ColumnKind::Json),
                ("tags".to_string(), ColumnKind::Array),
            ]
        );
    }
}
