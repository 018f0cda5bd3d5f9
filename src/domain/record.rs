//! Rows as they travel between the relational store, the cache and callers.

use std::cmp::Ordering;

use serde_json::{Map, Value};

/// A single column value. Only JSON scalars are expected in records.
pub type Scalar = Value;

/// A row: column name to scalar, in the order the store returned the columns.
pub type Record = Map<String, Value>;

/// String form of a scalar as it appears inside a composite identifier.
pub fn key_part(value: &Scalar) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Whether the value can act as a key component.
pub fn is_scalar(value: &Value) -> bool {
    !matches!(value, Value::Array(_) | Value::Object(_))
}

fn as_number(value: &Scalar) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        Value::Bool(flag) => Some(if *flag { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Orders two scalars: numerically when both read as numbers, lexically otherwise.
/// Nulls sort first.
pub fn compare_scalars(left: &Scalar, right: &Scalar) -> Ordering {
    match (left, right) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        _ => match (as_number(left), as_number(right)) {
            (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
            _ => key_part(left).cmp(&key_part(right)),
        },
    }
}

/// Keeps only `columns` (plus `always_keep`) in the record. An empty column list keeps everything.
pub fn project(record: &mut Record, columns: &[String], always_keep: &[&str]) {
    if columns.is_empty() {
        return;
    }
    record.retain(|name, _| {
        columns.iter().any(|column| column == name) || always_keep.contains(&name.as_str())
    });
}
