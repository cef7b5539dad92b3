//! Dynamic lookups over parsed YAML records.

use crate::model::UNKNOWN_NODE_VALUE;
use crate::utils::{HistoryError, Result};
use serde_yaml::Value;

/// Scalar value stored under `key` in a mapping record, or the `"unknown"`
/// sentinel when the record is not a mapping or the key is missing.
pub fn node_value(record: &Value, key: &str) -> String {
    let Some(mapping) = record.as_mapping() else {
        return UNKNOWN_NODE_VALUE.to_string();
    };

    match mapping.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Tagged(tagged)) => node_value_of_scalar(&tagged.value),
        _ => UNKNOWN_NODE_VALUE.to_string(),
    }
}

fn node_value_of_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => UNKNOWN_NODE_VALUE.to_string(),
    }
}

/// Parse a document whose root must be a sequence of records. An empty
/// document is treated as an empty sequence.
pub fn parse_records(content: &[u8]) -> Result<Vec<Value>> {
    if content.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(Vec::new());
    }

    match serde_yaml::from_slice::<Value>(content)? {
        Value::Sequence(records) => Ok(records),
        Value::Null => Ok(Vec::new()),
        other => Err(HistoryError::InvalidDocument(format!(
            "expected a sequence of records at the document root, found {}",
            kind_of(&other)
        ))),
    }
}

/// Serialize records back into a sequence document.
pub fn serialize_records(records: Vec<Value>) -> Result<String> {
    Ok(serde_yaml::to_string(&Value::Sequence(records))?)
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a sequence",
        Value::Mapping(_) => "a mapping",
        Value::Tagged(_) => "a tagged value",
    }
}
