//! Helpers for working with entities as JSON values

use serde_json::{Map, Value};
use std::cmp::Ordering;

/// Normalized key for an id or foreign-key value.
///
/// Strings are used as-is and numbers by their decimal form, so `7` and `"7"`
/// address the same entity. Other types are not valid keys.
pub fn key_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// The `id` of an entity, if it has a usable one
pub fn entity_id(entity: &Value) -> Option<String> {
    entity.get("id").and_then(key_of)
}

/// Shallow-merges `changes` into `target`; non-object targets are replaced
pub fn merge_into(target: &mut Value, changes: &Map<String, Value>) {
    match target {
        Value::Object(object) => {
            for (key, value) in changes {
                object.insert(key.clone(), value.clone());
            }
        }
        other => *other = Value::Object(changes.clone()),
    }
}

/// Keeps only `fields` of an object. An empty field list keeps everything.
pub fn project(entity: &Value, fields: &[String]) -> Value {
    if fields.is_empty() {
        return entity.clone();
    }
    match entity {
        Value::Object(object) => Value::Object(
            fields
                .iter()
                .filter_map(|field| object.get(field).map(|v| (field.clone(), v.clone())))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Total order over JSON scalars used for sorting rows.
///
/// Nulls sort last; values of different kinds order by kind.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(value: &Value) -> u8 {
        match value {
            Value::Bool(_) => 0,
            Value::Number(_) => 1,
            Value::String(_) => 2,
            Value::Array(_) => 3,
            Value::Object(_) => 4,
            Value::Null => 5,
        }
    }

    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}
