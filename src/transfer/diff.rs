//! Structural diff between a stored transfer and a resubmission
//!
//! Used to report exactly which fields an `InvalidModification` touched.

use serde_json::Value;

use crate::error::FieldChange;

/// Walk two JSON documents and list every leaf that differs
pub fn json_diff(before: &Value, after: &Value) -> Vec<FieldChange> {
    let mut changes = Vec::new();
    walk("", before, after, &mut changes);
    changes
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", prefix, key)
    }
}

fn walk(path: &str, before: &Value, after: &Value, out: &mut Vec<FieldChange>) {
    match (before, after) {
        (Value::Object(a), Value::Object(b)) => {
            let mut keys: Vec<&String> = a.keys().chain(b.keys()).collect();
            keys.sort();
            keys.dedup();
            for key in keys {
                let lhs = a.get(key).unwrap_or(&Value::Null);
                let rhs = b.get(key).unwrap_or(&Value::Null);
                walk(&join(path, key), lhs, rhs, out);
            }
        }
        (Value::Array(a), Value::Array(b)) => {
            for i in 0..a.len().max(b.len()) {
                let lhs = a.get(i).unwrap_or(&Value::Null);
                let rhs = b.get(i).unwrap_or(&Value::Null);
                walk(&format!("{}[{}]", path, i), lhs, rhs, out);
            }
        }
        (a, b) if a != b => out.push(FieldChange {
            path: path.to_string(),
            before: a.clone(),
            after: b.clone(),
        }),
        _ => {}
    }
}
