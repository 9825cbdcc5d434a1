//! Canonical JSON encoding used as fingerprint input.

use std::collections::BTreeMap;

use serde_json::Value;

/// Serialize a value with object keys sorted and no insignificant whitespace.
pub fn to_canonical_json(value: &Value) -> String {
  match value {
    Value::Null => "null".to_string(),
    Value::Bool(b) => b.to_string(),
    Value::Number(n) => n.to_string(),
    Value::String(s) => Value::String(s.clone()).to_string(),
    Value::Array(items) => {
      let items: Vec<String> = items.iter().map(to_canonical_json).collect();
      format!("[{}]", items.join(","))
    }
    Value::Object(map) => {
      let sorted: BTreeMap<&String, &Value> = map.iter().collect();
      let items: Vec<String> = sorted
        .into_iter()
        .map(|(k, v)| format!("{}:{}", Value::String(k.clone()), to_canonical_json(v)))
        .collect();
      format!("{{{}}}", items.join(","))
    }
  }
}
