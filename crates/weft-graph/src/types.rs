//! Port types and the JSON shapes used for file-like values.
//!
//! Runtime values are plain `serde_json::Value`s. Files and directories are
//! objects tagged with a `class` member:
//!
//! ```json
//! { "class": "File", "path": "/data/reads.fastq" }
//! { "class": "Directory", "path": "/data/index" }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub const FILE_CLASS: &str = "File";
pub const DIRECTORY_CLASS: &str = "Directory";

/// Declared type of a port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PortType {
  Any,
  Boolean,
  Int,
  Float,
  String,
  File,
  Directory,
  Array { items: Box<PortType> },
  Record { fields: BTreeMap<String, PortType> },
}

impl PortType {
  pub fn array_of(items: PortType) -> Self {
    PortType::Array {
      items: Box::new(items),
    }
  }

  /// Check whether a non-null value conforms to this type.
  ///
  /// `null` is handled by the port's `required` flag, not here; nested
  /// `null`s inside arrays and records are accepted so that skipped scatter
  /// slots can flow through.
  pub fn accepts(&self, value: &Value) -> bool {
    match (self, value) {
      (PortType::Any, _) => true,
      (_, Value::Null) => true,
      (PortType::Boolean, Value::Bool(_)) => true,
      (PortType::Int, Value::Number(n)) => n.is_i64() || n.is_u64(),
      (PortType::Float, Value::Number(_)) => true,
      (PortType::String, Value::String(_)) => true,
      (PortType::File, v) => class_of(v) == Some(FILE_CLASS) && path_of(v).is_some(),
      (PortType::Directory, v) => class_of(v) == Some(DIRECTORY_CLASS) && path_of(v).is_some(),
      (PortType::Array { items }, Value::Array(values)) => values.iter().all(|v| items.accepts(v)),
      (PortType::Record { fields }, Value::Object(map)) => fields
        .iter()
        .all(|(name, ty)| map.get(name).is_none_or(|v| ty.accepts(v))),
      _ => false,
    }
  }
}

/// Build a `File` value for the given path.
pub fn file_value(path: impl AsRef<Path>) -> Value {
  json!({ "class": FILE_CLASS, "path": path.as_ref().to_string_lossy() })
}

/// Build a `Directory` value for the given path.
pub fn directory_value(path: impl AsRef<Path>) -> Value {
  json!({ "class": DIRECTORY_CLASS, "path": path.as_ref().to_string_lossy() })
}

/// The `class` member of a file-like value, if any.
pub fn class_of(value: &Value) -> Option<&str> {
  value.get("class").and_then(Value::as_str)
}

/// The `path` member of a file-like value, if any.
pub fn path_of(value: &Value) -> Option<&str> {
  value.get("path").and_then(Value::as_str)
}

/// Whether the value is a `File` or `Directory` object.
pub fn is_file_like(value: &Value) -> bool {
  matches!(class_of(value), Some(FILE_CLASS) | Some(DIRECTORY_CLASS)) && path_of(value).is_some()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_scalar_types() {
    assert!(PortType::Int.accepts(&json!(5)));
    assert!(!PortType::Int.accepts(&json!(5.5)));
    assert!(PortType::Float.accepts(&json!(5)));
    assert!(PortType::String.accepts(&json!("x")));
    assert!(!PortType::Boolean.accepts(&json!("true")));
  }

  #[test]
  fn test_file_values() {
    let file = file_value("/tmp/a.txt");
    assert!(PortType::File.accepts(&file));
    assert!(!PortType::Directory.accepts(&file));
    assert!(is_file_like(&file));
    assert_eq!(path_of(&file), Some("/tmp/a.txt"));
    assert!(!PortType::File.accepts(&json!({ "path": "/tmp/a.txt" })));
  }

  #[test]
  fn test_nested_types() {
    let ints = PortType::array_of(PortType::Int);
    assert!(ints.accepts(&json!([1, 2, null])));
    assert!(!ints.accepts(&json!([1, "two"])));

    let record = PortType::Record {
      fields: BTreeMap::from([("name".to_string(), PortType::String)]),
    };
    assert!(record.accepts(&json!({ "name": "a", "extra": 1 })));
    assert!(!record.accepts(&json!({ "name": 3 })));
  }
}
