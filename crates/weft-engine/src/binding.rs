//! Output binding: turning what a command left behind into port values.

use std::collections::BTreeMap;

use serde_json::{Map, Value, json};
use tracing::debug;
use weft_backend::BackendOutput;
use weft_cache::CacheStore;
use weft_graph::{DIRECTORY_CLASS, FILE_CLASS, OutputBinding, OutputPort, PortType, Step};

use crate::error::JobError;

/// Bound outputs plus the blobs they reference.
#[derive(Debug, Default)]
pub(crate) struct BoundOutputs {
  pub outputs: Map<String, Value>,
  /// Blob path -> content hash.
  pub artifacts: BTreeMap<String, String>,
}

pub(crate) async fn bind_outputs(
  step: &Step,
  output: &BackendOutput,
  cache: &CacheStore,
) -> Result<BoundOutputs, JobError> {
  let mut bound = BoundOutputs::default();
  let mut stdout: Option<String> = None;

  for port in &step.outputs {
    let value = match &port.binding {
      OutputBinding::File { path } => {
        let produced = output.workdir.join(path);
        if tokio::fs::metadata(&produced).await.is_err() {
          Value::Null
        } else {
          let blob = cache
            .publish(&produced)
            .await
            .map_err(|e| binding_error(port, format!("cannot publish '{}': {}", path, e)))?;
          let class = match port.port_type {
            PortType::Directory => DIRECTORY_CLASS,
            _ => FILE_CLASS,
          };
          let blob_path = blob.path.to_string_lossy().into_owned();
          bound.artifacts.insert(blob_path.clone(), blob.hash.clone());
          json!({
            "class": class,
            "path": blob_path,
            "checksum": format!("sha256:{}", blob.hash),
          })
        }
      }
      OutputBinding::Stdout => {
        let text = read_stdout(&mut stdout, output, port).await?.trim().to_string();
        match port.port_type {
          PortType::Int | PortType::Float | PortType::Boolean => serde_json::from_str(&text)
            .map_err(|e| binding_error(port, format!("stdout is not a {:?}: {}", port.port_type, e)))?,
          _ => Value::String(text),
        }
      }
      OutputBinding::Json { key } => {
        let text = read_stdout(&mut stdout, output, port).await?;
        let parsed: Value = serde_json::from_str(text)
          .map_err(|e| binding_error(port, format!("stdout is not valid JSON: {}", e)))?;
        match key {
          Some(key) => parsed.get(key).cloned().unwrap_or(Value::Null),
          None => parsed,
        }
      }
    };

    if value.is_null() {
      if port.required {
        return Err(binding_error(port, "required output was not produced".to_string()));
      }
    } else if !port.port_type.accepts(&value) {
      return Err(binding_error(
        port,
        format!("value {} does not match type {:?}", value, port.port_type),
      ));
    }

    debug!(port = %port.name, "output_bound");
    bound.outputs.insert(port.name.clone(), value);
  }

  Ok(bound)
}

async fn read_stdout<'a>(
  cached: &'a mut Option<String>,
  output: &BackendOutput,
  port: &OutputPort,
) -> Result<&'a str, JobError> {
  if cached.is_none() {
    let text = tokio::fs::read_to_string(&output.stdout_ref)
      .await
      .map_err(|e| binding_error(port, format!("cannot read stdout: {}", e)))?;
    *cached = Some(text);
  }
  Ok(cached.as_deref().unwrap_or_default())
}

fn binding_error(port: &OutputPort, message: String) -> JobError {
  JobError::OutputBinding {
    port: port.name.clone(),
    message,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::path::PathBuf;

  async fn fixture(stdout: &str) -> (tempfile::TempDir, BackendOutput, CacheStore) {
    let dir = tempfile::tempdir().unwrap();
    let workdir = dir.path().join("work");
    std::fs::create_dir_all(&workdir).unwrap();
    std::fs::write(dir.path().join("stdout"), stdout).unwrap();
    std::fs::write(dir.path().join("stderr"), "").unwrap();
    let cache = CacheStore::open(dir.path().join("cache")).await.unwrap();
    let output = BackendOutput {
      exit_code: 0,
      cancelled: false,
      workdir,
      produced_paths: Vec::<PathBuf>::new(),
      stdout_ref: dir.path().join("stdout"),
      stderr_ref: dir.path().join("stderr"),
    };
    (dir, output, cache)
  }

  #[tokio::test]
  async fn test_stdout_and_json_bindings() {
    let (_dir, output, cache) = fixture("{\"count\": 42, \"name\": \"x\"}\n").await;
    let step = Step::new("s", ["true"])
      .output("raw", PortType::String, OutputBinding::Stdout)
      .output(
        "count",
        PortType::Int,
        OutputBinding::Json {
          key: Some("count".into()),
        },
      );

    let bound = bind_outputs(&step, &output, &cache).await.unwrap();
    assert_eq!(bound.outputs["raw"], json!("{\"count\": 42, \"name\": \"x\"}"));
    assert_eq!(bound.outputs["count"], json!(42));
    assert!(bound.artifacts.is_empty());
  }

  #[tokio::test]
  async fn test_file_binding_publishes_blob() {
    let (_dir, output, cache) = fixture("").await;
    std::fs::write(output.workdir.join("result.txt"), "done").unwrap();
    let step = Step::new("s", ["true"]).output(
      "result",
      PortType::File,
      OutputBinding::File {
        path: "result.txt".into(),
      },
    );

    let bound = bind_outputs(&step, &output, &cache).await.unwrap();
    let value = &bound.outputs["result"];
    let path = value["path"].as_str().unwrap();
    assert!(path.starts_with(cache.root().to_str().unwrap()));
    assert_eq!(std::fs::read_to_string(path).unwrap(), "done");
    assert!(value["checksum"].as_str().unwrap().starts_with("sha256:"));
    assert_eq!(bound.artifacts.len(), 1);
  }

  #[tokio::test]
  async fn test_missing_outputs() {
    let (_dir, output, cache) = fixture("").await;
    let required = Step::new("s", ["true"]).output(
      "result",
      PortType::File,
      OutputBinding::File {
        path: "nope.txt".into(),
      },
    );
    assert!(matches!(
      bind_outputs(&required, &output, &cache).await,
      Err(JobError::OutputBinding { .. })
    ));

    let mut optional = required.clone();
    optional.outputs[0].required = false;
    let bound = bind_outputs(&optional, &output, &cache).await.unwrap();
    assert_eq!(bound.outputs["result"], Value::Null);
  }
}
