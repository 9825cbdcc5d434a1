use serde::Serialize;
use thiserror::Error;

/// Structural problems in a workflow graph.
///
/// These are always detected before any job is dispatched and abort the
/// whole run.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum GraphError {
  #[error("duplicate step name: {0}")]
  DuplicateStep(String),

  #[error("step '{step}' declares port '{port}' more than once")]
  DuplicatePort { step: String, port: String },

  #[error("step '{step}' has an empty command")]
  EmptyCommand { step: String },

  #[error("step '{step}' references unknown step index {index}")]
  UnknownStep { step: String, index: usize },

  #[error("step '{step}' references unknown output port '{producer}.{port}'")]
  UnknownOutputPort {
    step: String,
    producer: String,
    port: String,
  },

  #[error("'{consumer}' references undeclared workflow input '{input}'")]
  UnknownWorkflowInput { consumer: String, input: String },

  #[error("step '{step}' scatters over unknown input port '{port}'")]
  UnknownScatterInput { step: String, port: String },

  #[error("dependency cycle detected: {}", path.join(" -> "))]
  Cycle { path: Vec<String> },

  #[error("required workflow input '{0}' was not provided")]
  MissingWorkflowInput(String),

  #[error("workflow input '{input}' does not match its declared type: {message}")]
  InvalidWorkflowInput { input: String, message: String },

  #[error("failed to load workflow document: {0}")]
  Load(String),
}
