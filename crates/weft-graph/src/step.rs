use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::graph::StepId;
use crate::types::PortType;

/// Where an input port gets its value from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
  /// A constant value baked into the graph.
  Literal(Value),
  /// A named workflow-level input.
  WorkflowInput(String),
  /// An output port of another step.
  StepOutput { step: StepId, port: String },
}

/// An input port of a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputPort {
  pub name: String,
  pub port_type: PortType,
  #[serde(default = "default_true")]
  pub required: bool,
  pub source: Source,
  /// Used when the source resolves to `null`.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub default: Option<Value>,
}

/// How a step output is extracted after the command finishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "from", rename_all = "snake_case")]
pub enum OutputBinding {
  /// A file the command wrote, relative to its working directory.
  File { path: String },
  /// Captured standard output, trimmed.
  Stdout,
  /// Standard output parsed as JSON, optionally selecting one key.
  Json {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key: Option<String>,
  },
}

/// An output port of a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputPort {
  pub name: String,
  pub port_type: PortType,
  #[serde(default = "default_true")]
  pub required: bool,
  pub binding: OutputBinding,
}

/// Scatter specification over named input ports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "inputs", rename_all = "snake_case")]
pub enum Scatter {
  #[default]
  None,
  /// Zip the listed arrays element-wise; lengths must match.
  Dot(Vec<String>),
  /// Cross product of the listed arrays; outputs nest one level per input.
  Nested(Vec<String>),
}

impl Scatter {
  pub fn inputs(&self) -> &[String] {
    match self {
      Scatter::None => &[],
      Scatter::Dot(inputs) | Scatter::Nested(inputs) => inputs,
    }
  }

  pub fn is_scattered(&self) -> bool {
    !self.inputs().is_empty()
  }
}

/// Container image requirement. Selects the containerized backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRequirement {
  pub image: String,
}

/// Resource and execution requirements declared by a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Requirements {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub container: Option<ContainerRequirement>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub cpus: Option<f64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub memory_mb: Option<u64>,
  /// Exit codes that count as success.
  #[serde(default = "default_success_codes")]
  pub success_codes: Vec<i32>,
  /// Overrides the run-wide per-job timeout.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub timeout_ms: Option<u64>,
}

impl Default for Requirements {
  fn default() -> Self {
    Self {
      container: None,
      cpus: None,
      memory_mb: None,
      success_codes: default_success_codes(),
      timeout_ms: None,
    }
  }
}

impl Requirements {
  pub fn is_success(&self, exit_code: i32) -> bool {
    self.success_codes.contains(&exit_code)
  }
}

/// Static definition of one unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
  pub name: String,
  /// Argument vector; each element is a minijinja template rendered against
  /// `inputs`.
  pub command: Vec<String>,
  #[serde(default)]
  pub inputs: Vec<InputPort>,
  #[serde(default)]
  pub outputs: Vec<OutputPort>,
  #[serde(default)]
  pub scatter: Scatter,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub when: Option<String>,
  #[serde(default)]
  pub requirements: Requirements,
}

impl Step {
  pub fn new<I, S>(name: impl Into<String>, command: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self {
      name: name.into(),
      command: command.into_iter().map(Into::into).collect(),
      inputs: Vec::new(),
      outputs: Vec::new(),
      scatter: Scatter::None,
      when: None,
      requirements: Requirements::default(),
    }
  }

  /// Add a required input port.
  pub fn input(mut self, name: impl Into<String>, port_type: PortType, source: Source) -> Self {
    self.inputs.push(InputPort {
      name: name.into(),
      port_type,
      required: true,
      source,
      default: None,
    });
    self
  }

  /// Add an optional input port.
  pub fn optional_input(
    mut self,
    name: impl Into<String>,
    port_type: PortType,
    source: Source,
  ) -> Self {
    self.inputs.push(InputPort {
      name: name.into(),
      port_type,
      required: false,
      source,
      default: None,
    });
    self
  }

  /// Add a required output port.
  pub fn output(
    mut self,
    name: impl Into<String>,
    port_type: PortType,
    binding: OutputBinding,
  ) -> Self {
    self.outputs.push(OutputPort {
      name: name.into(),
      port_type,
      required: true,
      binding,
    });
    self
  }

  pub fn scatter(mut self, scatter: Scatter) -> Self {
    self.scatter = scatter;
    self
  }

  pub fn when(mut self, expression: impl Into<String>) -> Self {
    self.when = Some(expression.into());
    self
  }

  pub fn container(mut self, image: impl Into<String>) -> Self {
    self.requirements.container = Some(ContainerRequirement {
      image: image.into(),
    });
    self
  }

  pub fn success_codes(mut self, codes: impl Into<Vec<i32>>) -> Self {
    self.requirements.success_codes = codes.into();
    self
  }

  pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
    self.requirements.timeout_ms = Some(timeout_ms);
    self
  }

  pub fn get_input(&self, name: &str) -> Option<&InputPort> {
    self.inputs.iter().find(|p| p.name == name)
  }

  pub fn get_output(&self, name: &str) -> Option<&OutputPort> {
    self.outputs.iter().find(|p| p.name == name)
  }
}

fn default_true() -> bool {
  true
}

fn default_success_codes() -> Vec<i32> {
  vec![0]
}
