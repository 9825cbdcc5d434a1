//! Per-job input preparation and command rendering.

use std::collections::HashSet;

use minijinja::{Environment, UndefinedBehavior, Value as TemplateValue, context};
use serde_json::{Map, Value};
use weft_graph::Step;

use crate::condition::evaluate_condition;
use crate::error::JobError;
use crate::job::SkipReason;

/// What to do with a job once its inputs are known.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Preparation {
  Ready(Map<String, Value>),
  Skip(Map<String, Value>, SkipReason),
  Fail(Map<String, Value>, JobError),
}

/// Apply defaults, evaluate `when`, then check required ports and types.
///
/// `skipped_ports` names the inputs whose `null` came from a skipped
/// producer; a required port among them skips the job instead of failing it.
pub(crate) fn prepare_inputs(
  step: &Step,
  mut values: Map<String, Value>,
  skipped_ports: &HashSet<String>,
) -> Preparation {
  for port in &step.inputs {
    let slot = values.entry(port.name.clone()).or_insert(Value::Null);
    if slot.is_null()
      && let Some(default) = &port.default
    {
      *slot = default.clone();
    }
  }

  if let Some(expression) = &step.when {
    match evaluate_condition(expression, &values) {
      Ok(true) => {}
      Ok(false) => return Preparation::Skip(values, SkipReason::Condition),
      Err(e) => return Preparation::Fail(values, e),
    }
  }

  for port in &step.inputs {
    let value = &values[&port.name];
    if value.is_null() {
      if !port.required {
        continue;
      }
      if skipped_ports.contains(&port.name) {
        return Preparation::Skip(values, SkipReason::UpstreamSkipped);
      }
      let error = JobError::Input {
        port: port.name.clone(),
        message: "required input is null".to_string(),
      };
      return Preparation::Fail(values, error);
    }
    if !port.port_type.accepts(value) {
      let error = JobError::Input {
        port: port.name.clone(),
        message: format!("value {} does not match type {:?}", value, port.port_type),
      };
      return Preparation::Fail(values, error);
    }
  }

  Preparation::Ready(values)
}

/// Render each argv template against `inputs`.
pub(crate) fn render_command(
  command: &[String],
  inputs: &Map<String, Value>,
) -> Result<Vec<String>, JobError> {
  let mut env = Environment::new();
  env.set_undefined_behavior(UndefinedBehavior::Strict);
  let ctx = context! { inputs => TemplateValue::from_serialize(inputs) };

  command
    .iter()
    .enumerate()
    .map(|(i, template)| {
      env
        .render_str(template, ctx.clone())
        .map_err(|e| JobError::Input {
          port: format!("command[{}]", i),
          message: e.to_string(),
        })
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use weft_graph::{PortType, Source};

  fn step() -> Step {
    Step::new("count", ["wc", "-l", "{{ inputs.file.path }}"])
      .input("file", PortType::File, Source::WorkflowInput("file".into()))
      .optional_input("n", PortType::Int, Source::Literal(json!(null)))
  }

  fn values(v: Value) -> Map<String, Value> {
    v.as_object().cloned().unwrap()
  }

  #[test]
  fn test_defaults_and_ready() {
    let mut step = step();
    step.inputs[1].default = Some(json!(7));
    let file = json!({ "class": "File", "path": "/data/a.txt" });

    match prepare_inputs(&step, values(json!({ "file": file })), &HashSet::new()) {
      Preparation::Ready(inputs) => assert_eq!(inputs["n"], json!(7)),
      other => panic!("expected ready, got {:?}", other),
    }
  }

  #[test]
  fn test_required_null() {
    let inputs = values(json!({ "file": null }));
    assert!(matches!(
      prepare_inputs(&step(), inputs.clone(), &HashSet::new()),
      Preparation::Fail(_, JobError::Input { .. })
    ));

    let skipped = HashSet::from(["file".to_string()]);
    assert_eq!(
      prepare_inputs(&step(), inputs.clone(), &skipped),
      Preparation::Skip(
        values(json!({ "file": null, "n": null })),
        SkipReason::UpstreamSkipped
      )
    );
  }

  #[test]
  fn test_type_mismatch_and_condition() {
    let bad = values(json!({ "file": "not-a-file" }));
    assert!(matches!(
      prepare_inputs(&step(), bad, &HashSet::new()),
      Preparation::Fail(_, JobError::Input { ref port, .. }) if port == "file"
    ));

    let conditional = step().when("inputs.n is not none");
    let inputs = values(json!({ "file": { "class": "File", "path": "/a" } }));
    assert!(matches!(
      prepare_inputs(&conditional, inputs, &HashSet::new()),
      Preparation::Skip(_, SkipReason::Condition)
    ));
  }

  #[test]
  fn test_render_command() {
    let inputs = values(json!({ "file": { "class": "File", "path": "/data/a.txt" }, "n": 3 }));
    let argv = render_command(
      &["head".to_string(), "-n{{ inputs.n }}".to_string(), "{{ inputs.file.path }}".to_string()],
      &inputs,
    )
    .unwrap();
    assert_eq!(argv, vec!["head", "-n3", "/data/a.txt"]);

    assert!(matches!(
      render_command(&["{{ inputs.nope }}".to_string()], &inputs),
      Err(JobError::Input { ref port, .. }) if port == "command[0]"
    ));
  }
}
