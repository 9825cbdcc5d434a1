//! Workflow output assembly.

use serde_json::{Map, Value};
use tracing::warn;
use weft_graph::{Source, WorkflowGraph};

use crate::scheduler::StepOutcome;

/// Resolve every declared workflow output from terminal step outcomes.
///
/// Returns the outputs (unresolved ones are `null`) and the names of the
/// required outputs that could not be resolved.
pub(crate) fn collect_outputs(
  graph: &WorkflowGraph,
  workflow_inputs: &Map<String, Value>,
  step_outcomes: &[Option<StepOutcome>],
) -> (Map<String, Value>, Vec<String>) {
  let mut outputs = Map::new();
  let mut unresolved = Vec::new();

  for output in &graph.outputs {
    let value = match &output.source {
      Source::Literal(value) => Some(value.clone()),
      Source::WorkflowInput(name) => {
        Some(workflow_inputs.get(name).cloned().unwrap_or(Value::Null))
      }
      Source::StepOutput { step, port } => match step_outcomes.get(step.0) {
        Some(Some(StepOutcome::Completed(values))) => {
          Some(values.get(port).cloned().unwrap_or(Value::Null))
        }
        Some(Some(StepOutcome::Skipped(reason))) if reason.is_benign() => Some(Value::Null),
        _ => None,
      },
    };

    match value {
      Some(value) if !(value.is_null() && output.required) => {
        outputs.insert(output.name.clone(), value);
      }
      _ => {
        warn!(output = %output.name, "workflow_output_unresolved");
        outputs.insert(output.name.clone(), Value::Null);
        if output.required {
          unresolved.push(output.name.clone());
        }
      }
    }
  }

  (outputs, unresolved)
}
