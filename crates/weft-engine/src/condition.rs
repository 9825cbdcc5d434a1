//! `when` expressions.
//!
//! A step's `when` is a minijinja expression evaluated against the job's
//! resolved inputs, available as `inputs`:
//! ```text
//! inputs.threshold > 3 and inputs.mode == "fast"
//! ```
//! The result must be a boolean. Undefined names are errors, not `false`.

use minijinja::value::ValueKind;
use minijinja::{Environment, UndefinedBehavior, Value, context};
use serde_json::Map;

use crate::error::JobError;

/// Evaluate a `when` expression.
pub fn evaluate_condition(
  expression: &str,
  inputs: &Map<String, serde_json::Value>,
) -> Result<bool, JobError> {
  let mut env = Environment::new();
  env.set_undefined_behavior(UndefinedBehavior::Strict);

  let compiled = env
    .compile_expression(expression)
    .map_err(|e| JobError::Condition {
      message: format!("invalid expression '{}': {}", expression, e),
    })?;

  let result = compiled
    .eval(context! { inputs => Value::from_serialize(inputs) })
    .map_err(|e| JobError::Condition {
      message: format!("'{}': {}", expression, e),
    })?;

  if result.kind() != ValueKind::Bool {
    return Err(JobError::Condition {
      message: format!(
        "'{}' evaluated to {} instead of a boolean",
        expression,
        result.kind()
      ),
    });
  }
  Ok(result.is_true())
}
