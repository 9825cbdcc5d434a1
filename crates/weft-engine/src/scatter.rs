//! Scatter expansion and gathering.
//!
//! A dot-product scatter zips its inputs into one job per position. A nested
//! scatter takes the cross product; jobs are numbered row-major and the
//! gathered output nests one array level per scatter input.

use serde_json::{Map, Value};
use weft_graph::{Scatter, Step};

use crate::error::JobError;

/// Jobs a scattered step expands into.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ScatterPlan {
  /// Length of each output nesting level.
  pub shape: Vec<usize>,
  /// Scatter index and input values of each job, in scatter order.
  pub jobs: Vec<(Vec<usize>, Map<String, Value>)>,
}

pub(crate) fn expand(step: &Step, values: &Map<String, Value>) -> Result<ScatterPlan, JobError> {
  let mut arrays = Vec::new();
  for name in step.scatter.inputs() {
    match values.get(name) {
      Some(Value::Array(items)) => arrays.push((name.as_str(), items.as_slice())),
      Some(other) => {
        return Err(JobError::Scatter {
          message: format!("input '{}' is {} instead of an array", name, kind_of(other)),
        });
      }
      None => {
        return Err(JobError::Scatter {
          message: format!("input '{}' has no value", name),
        });
      }
    }
  }

  let with = |index: &[usize]| -> Map<String, Value> {
    let mut job = values.clone();
    let positions: Box<dyn Iterator<Item = usize>> = if index.len() == 1 {
      Box::new(std::iter::repeat(index[0]))
    } else {
      Box::new(index.iter().copied())
    };
    for ((name, items), i) in arrays.iter().zip(positions) {
      job.insert(name.to_string(), items[i].clone());
    }
    job
  };

  match &step.scatter {
    Scatter::None => Ok(ScatterPlan {
      shape: Vec::new(),
      jobs: vec![(Vec::new(), values.clone())],
    }),
    Scatter::Dot(_) => {
      let len = arrays.first().map(|(_, items)| items.len()).unwrap_or(0);
      if let Some((name, items)) = arrays.iter().find(|(_, items)| items.len() != len) {
        return Err(JobError::Scatter {
          message: format!(
            "dot product over arrays of unequal length: '{}' has {}, '{}' has {}",
            arrays[0].0,
            len,
            name,
            items.len()
          ),
        });
      }
      Ok(ScatterPlan {
        shape: vec![len],
        jobs: (0..len)
          .map(|i| (vec![i], with(std::slice::from_ref(&i))))
          .collect(),
      })
    }
    Scatter::Nested(_) => {
      let shape: Vec<usize> = arrays.iter().map(|(_, items)| items.len()).collect();
      let jobs = cross_product(&shape)
        .into_iter()
        .map(|index| {
          let job = with(&index);
          (index, job)
        })
        .collect();
      Ok(ScatterPlan { shape, jobs })
    }
  }
}

/// Every index tuple within `shape`, row-major.
fn cross_product(shape: &[usize]) -> Vec<Vec<usize>> {
  if shape.contains(&0) {
    return Vec::new();
  }
  let mut out = vec![Vec::new()];
  for &len in shape {
    out = out
      .into_iter()
      .flat_map(|prefix| {
        (0..len).map(move |i| {
          let mut next = prefix.clone();
          next.push(i);
          next
        })
      })
      .collect();
  }
  out
}

/// Nest row-major `slots` into arrays of the given shape.
pub(crate) fn gather(shape: &[usize], slots: &[Value]) -> Value {
  match shape.split_first() {
    None => slots.first().cloned().unwrap_or(Value::Null),
    Some((&len, rest)) => {
      let chunk: usize = rest.iter().product();
      Value::Array(
        (0..len)
          .map(|i| {
            let start = (i * chunk).min(slots.len());
            let end = (start + chunk).min(slots.len());
            gather(rest, &slots[start..end])
          })
          .collect(),
      )
    }
  }
}

fn kind_of(value: &Value) -> &'static str {
  match value {
    Value::Null => "null",
    Value::Bool(_) => "a boolean",
    Value::Number(_) => "a number",
    Value::String(_) => "a string",
    Value::Array(_) => "an array",
    Value::Object(_) => "an object",
  }
}
