//! Job identity, lifecycle states, and the per-job execution record.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use weft_cache::Fingerprint;
use weft_graph::StepId;

use crate::error::JobError;

/// Identity of one job within a run: the step name, plus the scatter
/// position for scattered steps (`align[2]`, `pairs[0,1]`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
  pub fn new(step: &str, scatter_index: Option<&[usize]>) -> Self {
    match scatter_index {
      None => Self(step.to_string()),
      Some(index) => {
        let parts: Vec<String> = index.iter().map(|i| i.to_string()).collect();
        Self(format!("{}[{}]", step, parts.join(",")))
      }
    }
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for JobId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Why a job was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
  /// Its `when` expression evaluated to false.
  Condition,
  /// A step it depends on failed (keep-going).
  UpstreamFailed,
  /// A required input is null because its producer was skipped.
  UpstreamSkipped,
  /// The run was aborted before or while the job ran.
  Cancelled,
}

impl SkipReason {
  /// Skips that still count as a successful run.
  pub fn is_benign(self) -> bool {
    matches!(self, SkipReason::Condition | SkipReason::UpstreamSkipped)
  }
}

/// Lifecycle state of a job.
///
/// `Pending -> Ready -> Running -> {Completed | Failed | Skipped}`; a job
/// may also go straight from `Pending` or `Ready` to `Skipped` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
  Pending,
  Ready,
  Running,
  Completed,
  Failed,
  Skipped(SkipReason),
}

impl JobState {
  pub fn is_terminal(self) -> bool {
    matches!(
      self,
      JobState::Completed | JobState::Failed | JobState::Skipped(_)
    )
  }
}

/// Execution log entry for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
  pub job_id: JobId,
  pub step: String,
  pub step_id: StepId,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub scatter_index: Option<Vec<usize>>,
  pub state: JobState,
  /// Resolved input values.
  #[serde(default)]
  pub inputs: Map<String, Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub fingerprint: Option<Fingerprint>,
  /// Outputs came from the cache or a concurrent identical job.
  #[serde(default)]
  pub cached: bool,
  /// Backend run handle, if the job reached a backend.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub handle_id: Option<String>,
  pub created_at: DateTime<Utc>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub started_at: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub finished_at: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub outputs: Option<Map<String, Value>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<JobError>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub stdout_ref: Option<PathBuf>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub stderr_ref: Option<PathBuf>,
}

impl JobRecord {
  pub fn new(
    step_id: StepId,
    step: &str,
    scatter_index: Option<Vec<usize>>,
    inputs: Map<String, Value>,
  ) -> Self {
    Self {
      job_id: JobId::new(step, scatter_index.as_deref()),
      step: step.to_string(),
      step_id,
      scatter_index,
      state: JobState::Pending,
      inputs,
      fingerprint: None,
      cached: false,
      handle_id: None,
      created_at: Utc::now(),
      started_at: None,
      finished_at: None,
      outputs: None,
      error: None,
      stdout_ref: None,
      stderr_ref: None,
    }
  }

  pub fn skip_reason(&self) -> Option<SkipReason> {
    match self.state {
      JobState::Skipped(reason) => Some(reason),
      _ => None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_job_id_format() {
    assert_eq!(JobId::new("align", None).as_str(), "align");
    assert_eq!(JobId::new("align", Some(&[2])).as_str(), "align[2]");
    assert_eq!(JobId::new("pairs", Some(&[0, 1])).as_str(), "pairs[0,1]");
  }

  #[test]
  fn test_state_serde() {
    assert_eq!(
      serde_json::to_value(JobState::Skipped(SkipReason::UpstreamFailed)).unwrap(),
      serde_json::json!({ "skipped": "upstream_failed" })
    );
    assert_eq!(
      serde_json::to_value(JobState::Completed).unwrap(),
      serde_json::json!("completed")
    );
    assert!(JobState::Failed.is_terminal());
    assert!(!JobState::Ready.is_terminal());
  }
}
