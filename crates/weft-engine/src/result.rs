//! Run results.

use std::path::PathBuf;

use serde::Serialize;
use serde_json::{Map, Value};
use weft_cache::Fingerprint;
use weft_graph::GraphError;

use crate::error::JobError;
use crate::job::{JobId, JobRecord, JobState};

/// Process-level classification of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitClass {
  /// Every job completed or was conditionally skipped.
  Success,
  /// A job failed, was cancelled, or a required output is unresolved.
  Failed,
  /// The graph or its inputs were rejected before any job ran.
  Fatal,
}

impl ExitClass {
  pub fn code(self) -> i32 {
    match self {
      ExitClass::Success => 0,
      ExitClass::Failed => 1,
      ExitClass::Fatal => 2,
    }
  }
}

/// One failed job, with enough context to find its logs and neighbours.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureReport {
  pub job_id: JobId,
  pub step: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub scatter_index: Option<Vec<usize>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub fingerprint: Option<Fingerprint>,
  pub error: JobError,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub stderr_ref: Option<PathBuf>,
  /// Names of the steps it depends on.
  pub predecessors: Vec<String>,
  /// Names of the steps depending on it.
  pub successors: Vec<String>,
}

/// A job that was stopped or never started because the run was aborted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CancellationNote {
  pub job_id: JobId,
  pub step: String,
  /// The job was running and received a cancel request.
  pub was_running: bool,
  pub reason: String,
}

/// Everything a run produced.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
  pub run_id: String,
  pub workflow: String,
  /// Workflow outputs by name; unresolved outputs are `null`.
  pub outputs: Map<String, Value>,
  /// Execution log, in creation order.
  pub jobs: Vec<JobRecord>,
  pub failures: Vec<FailureReport>,
  pub cancellations: Vec<CancellationNote>,
  /// Required workflow outputs that could not be resolved.
  pub unresolved_outputs: Vec<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub graph_error: Option<GraphError>,
  /// The run could not be set up, e.g. no usable cache directory.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub setup_error: Option<String>,
  pub exit: ExitClass,
}

impl RunResult {
  fn empty(run_id: String, workflow: String, exit: ExitClass) -> Self {
    Self {
      run_id,
      workflow,
      outputs: Map::new(),
      jobs: Vec::new(),
      failures: Vec::new(),
      cancellations: Vec::new(),
      unresolved_outputs: Vec::new(),
      graph_error: None,
      setup_error: None,
      exit,
    }
  }

  pub(crate) fn fatal(run_id: String, workflow: String, error: GraphError) -> Self {
    Self {
      graph_error: Some(error),
      ..Self::empty(run_id, workflow, ExitClass::Fatal)
    }
  }

  pub(crate) fn setup_failed(run_id: String, workflow: String, message: String) -> Self {
    Self {
      setup_error: Some(message),
      ..Self::empty(run_id, workflow, ExitClass::Failed)
    }
  }

  pub(crate) fn classify(
    jobs: &[JobRecord],
    failures: &[FailureReport],
    unresolved_outputs: &[String],
  ) -> ExitClass {
    let clean = jobs.iter().all(|job| match job.state {
      JobState::Completed => true,
      JobState::Skipped(reason) => reason.is_benign(),
      _ => false,
    });
    if clean && failures.is_empty() && unresolved_outputs.is_empty() {
      ExitClass::Success
    } else {
      ExitClass::Failed
    }
  }

  pub fn exit_code(&self) -> i32 {
    self.exit.code()
  }

  pub fn job(&self, job_id: &str) -> Option<&JobRecord> {
    self.jobs.iter().find(|j| j.job_id.as_str() == job_id)
  }

  pub fn jobs_for_step<'a>(&'a self, step: &'a str) -> impl Iterator<Item = &'a JobRecord> + 'a {
    self.jobs.iter().filter(move |j| j.step == step)
  }
}
