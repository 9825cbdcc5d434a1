//! Job error types.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Why a job failed.
///
/// Job errors are data: they are recorded on the job and in the run's
/// failure reports, never propagated out of the scheduler.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobError {
  /// The `when` expression could not be evaluated.
  #[error("condition evaluation failed: {message}")]
  Condition { message: String },

  /// Inputs could not be resolved, checked, or rendered into the command.
  #[error("input '{port}': {message}")]
  Input { port: String, message: String },

  /// Scatter inputs were not arrays or had mismatched lengths.
  #[error("scatter failed: {message}")]
  Scatter { message: String },

  #[error("staging failed: {message}")]
  Stage { message: String },

  /// The backend could not launch or supervise the command.
  #[error("backend error: {message}")]
  Backend { message: String },

  #[error("command exited with code {exit_code}")]
  NonZeroExit { exit_code: i32, stderr_ref: PathBuf },

  #[error("job exceeded its timeout of {timeout_ms}ms")]
  Timeout { timeout_ms: u64 },

  /// A declared output could not be bound.
  #[error("output '{port}': {message}")]
  OutputBinding { port: String, message: String },

  #[error("cache error: {message}")]
  Cache { message: String },

  /// Another job with the same fingerprint failed while this one waited.
  #[error("shared execution failed: {message}")]
  UpstreamShared { message: String },

  /// The worker task died before reporting.
  #[error("internal error: {message}")]
  Internal { message: String },
}
