//! Execution events and notifiers for observability.
//!
//! The scheduler reports every job transition to an [`ExecutionNotifier`].
//! Consumers can stream them to a UI, persist them, or ignore them.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::JobError;
use crate::job::{JobId, SkipReason};

/// Events emitted during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutionEvent {
  RunStarted { run_id: String, workflow: String },

  /// A job passed its condition and was queued for dispatch.
  JobReady { run_id: String, job_id: JobId },

  JobStarted { run_id: String, job_id: JobId },

  JobCompleted {
    run_id: String,
    job_id: JobId,
    cached: bool,
  },

  JobFailed {
    run_id: String,
    job_id: JobId,
    error: JobError,
  },

  JobSkipped {
    run_id: String,
    job_id: JobId,
    reason: SkipReason,
  },

  /// A running job was asked to stop.
  JobCancelRequested { run_id: String, job_id: JobId },

  RunFinished { run_id: String, exit_code: i32 },
}

/// Receives execution events.
///
/// Called synchronously from the scheduler loop; implementations must not
/// block.
pub trait ExecutionNotifier: Send + Sync {
  fn notify(&self, event: ExecutionEvent);
}

/// Discards all events.
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

impl ExecutionNotifier for NoopNotifier {
  fn notify(&self, _event: ExecutionEvent) {}
}

/// Forwards events to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
  // Unbounded so a slow consumer never stalls scheduling.
  sender: mpsc::UnboundedSender<ExecutionEvent>,
}

impl ChannelNotifier {
  pub fn new(sender: mpsc::UnboundedSender<ExecutionEvent>) -> Self {
    Self { sender }
  }
}

impl ExecutionNotifier for ChannelNotifier {
  fn notify(&self, event: ExecutionEvent) {
    // Receiver may have been dropped.
    let _ = self.sender.send(event);
  }
}
