//! Job execution.
//!
//! The [`JobExecutor`] takes one Running job through fingerprinting, the
//! cache claim, staging, the backend invocation, and output binding. It never
//! returns an error: every way a job can end is an [`Outcome`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use weft_backend::{
  BackendKind, BackendOutput, Backends, Invocation, ResourceLimits, RunHandle, StagedInputs,
  Stager,
};
use weft_cache::{
  CacheEntry, CacheStore, Claim, Fingerprint, FingerprintInput, InflightGuard, SharedOutcome,
  fingerprint,
};
use weft_graph::{Step, StepId, WorkflowGraph};

use crate::binding::bind_outputs;
use crate::error::JobError;
use crate::job::JobId;
use crate::resolve::render_command;

/// Extra time granted beyond the grace period for a cancelled run to report.
const SETTLE_MARGIN: Duration = Duration::from_secs(2);

/// A job handed to the executor.
#[derive(Debug, Clone)]
pub(crate) struct JobRequest {
  pub job_id: JobId,
  pub step_id: StepId,
  pub inputs: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Outcome {
  Completed(Map<String, Value>),
  Failed(JobError),
  /// Stopped on request; nothing was cached.
  Cancelled,
}

/// Everything the scheduler learns about a finished job.
#[derive(Debug, Clone)]
pub(crate) struct Execution {
  pub outcome: Outcome,
  pub fingerprint: Option<Fingerprint>,
  pub cached: bool,
  pub handle_id: Option<String>,
  pub stdout_ref: Option<PathBuf>,
  pub stderr_ref: Option<PathBuf>,
}

impl Execution {
  fn new(fingerprint: Option<Fingerprint>) -> Self {
    Self {
      outcome: Outcome::Cancelled,
      fingerprint,
      cached: false,
      handle_id: None,
      stdout_ref: None,
      stderr_ref: None,
    }
  }

  pub(crate) fn failed(error: JobError) -> Self {
    Self::new(None).fail(error)
  }

  fn fail(mut self, error: JobError) -> Self {
    self.outcome = Outcome::Failed(error);
    self
  }

  fn complete(mut self, outputs: Map<String, Value>, cached: bool) -> Self {
    self.outcome = Outcome::Completed(outputs);
    self.cached = cached;
    self
  }

  fn cancelled(mut self) -> Self {
    self.outcome = Outcome::Cancelled;
    self
  }

  fn with_logs(mut self, output: &BackendOutput) -> Self {
    self.stdout_ref = Some(output.stdout_ref.clone());
    self.stderr_ref = Some(output.stderr_ref.clone());
    self
  }
}

/// How a backend invocation ended.
enum RunEnd {
  Finished(BackendOutput),
  TimedOut {
    timeout_ms: u64,
    output: Option<BackendOutput>,
  },
  Cancelled(Option<BackendOutput>),
  Error(JobError),
}

#[derive(Clone, Copy)]
enum Interrupt {
  Timeout,
  Cancel,
}

/// Runs individual jobs. Shared by all worker tasks of a run.
pub(crate) struct JobExecutor {
  graph: Arc<WorkflowGraph>,
  cache: CacheStore,
  backends: Backends,
  stager: Arc<dyn Stager>,
  invocation_root: PathBuf,
  timeout_per_job: Option<Duration>,
  grace_period: Duration,
  retain_workdirs: bool,
}

pub(crate) struct ExecutorConfig {
  pub invocation_root: PathBuf,
  pub timeout_per_job: Option<Duration>,
  pub grace_period: Duration,
  pub retain_workdirs: bool,
}

impl JobExecutor {
  pub fn new(
    graph: Arc<WorkflowGraph>,
    cache: CacheStore,
    backends: Backends,
    stager: Arc<dyn Stager>,
    config: ExecutorConfig,
  ) -> Self {
    Self {
      graph,
      cache,
      backends,
      stager,
      invocation_root: config.invocation_root,
      timeout_per_job: config.timeout_per_job,
      grace_period: config.grace_period,
      retain_workdirs: config.retain_workdirs,
    }
  }

  /// Execute a job until it completes, fails, or `cancel` fires.
  #[instrument(
    name = "job_execute",
    skip(self, request, cancel),
    fields(job_id = %request.job_id)
  )]
  pub async fn execute(&self, request: JobRequest, cancel: CancellationToken) -> Execution {
    let step = self.graph.step(request.step_id);

    let blobs = self.cache.blob_dir();
    let fingerprint = match fingerprint(FingerprintInput {
      command: &step.command,
      container_image: step.requirements.container.as_ref().map(|c| c.image.as_str()),
      inputs: &request.inputs,
      trusted_blobs: Some(blobs.as_path()),
    })
    .await
    {
      Ok(fingerprint) => fingerprint,
      Err(e) => {
        error!(error = %e, "fingerprint_failed");
        return Execution::failed(JobError::Cache {
          message: e.to_string(),
        });
      }
    };
    let execution = Execution::new(Some(fingerprint.clone()));

    loop {
      if cancel.is_cancelled() {
        return execution.cancelled();
      }

      match self.cache.claim(&fingerprint).await {
        Claim::Hit(entry) => {
          info!(fingerprint = %fingerprint, "cache_hit");
          return execution.complete(entry.outputs, true);
        }
        Claim::Wait(waiter) => {
          info!(fingerprint = %fingerprint, "waiting_on_identical_job");
          let shared = tokio::select! {
            shared = waiter.wait() => shared,
            _ = cancel.cancelled() => return execution.cancelled(),
          };
          match shared {
            Some(SharedOutcome::Committed(entry)) => {
              info!(fingerprint = %fingerprint, "shared_result_received");
              return execution.complete(entry.outputs, true);
            }
            Some(SharedOutcome::Failed(message)) => {
              return execution.fail(JobError::UpstreamShared { message });
            }
            // Owner abandoned its claim; try again.
            None => continue,
          }
        }
        Claim::Owner(guard) => {
          return self
            .run_owned(step, &request, guard, execution, &cancel)
            .await;
        }
      }
    }
  }

  async fn run_owned(
    &self,
    step: &Step,
    request: &JobRequest,
    guard: InflightGuard,
    mut execution: Execution,
    cancel: &CancellationToken,
  ) -> Execution {
    let handle = RunHandle::new(request.job_id.as_str());
    execution.handle_id = Some(handle.id().to_string());

    let target = BackendKind::for_requirements(&step.requirements);
    let staged = match self.stager.stage(handle.id(), &request.inputs, target).await {
      Ok(staged) => staged,
      Err(e) => {
        guard.fail(e.to_string());
        return execution.fail(JobError::Stage {
          message: e.to_string(),
        });
      }
    };

    let end = self.invoke(step, &handle, &staged, cancel).await;

    if let Err(e) = self.stager.unstage(staged).await {
      warn!(error = %e, "unstage_failed");
    }

    match end {
      RunEnd::Finished(output) => {
        execution = execution.with_logs(&output);
        if !step.requirements.is_success(output.exit_code) {
          warn!(exit_code = output.exit_code, "job_exit_not_permitted");
          guard.fail(format!("exit code {}", output.exit_code));
          return execution.fail(JobError::NonZeroExit {
            exit_code: output.exit_code,
            stderr_ref: output.stderr_ref.clone(),
          });
        }

        let bound = match bind_outputs(step, &output, &self.cache).await {
          Ok(bound) => bound,
          Err(e) => {
            guard.fail(e.to_string());
            return execution.fail(e);
          }
        };

        let fingerprint = guard.fingerprint().clone();
        let committed = guard
          .commit(CacheEntry::new(fingerprint, bound.outputs, bound.artifacts))
          .await;
        if !self.retain_workdirs {
          output.release_workdir().await;
        }
        execution.complete(committed.outputs, false)
      }
      RunEnd::TimedOut { timeout_ms, output } => {
        if let Some(output) = &output {
          execution = execution.with_logs(output);
        }
        guard.fail(format!("timed out after {}ms", timeout_ms));
        execution.fail(JobError::Timeout { timeout_ms })
      }
      RunEnd::Cancelled(output) => {
        // Releasing the claim unresolved lets a waiter take over.
        drop(guard);
        if let Some(output) = &output {
          execution = execution.with_logs(output);
          if !self.retain_workdirs {
            output.release_workdir().await;
          }
        }
        execution.cancelled()
      }
      RunEnd::Error(e) => {
        guard.fail(e.to_string());
        execution.fail(e)
      }
    }
  }

  /// Run the command, racing it against the timeout and `cancel`.
  ///
  /// An interrupted run gets exactly one backend cancel request and is then
  /// given the grace period to wind down.
  async fn invoke(
    &self,
    step: &Step,
    handle: &RunHandle,
    staged: &StagedInputs,
    cancel: &CancellationToken,
  ) -> RunEnd {
    let argv = match render_command(&step.command, &staged.inputs) {
      Ok(argv) => argv,
      Err(e) => return RunEnd::Error(e),
    };

    let kind = BackendKind::for_requirements(&step.requirements);
    let backend = self.backends.get(kind).clone();
    let invocation = Invocation {
      argv,
      workdir_root: self.invocation_root.clone(),
      staging_dir: staged.root.clone(),
      container_image: step.requirements.container.as_ref().map(|c| c.image.clone()),
      limits: ResourceLimits::from(&step.requirements),
    };
    let timeout = step
      .requirements
      .timeout_ms
      .map(Duration::from_millis)
      .or(self.timeout_per_job);

    info!(backend = ?kind, argv = ?invocation.argv, handle = %handle.id(), "job_started");

    let run = backend.run(handle, invocation);
    tokio::pin!(run);
    let deadline = async {
      match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending::<()>().await,
      }
    };
    tokio::pin!(deadline);

    let interrupt = tokio::select! {
      result = &mut run => {
        return match result {
          Ok(output) => RunEnd::Finished(output),
          Err(e) => RunEnd::Error(JobError::Backend { message: e.to_string() }),
        };
      }
      _ = &mut deadline => Interrupt::Timeout,
      _ = cancel.cancelled() => Interrupt::Cancel,
    };

    match interrupt {
      Interrupt::Timeout => warn!(handle = %handle.id(), "job_timed_out"),
      Interrupt::Cancel => info!(handle = %handle.id(), "job_cancel_requested"),
    }
    if let Err(e) = backend.cancel(handle).await {
      warn!(error = %e, "backend_cancel_failed");
    }

    let output = match tokio::time::timeout(self.grace_period + SETTLE_MARGIN, &mut run).await {
      Ok(Ok(output)) => Some(output),
      Ok(Err(e)) => {
        warn!(error = %e, "backend_failed_after_cancel");
        None
      }
      Err(_) => {
        warn!(handle = %handle.id(), "backend_did_not_stop, abandoning run");
        None
      }
    };

    match interrupt {
      Interrupt::Timeout => RunEnd::TimedOut {
        timeout_ms: timeout.map(|t| t.as_millis() as u64).unwrap_or_default(),
        output,
      },
      Interrupt::Cancel => RunEnd::Cancelled(output),
    }
  }
}
