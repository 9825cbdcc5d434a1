//! The backend interface and per-step backend selection.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, warn};
use weft_graph::Requirements;

use crate::error::BackendError;

/// Identifies one backend invocation and carries its cancel signal.
///
/// Cloning shares the signal.
#[derive(Debug, Clone)]
pub struct RunHandle {
  id: String,
  job_id: String,
  cancel: CancellationToken,
}

impl RunHandle {
  pub fn new(job_id: impl Into<String>) -> Self {
    Self {
      id: uuid::Uuid::new_v4().to_string(),
      job_id: job_id.into(),
      cancel: CancellationToken::new(),
    }
  }

  pub fn id(&self) -> &str {
    &self.id
  }

  pub fn job_id(&self) -> &str {
    &self.job_id
  }

  /// Raise the cancel signal. Safe to call any number of times.
  pub fn signal_cancel(&self) {
    self.cancel.cancel();
  }

  pub fn is_cancelled(&self) -> bool {
    self.cancel.is_cancelled()
  }

  /// Resolves once the cancel signal is raised.
  pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
    self.cancel.cancelled()
  }
}

/// CPU and memory limits passed to the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
  pub cpus: Option<f64>,
  pub memory_mb: Option<u64>,
}

impl From<&Requirements> for ResourceLimits {
  fn from(requirements: &Requirements) -> Self {
    Self {
      cpus: requirements.cpus,
      memory_mb: requirements.memory_mb,
    }
  }
}

/// One command to execute.
#[derive(Debug, Clone)]
pub struct Invocation {
  /// Rendered argument vector.
  pub argv: Vec<String>,
  /// Base directory under which the invocation directory is created.
  pub workdir_root: PathBuf,
  /// Directory holding staged inputs, if any. Container backends mount it.
  pub staging_dir: Option<PathBuf>,
  pub container_image: Option<String>,
  pub limits: ResourceLimits,
}

/// What an invocation left behind.
#[derive(Debug, Clone)]
pub struct BackendOutput {
  pub exit_code: i32,
  /// True if the process ended because the cancel signal was raised.
  pub cancelled: bool,
  /// The command's working directory.
  pub workdir: PathBuf,
  /// Every regular file left in `workdir`, relative to it.
  pub produced_paths: Vec<PathBuf>,
  pub stdout_ref: PathBuf,
  pub stderr_ref: PathBuf,
}

impl BackendOutput {
  /// Remove the working directory. Captured stdout/stderr are kept.
  pub async fn release_workdir(&self) {
    if let Err(e) = tokio::fs::remove_dir_all(&self.workdir).await {
      warn!(workdir = %self.workdir.display(), error = %e, "failed to remove working directory");
    }
  }
}

/// Executes commands in some isolation context.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
  /// Run the invocation to completion.
  ///
  /// Must return promptly (within the backend's grace period) once the
  /// handle's cancel signal is raised.
  async fn run(&self, handle: &RunHandle, invocation: Invocation)
  -> Result<BackendOutput, BackendError>;

  /// Request termination of a run. Idempotent, and a no-op once the run
  /// has finished.
  async fn cancel(&self, handle: &RunHandle) -> Result<(), BackendError> {
    handle.signal_cancel();
    Ok(())
  }
}

/// Which backend a step is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
  LocalProcess,
  Container,
}

impl BackendKind {
  pub fn for_requirements(requirements: &Requirements) -> Self {
    if requirements.container.is_some() {
      BackendKind::Container
    } else {
      BackendKind::LocalProcess
    }
  }
}

/// Routing table from [`BackendKind`] to an implementation.
#[derive(Clone)]
pub struct Backends {
  local: Arc<dyn ExecutionBackend>,
  container: Arc<dyn ExecutionBackend>,
}

impl Backends {
  pub fn new(local: Arc<dyn ExecutionBackend>, container: Arc<dyn ExecutionBackend>) -> Self {
    Self { local, container }
  }

  /// Route every kind to the same backend.
  pub fn uniform(backend: Arc<dyn ExecutionBackend>) -> Self {
    Self {
      local: backend.clone(),
      container: backend,
    }
  }

  pub fn get(&self, kind: BackendKind) -> &Arc<dyn ExecutionBackend> {
    match kind {
      BackendKind::LocalProcess => &self.local,
      BackendKind::Container => &self.container,
    }
  }
}

/// On-disk layout of one invocation:
/// `{root}/{handle id}/work/`, `.../stdout`, `.../stderr`.
pub(crate) struct InvocationDir {
  pub work: PathBuf,
  pub stdout: PathBuf,
  pub stderr: PathBuf,
}

impl InvocationDir {
  pub async fn create(root: &Path, handle: &RunHandle) -> Result<Self, BackendError> {
    let base = root.join(handle.id());
    let work = base.join("work");
    tokio::fs::create_dir_all(&work)
      .await
      .map_err(|e| BackendError::Workdir {
        path: work.display().to_string(),
        message: e.to_string(),
      })?;
    debug!(job_id = %handle.job_id(), workdir = %work.display(), "invocation directory created");
    Ok(Self {
      work,
      stdout: base.join("stdout"),
      stderr: base.join("stderr"),
    })
  }

  pub async fn capture_files(&self) -> Result<(std::fs::File, std::fs::File), BackendError> {
    let stdout = tokio::fs::File::create(&self.stdout).await?.into_std().await;
    let stderr = tokio::fs::File::create(&self.stderr).await?.into_std().await;
    Ok((stdout, stderr))
  }

  pub async fn into_output(self, exit_code: i32, cancelled: bool) -> Result<BackendOutput, BackendError> {
    let produced_paths = produced_files(&self.work).await?;
    Ok(BackendOutput {
      exit_code,
      cancelled,
      workdir: self.work,
      produced_paths,
      stdout_ref: self.stdout,
      stderr_ref: self.stderr,
    })
  }
}

async fn produced_files(work: &Path) -> Result<Vec<PathBuf>, BackendError> {
  let mut files = Vec::new();
  let mut pending = vec![work.to_path_buf()];
  while let Some(dir) = pending.pop() {
    let mut entries = tokio::fs::read_dir(&dir).await?;
    while let Some(entry) = entries.next_entry().await? {
      if entry.file_type().await?.is_dir() {
        pending.push(entry.path());
      } else if let Ok(relative) = entry.path().strip_prefix(work) {
        files.push(relative.to_path_buf());
      }
    }
  }
  files.sort();
  Ok(files)
}

/// Map a process exit status to an integer code. Signal deaths follow the
/// shell convention of `128 + signal`.
pub(crate) fn exit_code_of(status: std::process::ExitStatus) -> i32 {
  if let Some(code) = status.code() {
    return code;
  }
  #[cfg(unix)]
  {
    use std::os::unix::process::ExitStatusExt;
    if let Some(signal) = status.signal() {
      return 128 + signal;
    }
  }
  -1
}

#[cfg(test)]
mod tests {
  use super::*;
  use weft_graph::Step;

  #[test]
  fn test_backend_kind_from_requirements() {
    let plain = Step::new("a", ["true"]);
    let boxed = Step::new("b", ["true"]).container("alpine:3");
    assert_eq!(
      BackendKind::for_requirements(&plain.requirements),
      BackendKind::LocalProcess
    );
    assert_eq!(
      BackendKind::for_requirements(&boxed.requirements),
      BackendKind::Container
    );
  }

  #[test]
  fn test_handle_cancel_is_idempotent() {
    let handle = RunHandle::new("job-1");
    let clone = handle.clone();
    assert!(!handle.is_cancelled());
    handle.signal_cancel();
    handle.signal_cancel();
    assert!(clone.is_cancelled());
  }

  #[tokio::test]
  async fn test_invocation_dir_lists_produced_files() {
    let root = tempfile::tempdir().unwrap();
    let handle = RunHandle::new("job-1");
    let dir = InvocationDir::create(root.path(), &handle).await.unwrap();
    std::fs::create_dir_all(dir.work.join("nested")).unwrap();
    std::fs::write(dir.work.join("nested/b.txt"), "b").unwrap();
    std::fs::write(dir.work.join("a.txt"), "a").unwrap();

    let output = dir.into_output(0, false).await.unwrap();
    assert_eq!(
      output.produced_paths,
      vec![PathBuf::from("a.txt"), PathBuf::from("nested/b.txt")]
    );

    output.release_workdir().await;
    assert!(!output.workdir.exists());
  }
}
