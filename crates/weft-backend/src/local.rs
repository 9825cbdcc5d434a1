//! Local process backend.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::{debug, info, instrument, warn};

use crate::backend::{
  BackendOutput, ExecutionBackend, Invocation, InvocationDir, RunHandle, exit_code_of,
};
use crate::error::BackendError;

/// Runs commands as child processes of the engine.
///
/// Each invocation gets its own process group so cancellation reaches
/// grandchildren. Resource limits are not enforced.
#[derive(Debug, Clone)]
pub struct LocalProcessBackend {
  grace_period: Duration,
}

impl LocalProcessBackend {
  pub fn new(grace_period: Duration) -> Self {
    Self { grace_period }
  }
}

impl Default for LocalProcessBackend {
  fn default() -> Self {
    Self::new(Duration::from_secs(5))
  }
}

#[async_trait]
impl ExecutionBackend for LocalProcessBackend {
  #[instrument(
    name = "local_run",
    skip(self, handle, invocation),
    fields(job_id = %handle.job_id(), handle = %handle.id())
  )]
  async fn run(
    &self,
    handle: &RunHandle,
    invocation: Invocation,
  ) -> Result<BackendOutput, BackendError> {
    let (program, args) = invocation
      .argv
      .split_first()
      .ok_or(BackendError::EmptyCommand)?;

    let dir = InvocationDir::create(&invocation.workdir_root, handle).await?;
    let (stdout, stderr) = dir.capture_files().await?;

    if invocation.limits.cpus.is_some() || invocation.limits.memory_mb.is_some() {
      debug!(limits = ?invocation.limits, "resource limits are advisory for local processes");
    }

    let mut command = Command::new(program);
    command
      .args(args)
      .current_dir(&dir.work)
      .stdin(Stdio::null())
      .stdout(Stdio::from(stdout))
      .stderr(Stdio::from(stderr))
      .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command.spawn().map_err(|e| BackendError::Spawn {
      program: program.clone(),
      message: e.to_string(),
    })?;
    info!(pid = ?child.id(), program = %program, "process_started");

    let (status, cancelled) = tokio::select! {
      status = child.wait() => (status?, false),
      _ = handle.cancelled() => {
        let status = terminate(&mut child, self.grace_period).await?;
        (status, true)
      }
    };

    let exit_code = exit_code_of(status);
    info!(exit_code, cancelled, "process_exited");
    dir.into_output(exit_code, cancelled).await
  }
}

/// SIGTERM the process group, then SIGKILL once the grace period lapses.
async fn terminate(
  child: &mut Child,
  grace_period: Duration,
) -> Result<std::process::ExitStatus, BackendError> {
  #[cfg(unix)]
  {
    if let Some(pid) = child.id() {
      debug!(pid, "sending SIGTERM");
      unsafe {
        libc::kill(-(pid as libc::pid_t), libc::SIGTERM);
      }
      if let Ok(status) = tokio::time::timeout(grace_period, child.wait()).await {
        return Ok(status?);
      }
      warn!(pid, "process ignored SIGTERM, killing");
      unsafe {
        libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
      }
    }
  }

  #[cfg(not(unix))]
  let _ = grace_period;

  let _ = child.start_kill();
  Ok(child.wait().await?)
}
