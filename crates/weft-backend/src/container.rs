//! Container backend driving a docker-compatible CLI.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use crate::backend::{
  BackendOutput, ExecutionBackend, Invocation, InvocationDir, RunHandle, exit_code_of,
};
use crate::error::BackendError;

/// Mount point of the working directory inside the container.
const CONTAINER_WORKDIR: &str = "/work";

/// Runs each invocation in a fresh container.
///
/// The working directory is bind-mounted at `/work`; the staging directory
/// is mounted read-only at its host path so staged file paths stay valid.
#[derive(Debug, Clone)]
pub struct ContainerBackend {
  /// CLI to drive, e.g. `docker` or `podman`.
  runtime: String,
  grace_period: Duration,
}

impl ContainerBackend {
  pub fn new(runtime: impl Into<String>, grace_period: Duration) -> Self {
    Self {
      runtime: runtime.into(),
      grace_period,
    }
  }

  fn container_name(handle: &RunHandle) -> String {
    format!("weft-{}", handle.id())
  }

  /// Arguments for `<runtime> run ...`.
  fn run_args(
    &self,
    handle: &RunHandle,
    invocation: &Invocation,
    image: &str,
    workdir: &std::path::Path,
  ) -> Vec<String> {
    let mut args = vec![
      "run".to_string(),
      "--rm".to_string(),
      "--name".to_string(),
      Self::container_name(handle),
      "-v".to_string(),
      format!("{}:{}", workdir.display(), CONTAINER_WORKDIR),
      "-w".to_string(),
      CONTAINER_WORKDIR.to_string(),
    ];
    if let Some(staging) = &invocation.staging_dir {
      args.push("-v".to_string());
      args.push(format!("{0}:{0}:ro", staging.display()));
    }
    if let Some(cpus) = invocation.limits.cpus {
      args.push(format!("--cpus={}", cpus));
    }
    if let Some(memory_mb) = invocation.limits.memory_mb {
      args.push(format!("--memory={}m", memory_mb));
    }
    args.push(image.to_string());
    args.extend(invocation.argv.iter().cloned());
    args
  }

  async fn control(&self, verb: &str, extra: &[String], name: &str) {
    let result = Command::new(&self.runtime)
      .arg(verb)
      .args(extra)
      .arg(name)
      .stdin(Stdio::null())
      .stdout(Stdio::null())
      .stderr(Stdio::null())
      .status()
      .await;
    if let Err(e) = result {
      warn!(container = %name, verb, error = %e, "container control command failed");
    }
  }
}

impl Default for ContainerBackend {
  fn default() -> Self {
    Self::new("docker", Duration::from_secs(5))
  }
}

#[async_trait]
impl ExecutionBackend for ContainerBackend {
  #[instrument(
    name = "container_run",
    skip(self, handle, invocation),
    fields(job_id = %handle.job_id(), handle = %handle.id())
  )]
  async fn run(
    &self,
    handle: &RunHandle,
    invocation: Invocation,
  ) -> Result<BackendOutput, BackendError> {
    if invocation.argv.is_empty() {
      return Err(BackendError::EmptyCommand);
    }
    let image = invocation
      .container_image
      .as_deref()
      .ok_or(BackendError::MissingImage)?;

    let dir = InvocationDir::create(&invocation.workdir_root, handle).await?;
    let (stdout, stderr) = dir.capture_files().await?;
    let args = self.run_args(handle, &invocation, image, &dir.work);
    debug!(runtime = %self.runtime, args = ?args, "container command");

    let mut child = Command::new(&self.runtime)
      .args(&args)
      .stdin(Stdio::null())
      .stdout(Stdio::from(stdout))
      .stderr(Stdio::from(stderr))
      .kill_on_drop(true)
      .spawn()
      .map_err(|e| BackendError::Spawn {
        program: self.runtime.clone(),
        message: e.to_string(),
      })?;
    info!(image = %image, "container_started");

    let name = Self::container_name(handle);
    let (status, cancelled) = tokio::select! {
      status = child.wait() => (status?, false),
      _ = handle.cancelled() => {
        let grace = self.grace_period.as_secs().max(1).to_string();
        self.control("stop", &["--time".to_string(), grace], &name).await;
        let status = match tokio::time::timeout(self.grace_period, child.wait()).await {
          Ok(status) => status?,
          Err(_) => {
            warn!(container = %name, "container ignored stop, killing");
            self.control("kill", &[], &name).await;
            let _ = child.start_kill();
            child.wait().await?
          }
        };
        (status, true)
      }
    };

    let exit_code = exit_code_of(status);
    info!(exit_code, cancelled, "container_exited");
    dir.into_output(exit_code, cancelled).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::backend::ResourceLimits;
  use std::path::{Path, PathBuf};

  #[test]
  fn test_run_args() {
    let backend = ContainerBackend::new("podman", Duration::from_secs(2));
    let handle = RunHandle::new("job-1");
    let invocation = Invocation {
      argv: vec!["wc".to_string(), "-l".to_string(), "/stage/in.txt".to_string()],
      workdir_root: PathBuf::from("/tmp/runs"),
      staging_dir: Some(PathBuf::from("/stage")),
      container_image: Some("alpine:3".to_string()),
      limits: ResourceLimits {
        cpus: Some(1.5),
        memory_mb: Some(256),
      },
    };

    let args = backend.run_args(&handle, &invocation, "alpine:3", Path::new("/tmp/runs/x/work"));
    let name = format!("weft-{}", handle.id());
    assert_eq!(
      args,
      vec![
        "run",
        "--rm",
        "--name",
        name.as_str(),
        "-v",
        "/tmp/runs/x/work:/work",
        "-w",
        "/work",
        "-v",
        "/stage:/stage:ro",
        "--cpus=1.5",
        "--memory=256m",
        "alpine:3",
        "wc",
        "-l",
        "/stage/in.txt",
      ]
    );
  }

  #[tokio::test]
  async fn test_missing_image_is_rejected() {
    let root = tempfile::tempdir().unwrap();
    let backend = ContainerBackend::default();
    let invocation = Invocation {
      argv: vec!["true".to_string()],
      workdir_root: root.path().to_path_buf(),
      staging_dir: None,
      container_image: None,
      limits: ResourceLimits::default(),
    };
    let result = backend.run(&RunHandle::new("job-2"), invocation).await;
    assert!(matches!(result, Err(BackendError::MissingImage)));
  }
}
