//! Shared fixtures: a scripted backend that records every call.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tempfile::TempDir;
use weft_backend::{BackendError, BackendOutput, Backends, ExecutionBackend, Invocation, RunHandle};
use weft_engine::{Engine, RunResult, SubmitOptions};
use weft_graph::WorkflowGraph;

/// Backend that interprets argv as a tiny script instead of spawning
/// processes:
///
/// - `echo <text>`: print `text`, exit 0
/// - `fail <code>`: print `boom` to stderr, exit `code`
/// - `sleep <ms> <text>`: wait, then behave like `echo`
/// - `sleep-fail <ms> <code>`: wait, then behave like `fail`
/// - `write <path> <content>`: create a file in the working directory
/// - `hang`: block until cancelled
#[derive(Default)]
pub struct ScriptedBackend {
  runs: AtomicUsize,
  cancels: AtomicUsize,
  in_flight: AtomicUsize,
  peak: AtomicUsize,
  argvs: Mutex<Vec<Vec<String>>>,
}

/// Decrements the in-flight count when a run returns.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
  fn drop(&mut self) {
    self.0.fetch_sub(1, Ordering::SeqCst);
  }
}

impl ScriptedBackend {
  pub fn runs(&self) -> usize {
    self.runs.load(Ordering::SeqCst)
  }

  pub fn cancels(&self) -> usize {
    self.cancels.load(Ordering::SeqCst)
  }

  /// Most runs that were ever in progress at the same time.
  pub fn peak_in_flight(&self) -> usize {
    self.peak.load(Ordering::SeqCst)
  }

  pub fn argvs(&self) -> Vec<Vec<String>> {
    self.argvs.lock().unwrap().clone()
  }
}

#[async_trait]
impl ExecutionBackend for ScriptedBackend {
  async fn run(
    &self,
    handle: &RunHandle,
    invocation: Invocation,
  ) -> Result<BackendOutput, BackendError> {
    self.runs.fetch_add(1, Ordering::SeqCst);
    let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    self.peak.fetch_max(now, Ordering::SeqCst);
    let _in_flight = InFlight(&self.in_flight);
    self.argvs.lock().unwrap().push(invocation.argv.clone());

    let base = invocation.workdir_root.join(handle.id());
    let workdir = base.join("work");
    tokio::fs::create_dir_all(&workdir).await?;

    let argv = invocation.argv;
    let arg = |i: usize| argv.get(i).cloned().unwrap_or_default();
    let mut stdout = String::new();
    let mut stderr = String::new();
    let mut exit_code = 0;
    let mut cancelled = false;
    let mut produced_paths = Vec::new();

    match arg(0).as_str() {
      "echo" => stdout = format!("{}\n", arg(1)),
      "fail" => {
        stderr = "boom\n".to_string();
        exit_code = arg(1).parse().unwrap_or(1);
      }
      "sleep" | "sleep-fail" => {
        let ms: u64 = arg(1).parse().unwrap_or(0);
        tokio::select! {
          _ = tokio::time::sleep(Duration::from_millis(ms)) => {
            if arg(0) == "sleep" {
              stdout = format!("{}\n", arg(2));
            } else {
              stderr = "boom\n".to_string();
              exit_code = arg(2).parse().unwrap_or(1);
            }
          }
          _ = handle.cancelled() => {
            cancelled = true;
            exit_code = 143;
          }
        }
      }
      "write" => {
        tokio::fs::write(workdir.join(arg(1)), arg(2)).await?;
        produced_paths.push(arg(1).into());
      }
      "hang" => {
        handle.cancelled().await;
        cancelled = true;
        exit_code = 143;
      }
      other => {
        stderr = format!("unknown command: {}\n", other);
        exit_code = 127;
      }
    }

    let stdout_ref = base.join("stdout");
    let stderr_ref = base.join("stderr");
    tokio::fs::write(&stdout_ref, stdout).await?;
    tokio::fs::write(&stderr_ref, stderr).await?;

    Ok(BackendOutput {
      exit_code,
      cancelled,
      workdir,
      produced_paths,
      stdout_ref,
      stderr_ref,
    })
  }

  async fn cancel(&self, handle: &RunHandle) -> Result<(), BackendError> {
    self.cancels.fetch_add(1, Ordering::SeqCst);
    handle.signal_cancel();
    Ok(())
  }
}

/// Temporary cache and work directories plus the scripted backend.
pub struct Harness {
  pub backend: Arc<ScriptedBackend>,
  pub dir: TempDir,
}

impl Harness {
  pub fn new() -> Self {
    Self {
      backend: Arc::new(ScriptedBackend::default()),
      dir: tempfile::tempdir().expect("failed to create temp dir"),
    }
  }

  pub fn options(&self) -> SubmitOptions {
    SubmitOptions {
      cache_dir: self.dir.path().join("cache"),
      work_dir: self.dir.path().join("runs"),
      cancel_grace_period: Duration::from_millis(200),
      ..SubmitOptions::default()
    }
  }

  pub fn engine(&self) -> Engine {
    Engine::new(Backends::uniform(self.backend.clone()))
  }

  pub async fn run(&self, graph: WorkflowGraph, inputs: Value) -> RunResult {
    self.run_with(graph, inputs, self.options()).await
  }

  pub async fn run_with(
    &self,
    graph: WorkflowGraph,
    inputs: Value,
    options: SubmitOptions,
  ) -> RunResult {
    let inputs: Map<String, Value> = inputs.as_object().cloned().unwrap_or_default();
    self.engine().submit(Arc::new(graph), inputs, options).await
  }
}
