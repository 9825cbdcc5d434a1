//! Run submission.
//!
//! [`Engine`] wires a validated graph, the cache, the backends, and the
//! stager into one scheduler run and assembles the [`RunResult`].

use std::sync::Arc;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use weft_backend::{
  Backends, ContainerBackend, LocalProcessBackend, LocalStager, StageMode, Stager,
};
use weft_cache::CacheStore;
use weft_graph::{GraphError, WorkflowGraph};

use crate::collector::collect_outputs;
use crate::events::{ExecutionEvent, ExecutionNotifier, NoopNotifier};
use crate::executor::{ExecutorConfig, JobExecutor};
use crate::options::SubmitOptions;
use crate::result::RunResult;
use crate::scheduler::{Scheduler, SchedulerConfig};

/// Executes workflow graphs.
///
/// Holds the pieces that outlive a single run: the backend routing table,
/// an optional stager, and the event notifier. Use [`Engine::new`] with
/// custom backends, or the free [`submit`] function for the built-in ones.
pub struct Engine {
  backends: Backends,
  stager: Option<Arc<dyn Stager>>,
  notifier: Arc<dyn ExecutionNotifier>,
}

impl Engine {
  /// Create an engine with no-op notifications and the default stager.
  pub fn new(backends: Backends) -> Self {
    Self {
      backends,
      stager: None,
      notifier: Arc::new(NoopNotifier),
    }
  }

  /// Local processes plus a `docker` container backend.
  pub fn with_builtin_backends(options: &SubmitOptions) -> Self {
    let grace = options.cancel_grace_period;
    Self::new(Backends::new(
      Arc::new(LocalProcessBackend::new(grace)),
      Arc::new(ContainerBackend::new("docker", grace)),
    ))
  }

  /// Stage inputs with `stager` instead of symlinking under the work dir.
  pub fn with_stager(mut self, stager: Arc<dyn Stager>) -> Self {
    self.stager = Some(stager);
    self
  }

  pub fn with_notifier(mut self, notifier: Arc<dyn ExecutionNotifier>) -> Self {
    self.notifier = notifier;
    self
  }

  /// Run `graph` to completion.
  pub async fn submit(
    &self,
    graph: Arc<WorkflowGraph>,
    inputs: Map<String, Value>,
    options: SubmitOptions,
  ) -> RunResult {
    self
      .submit_with_cancel(graph, inputs, options, CancellationToken::new())
      .await
  }

  /// Run `graph`, aborting like fail-fast once `cancel` fires.
  #[instrument(
    name = "run",
    skip(self, graph, inputs, options, cancel),
    fields(workflow = %graph.name)
  )]
  pub async fn submit_with_cancel(
    &self,
    graph: Arc<WorkflowGraph>,
    inputs: Map<String, Value>,
    options: SubmitOptions,
    cancel: CancellationToken,
  ) -> RunResult {
    let run_id = uuid::Uuid::new_v4().to_string();
    let workflow = graph.name.clone();

    let topology = match graph.validate() {
      Ok(topology) => topology,
      Err(e) => {
        error!(run_id = %run_id, error = %e, "graph_rejected");
        return self.finish(RunResult::fatal(run_id, workflow, e));
      }
    };
    let workflow_inputs = match resolve_workflow_inputs(&graph, inputs) {
      Ok(inputs) => inputs,
      Err(e) => {
        error!(run_id = %run_id, error = %e, "inputs_rejected");
        return self.finish(RunResult::fatal(run_id, workflow, e));
      }
    };
    let cache = match open_cache(&options, &run_id).await {
      Ok(cache) => cache,
      Err(message) => {
        error!(run_id = %run_id, error = %message, "cache_unavailable");
        return self.finish(RunResult::setup_failed(run_id, workflow, message));
      }
    };

    info!(
      run_id = %run_id,
      steps = graph.steps.len(),
      max_concurrency = options.concurrency(),
      fail_fast = options.fail_fast,
      "run_started"
    );
    self.notifier.notify(ExecutionEvent::RunStarted {
      run_id: run_id.clone(),
      workflow: workflow.clone(),
    });

    let stager = self.stager.clone().unwrap_or_else(|| {
      Arc::new(LocalStager::new(
        options.work_dir.join("staging"),
        StageMode::Symlink,
      ))
    });
    let executor = JobExecutor::new(
      graph.clone(),
      cache,
      self.backends.clone(),
      stager,
      ExecutorConfig {
        invocation_root: options.work_dir.join("jobs"),
        timeout_per_job: options.timeout_per_job,
        grace_period: options.cancel_grace_period,
        retain_workdirs: options.debug_retain_workdirs,
      },
    );
    let scheduler = Scheduler::new(
      graph.clone(),
      topology,
      workflow_inputs.clone(),
      Arc::new(executor),
      self.notifier.clone(),
      SchedulerConfig {
        run_id: run_id.clone(),
        max_concurrency: options.concurrency(),
        fail_fast: options.fail_fast,
      },
    );
    let report = scheduler.run(cancel).await;

    let (outputs, unresolved_outputs) =
      collect_outputs(&graph, &workflow_inputs, &report.step_outcomes);
    let exit = RunResult::classify(&report.jobs, &report.failures, &unresolved_outputs);

    self.finish(RunResult {
      run_id,
      workflow,
      outputs,
      jobs: report.jobs,
      failures: report.failures,
      cancellations: report.cancellations,
      unresolved_outputs,
      graph_error: None,
      setup_error: None,
      exit,
    })
  }

  fn finish(&self, result: RunResult) -> RunResult {
    info!(
      run_id = %result.run_id,
      exit_code = result.exit_code(),
      jobs = result.jobs.len(),
      failures = result.failures.len(),
      "run_finished"
    );
    self.notifier.notify(ExecutionEvent::RunFinished {
      run_id: result.run_id.clone(),
      exit_code: result.exit_code(),
    });
    result
  }
}

/// Run `graph` with the built-in backends.
pub async fn submit(
  graph: Arc<WorkflowGraph>,
  inputs: Map<String, Value>,
  options: SubmitOptions,
) -> RunResult {
  Engine::with_builtin_backends(&options)
    .submit(graph, inputs, options)
    .await
}

/// Run `graph` with the built-in backends until done or `cancel` fires.
pub async fn submit_with_cancel(
  graph: Arc<WorkflowGraph>,
  inputs: Map<String, Value>,
  options: SubmitOptions,
  cancel: CancellationToken,
) -> RunResult {
  Engine::with_builtin_backends(&options)
    .submit_with_cancel(graph, inputs, options, cancel)
    .await
}

/// Apply defaults and check every declared workflow input.
fn resolve_workflow_inputs(
  graph: &WorkflowGraph,
  mut provided: Map<String, Value>,
) -> Result<Map<String, Value>, GraphError> {
  let mut resolved = Map::new();
  for input in &graph.inputs {
    let value = match provided.remove(&input.name) {
      Some(value) if !value.is_null() => value,
      _ => input.default.clone().unwrap_or(Value::Null),
    };
    if value.is_null() {
      if input.required {
        return Err(GraphError::MissingWorkflowInput(input.name.clone()));
      }
    } else if !input.port_type.accepts(&value) {
      return Err(GraphError::InvalidWorkflowInput {
        input: input.name.clone(),
        message: format!("got {}", value),
      });
    }
    resolved.insert(input.name.clone(), value);
  }

  for name in provided.keys() {
    warn!(input = %name, "ignoring undeclared workflow input");
  }
  Ok(resolved)
}

/// Open the configured cache, falling back to a per-run temporary one.
async fn open_cache(options: &SubmitOptions, run_id: &str) -> Result<CacheStore, String> {
  match CacheStore::open(&options.cache_dir).await {
    Ok(cache) => Ok(cache),
    Err(e) => {
      let fallback = std::env::temp_dir().join(format!("weft-cache-{}", run_id));
      warn!(
        cache_dir = %options.cache_dir.display(),
        fallback = %fallback.display(),
        error = %e,
        "cache dir unusable, using a temporary cache"
      );
      CacheStore::open(&fallback)
        .await
        .map_err(|e| format!("no usable cache directory: {}", e))
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use weft_graph::PortType;

  fn graph_with_inputs() -> WorkflowGraph {
    let mut graph = WorkflowGraph::new("inputs");
    graph.add_input("reads", PortType::String, true);
    graph.add_input("threads", PortType::Int, false);
    graph.inputs[1].default = Some(json!(4));
    graph.add_input("note", PortType::String, false);
    graph
  }

  #[test]
  fn test_resolve_applies_defaults_and_drops_extras() {
    let provided = Map::from_iter([
      ("reads".to_string(), json!("r.fq")),
      ("extra".to_string(), json!(1)),
    ]);
    let resolved = resolve_workflow_inputs(&graph_with_inputs(), provided).unwrap();
    assert_eq!(
      Value::Object(resolved),
      json!({"reads": "r.fq", "threads": 4, "note": null})
    );
  }

  #[test]
  fn test_resolve_rejects_missing_and_mistyped() {
    let graph = graph_with_inputs();

    let err = resolve_workflow_inputs(&graph, Map::new()).unwrap_err();
    assert_eq!(err, GraphError::MissingWorkflowInput("reads".to_string()));

    let provided = Map::from_iter([
      ("reads".to_string(), json!("r.fq")),
      ("threads".to_string(), json!("many")),
    ]);
    let err = resolve_workflow_inputs(&graph, provided).unwrap_err();
    assert!(matches!(err, GraphError::InvalidWorkflowInput { ref input, .. } if input == "threads"));
  }
}
