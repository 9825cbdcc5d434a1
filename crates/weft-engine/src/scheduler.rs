//! Dependency scheduler.
//!
//! A single control loop owns every job's state. Worker tasks report back
//! over one mpsc channel; nothing else mutates scheduling state.
//!
//! Readiness is tracked per step as a counter of unresolved predecessor
//! ports. When a step's last predecessor reaches a terminal state the step
//! is materialized into jobs (one, or one per scatter position), each job is
//! prepared, and runnable jobs join a FIFO ready queue.

use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use weft_graph::{Source, StepId, Topology, WorkflowGraph};

use crate::error::JobError;
use crate::events::{ExecutionEvent, ExecutionNotifier};
use crate::executor::{Execution, JobExecutor, JobRequest, Outcome};
use crate::job::{JobRecord, JobState, SkipReason};
use crate::resolve::{Preparation, prepare_inputs};
use crate::result::{CancellationNote, FailureReport};
use crate::scatter;

/// Terminal result of a whole step.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StepOutcome {
  /// Output values by port; arrays for scattered steps.
  Completed(Map<String, Value>),
  /// Every output is `null`.
  Skipped(SkipReason),
  Failed,
}

/// Message from a worker task.
struct JobCompletion {
  job: usize,
  execution: Execution,
}

#[derive(Debug, Clone)]
enum AbortCause {
  FailFast { job_id: String },
  External,
}

#[derive(Default)]
struct StepRun {
  /// Predecessor ports not yet terminal.
  remaining: usize,
  /// Jobs of this step, by index into the job arena.
  jobs: Vec<usize>,
  /// Output nesting for scattered steps.
  shape: Option<Vec<usize>>,
  /// Jobs not yet terminal.
  outstanding: usize,
  /// Ports whose `null` may come from a skipped producer.
  skipped_ports: HashSet<String>,
  outcome: Option<StepOutcome>,
}

/// What the scheduler hands back once every step is terminal.
pub(crate) struct ScheduleReport {
  pub jobs: Vec<JobRecord>,
  pub step_outcomes: Vec<Option<StepOutcome>>,
  pub failures: Vec<FailureReport>,
  pub cancellations: Vec<CancellationNote>,
}

pub(crate) struct SchedulerConfig {
  pub run_id: String,
  pub max_concurrency: usize,
  pub fail_fast: bool,
}

pub(crate) struct Scheduler {
  run_id: String,
  graph: Arc<WorkflowGraph>,
  topology: Topology,
  workflow_inputs: Map<String, Value>,
  executor: Arc<JobExecutor>,
  notifier: Arc<dyn ExecutionNotifier>,
  max_concurrency: usize,
  fail_fast: bool,

  steps: Vec<StepRun>,
  jobs: Vec<JobRecord>,
  ready: VecDeque<usize>,
  running: HashMap<usize, CancellationToken>,
  aborted: Option<AbortCause>,
  failures: Vec<FailureReport>,
  cancellations: Vec<CancellationNote>,

  completions_tx: mpsc::UnboundedSender<JobCompletion>,
  completions_rx: mpsc::UnboundedReceiver<JobCompletion>,
}

impl Scheduler {
  pub fn new(
    graph: Arc<WorkflowGraph>,
    topology: Topology,
    workflow_inputs: Map<String, Value>,
    executor: Arc<JobExecutor>,
    notifier: Arc<dyn ExecutionNotifier>,
    config: SchedulerConfig,
  ) -> Self {
    let steps = graph
      .step_ids()
      .map(|id| StepRun {
        remaining: topology.dependency_ports(id).len(),
        ..StepRun::default()
      })
      .collect();
    let (completions_tx, completions_rx) = mpsc::unbounded_channel();

    Self {
      run_id: config.run_id,
      graph,
      topology,
      workflow_inputs,
      executor,
      notifier,
      max_concurrency: config.max_concurrency.max(1),
      fail_fast: config.fail_fast,
      steps,
      jobs: Vec::new(),
      ready: VecDeque::new(),
      running: HashMap::new(),
      aborted: None,
      failures: Vec::new(),
      cancellations: Vec::new(),
      completions_tx,
      completions_rx,
    }
  }

  /// Drive every step to a terminal state.
  pub async fn run(mut self, cancel: CancellationToken) -> ScheduleReport {
    let initial = self.topology.entry_points().to_vec();
    for id in initial {
      self.materialize(id);
    }

    loop {
      if cancel.is_cancelled() && self.aborted.is_none() {
        self.abort(AbortCause::External);
      }

      self.dispatch();
      if self.running.is_empty() {
        break;
      }

      tokio::select! {
        Some(completion) = self.completions_rx.recv() => self.on_completion(completion),
        _ = cancel.cancelled(), if self.aborted.is_none() => self.abort(AbortCause::External),
      }
    }

    for (index, run) in self.steps.iter().enumerate() {
      if run.outcome.is_none() {
        error!(step = %self.graph.steps[index].name, "step_never_resolved");
      }
    }

    ScheduleReport {
      jobs: self.jobs,
      step_outcomes: self.steps.into_iter().map(|s| s.outcome).collect(),
      failures: self.failures,
      cancellations: self.cancellations,
    }
  }

  /// Start ready jobs in FIFO order up to the concurrency bound.
  fn dispatch(&mut self) {
    while self.aborted.is_none() && self.running.len() < self.max_concurrency {
      let Some(job) = self.ready.pop_front() else {
        break;
      };
      self.start(job);
    }
  }

  fn start(&mut self, job: usize) {
    let record = &mut self.jobs[job];
    record.state = JobState::Running;
    record.started_at = Some(Utc::now());

    let request = JobRequest {
      job_id: record.job_id.clone(),
      step_id: record.step_id,
      inputs: record.inputs.clone(),
    };
    info!(run_id = %self.run_id, job_id = %request.job_id, "job_dispatched");
    self.notifier.notify(ExecutionEvent::JobStarted {
      run_id: self.run_id.clone(),
      job_id: request.job_id.clone(),
    });

    let token = CancellationToken::new();
    self.running.insert(job, token.clone());

    let executor = self.executor.clone();
    let tx = self.completions_tx.clone();
    tokio::spawn(async move {
      let execution = AssertUnwindSafe(executor.execute(request, token))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| {
          Execution::failed(JobError::Internal {
            message: "job worker panicked".to_string(),
          })
        });
      // The scheduler outlives every worker.
      let _ = tx.send(JobCompletion { job, execution });
    });
  }

  fn on_completion(&mut self, completion: JobCompletion) {
    let JobCompletion { job, execution } = completion;
    self.running.remove(&job);

    let record = &mut self.jobs[job];
    record.finished_at = Some(Utc::now());
    record.fingerprint = execution.fingerprint;
    record.cached = execution.cached;
    record.handle_id = execution.handle_id;
    record.stdout_ref = execution.stdout_ref;
    record.stderr_ref = execution.stderr_ref;

    match execution.outcome {
      Outcome::Completed(outputs) => {
        record.state = JobState::Completed;
        record.outputs = Some(outputs);
        info!(
          run_id = %self.run_id,
          job_id = %record.job_id,
          cached = record.cached,
          "job_completed"
        );
        self.notifier.notify(ExecutionEvent::JobCompleted {
          run_id: self.run_id.clone(),
          job_id: record.job_id.clone(),
          cached: record.cached,
        });
      }
      Outcome::Failed(error) => self.fail_job(job, error),
      Outcome::Cancelled => {
        self.note_cancellation(job, true);
        self.skip_job(job, SkipReason::Cancelled);
      }
    }

    self.job_finished(job);
  }

  /// Stop everything: running jobs get one cancel request, ready jobs are
  /// skipped, and steps materialized from now on are skipped.
  fn abort(&mut self, cause: AbortCause) {
    warn!(run_id = %self.run_id, cause = ?cause, "run_aborting");
    self.aborted = Some(cause);

    let mut running: Vec<usize> = self.running.keys().copied().collect();
    running.sort_unstable();
    for job in running {
      if let Some(token) = self.running.get(&job) {
        token.cancel();
      }
      self.notifier.notify(ExecutionEvent::JobCancelRequested {
        run_id: self.run_id.clone(),
        job_id: self.jobs[job].job_id.clone(),
      });
    }

    let ready: Vec<usize> = self.ready.drain(..).collect();
    for job in ready {
      self.note_cancellation(job, false);
      self.skip_job(job, SkipReason::Cancelled);
      self.job_finished(job);
    }
  }

  /// Turn a step whose predecessors are all terminal into jobs.
  fn materialize(&mut self, id: StepId) {
    let graph = self.graph.clone();
    let step = graph.step(id);

    if self.aborted.is_some() {
      return self.skip_step(id, SkipReason::Cancelled);
    }
    if let Some(reason) = self.blocked_by_upstream(id) {
      return self.skip_step(id, reason);
    }

    let mut values = Map::new();
    let mut skipped_ports = HashSet::new();
    for port in &step.inputs {
      let value = match &port.source {
        Source::Literal(value) => value.clone(),
        Source::WorkflowInput(name) => self
          .workflow_inputs
          .get(name)
          .cloned()
          .unwrap_or(Value::Null),
        Source::StepOutput {
          step: producer,
          port: output,
        } => {
          if self.has_skips(*producer) {
            skipped_ports.insert(port.name.clone());
          }
          match &self.steps[producer.0].outcome {
            Some(StepOutcome::Completed(outputs)) => {
              outputs.get(output).cloned().unwrap_or(Value::Null)
            }
            _ => Value::Null,
          }
        }
      };
      values.insert(port.name.clone(), value);
    }
    self.steps[id.0].skipped_ports = skipped_ports;

    if !step.scatter.is_scattered() {
      let job = self.new_job(id, None, values);
      self.steps[id.0].outstanding = 1;
      self.prepare(job);
      return;
    }

    for name in step.scatter.inputs() {
      let slot = values.entry(name.clone()).or_insert(Value::Null);
      if slot.is_null() {
        if let Some(default) = step.get_input(name).and_then(|p| p.default.clone()) {
          *slot = default;
        } else if self.steps[id.0].skipped_ports.contains(name) {
          return self.skip_step(id, SkipReason::UpstreamSkipped);
        }
      }
    }

    match scatter::expand(step, &values) {
      Err(error) => self.fail_step(id, values, error),
      Ok(plan) if plan.jobs.is_empty() => {
        info!(run_id = %self.run_id, step = %step.name, "empty_scatter");
        let outputs = step
          .outputs
          .iter()
          .map(|port| (port.name.clone(), scatter::gather(&plan.shape, &[])))
          .collect();
        self.steps[id.0].shape = Some(plan.shape);
        self.complete_step(id, StepOutcome::Completed(outputs));
      }
      Ok(plan) => {
        let jobs: Vec<usize> = plan
          .jobs
          .into_iter()
          .map(|(index, inputs)| self.new_job(id, Some(index), inputs))
          .collect();
        let run = &mut self.steps[id.0];
        run.shape = Some(plan.shape);
        run.outstanding = jobs.len();
        for job in jobs {
          self.prepare(job);
        }
      }
    }
  }

  /// Apply defaults, the condition, and input checks; then queue, skip, or
  /// fail the job.
  fn prepare(&mut self, job: usize) {
    if self.aborted.is_some() {
      self.note_cancellation(job, false);
      self.skip_job(job, SkipReason::Cancelled);
      return self.job_finished(job);
    }

    let step_id = self.jobs[job].step_id;
    let graph = self.graph.clone();
    let inputs = std::mem::take(&mut self.jobs[job].inputs);
    let preparation = prepare_inputs(
      graph.step(step_id),
      inputs,
      &self.steps[step_id.0].skipped_ports,
    );

    match preparation {
      Preparation::Ready(inputs) => {
        let record = &mut self.jobs[job];
        record.inputs = inputs;
        record.state = JobState::Ready;
        self.notifier.notify(ExecutionEvent::JobReady {
          run_id: self.run_id.clone(),
          job_id: record.job_id.clone(),
        });
        self.ready.push_back(job);
      }
      Preparation::Skip(inputs, reason) => {
        self.jobs[job].inputs = inputs;
        self.skip_job(job, reason);
        self.job_finished(job);
      }
      Preparation::Fail(inputs, error) => {
        self.jobs[job].inputs = inputs;
        self.fail_job(job, error);
        self.job_finished(job);
      }
    }
  }

  fn new_job(
    &mut self,
    step: StepId,
    scatter_index: Option<Vec<usize>>,
    inputs: Map<String, Value>,
  ) -> usize {
    let record = JobRecord::new(step, &self.graph.step(step).name, scatter_index, inputs);
    self.jobs.push(record);
    let job = self.jobs.len() - 1;
    self.steps[step.0].jobs.push(job);
    job
  }

  fn skip_job(&mut self, job: usize, reason: SkipReason) {
    let record = &mut self.jobs[job];
    record.state = JobState::Skipped(reason);
    record.finished_at.get_or_insert_with(Utc::now);
    info!(run_id = %self.run_id, job_id = %record.job_id, reason = ?reason, "job_skipped");
    self.notifier.notify(ExecutionEvent::JobSkipped {
      run_id: self.run_id.clone(),
      job_id: record.job_id.clone(),
      reason,
    });
  }

  fn fail_job(&mut self, job: usize, error: JobError) {
    let record = &mut self.jobs[job];
    record.state = JobState::Failed;
    record.error = Some(error.clone());
    record.finished_at.get_or_insert_with(Utc::now);
    error!(run_id = %self.run_id, job_id = %record.job_id, error = %error, "job_failed");
    self.notifier.notify(ExecutionEvent::JobFailed {
      run_id: self.run_id.clone(),
      job_id: record.job_id.clone(),
      error: error.clone(),
    });

    let report = self.failure_report(job, error);
    self.failures.push(report);

    if self.fail_fast && self.aborted.is_none() {
      let job_id = self.jobs[job].job_id.to_string();
      self.abort(AbortCause::FailFast { job_id });
    }
  }

  fn failure_report(&self, job: usize, error: JobError) -> FailureReport {
    let record = &self.jobs[job];
    let names = |ids: &[StepId]| -> Vec<String> {
      ids
        .iter()
        .map(|id| self.graph.step(*id).name.clone())
        .collect()
    };
    FailureReport {
      job_id: record.job_id.clone(),
      step: record.step.clone(),
      scatter_index: record.scatter_index.clone(),
      fingerprint: record.fingerprint.clone(),
      error,
      stderr_ref: record.stderr_ref.clone(),
      predecessors: names(self.topology.upstream(record.step_id)),
      successors: names(self.topology.downstream(record.step_id)),
    }
  }

  fn note_cancellation(&mut self, job: usize, was_running: bool) {
    let reason = match &self.aborted {
      Some(AbortCause::FailFast { job_id }) => format!("fail-fast after '{}' failed", job_id),
      Some(AbortCause::External) | None => "run cancelled".to_string(),
    };
    let record = &self.jobs[job];
    self.cancellations.push(CancellationNote {
      job_id: record.job_id.clone(),
      step: record.step.clone(),
      was_running,
      reason,
    });
  }

  fn job_finished(&mut self, job: usize) {
    let step = self.jobs[job].step_id;
    let run = &mut self.steps[step.0];
    run.outstanding = run.outstanding.saturating_sub(1);
    if run.outstanding == 0 && run.outcome.is_none() {
      let outcome = self.step_outcome(step);
      self.complete_step(step, outcome);
    }
  }

  /// Fold the step's job states into one outcome.
  fn step_outcome(&self, id: StepId) -> StepOutcome {
    let run = &self.steps[id.0];
    let states: Vec<JobState> = run.jobs.iter().map(|j| self.jobs[*j].state).collect();

    if states.contains(&JobState::Failed) {
      return StepOutcome::Failed;
    }
    if states.contains(&JobState::Skipped(SkipReason::Cancelled)) {
      return StepOutcome::Skipped(SkipReason::Cancelled);
    }

    let step = self.graph.step(id);
    match &run.shape {
      None => match states.first() {
        Some(JobState::Skipped(reason)) => StepOutcome::Skipped(*reason),
        _ => StepOutcome::Completed(
          run
            .jobs
            .first()
            .and_then(|j| self.jobs[*j].outputs.clone())
            .unwrap_or_default(),
        ),
      },
      Some(shape) => {
        let outputs = step
          .outputs
          .iter()
          .map(|port| {
            let slots: Vec<Value> = run
              .jobs
              .iter()
              .map(|j| {
                self.jobs[*j]
                  .outputs
                  .as_ref()
                  .and_then(|o| o.get(&port.name).cloned())
                  .unwrap_or(Value::Null)
              })
              .collect();
            (port.name.clone(), scatter::gather(shape, &slots))
          })
          .collect();
        StepOutcome::Completed(outputs)
      }
    }
  }

  /// Record a step outcome and release downstream steps in ascending order.
  fn complete_step(&mut self, id: StepId, outcome: StepOutcome) {
    info!(
      run_id = %self.run_id,
      step = %self.graph.step(id).name,
      outcome = %step_outcome_label(&outcome),
      "step_finished"
    );
    self.steps[id.0].outcome = Some(outcome);

    let downstream = self.topology.downstream(id).to_vec();
    for next in downstream {
      let ports = self
        .topology
        .dependency_ports(next)
        .iter()
        .filter(|(producer, _)| *producer == id)
        .count();
      let run = &mut self.steps[next.0];
      run.remaining = run.remaining.saturating_sub(ports);
      if run.remaining == 0 && run.outcome.is_none() && run.jobs.is_empty() {
        self.materialize(next);
      }
    }
  }

  /// A step-level skip: one record for the whole step.
  fn skip_step(&mut self, id: StepId, reason: SkipReason) {
    let job = self.new_job(id, None, Map::new());
    if reason == SkipReason::Cancelled {
      self.note_cancellation(job, false);
    }
    self.skip_job(job, reason);
    self.complete_step(id, StepOutcome::Skipped(reason));
  }

  /// A step-level failure, e.g. a scatter over mismatched arrays.
  fn fail_step(&mut self, id: StepId, inputs: Map<String, Value>, error: JobError) {
    let job = self.new_job(id, None, inputs);
    self.fail_job(job, error);
    self.complete_step(id, StepOutcome::Failed);
  }

  fn blocked_by_upstream(&self, id: StepId) -> Option<SkipReason> {
    let mut reason = None;
    for producer in self.topology.upstream(id) {
      match &self.steps[producer.0].outcome {
        Some(StepOutcome::Failed) | Some(StepOutcome::Skipped(SkipReason::UpstreamFailed)) => {
          return Some(SkipReason::UpstreamFailed);
        }
        Some(StepOutcome::Skipped(SkipReason::Cancelled)) => {
          reason = Some(SkipReason::Cancelled);
        }
        _ => {}
      }
    }
    reason
  }

  /// Whether any `null` produced by this step may stem from a skip.
  fn has_skips(&self, id: StepId) -> bool {
    match &self.steps[id.0].outcome {
      Some(StepOutcome::Skipped(_)) => true,
      _ => self.steps[id.0]
        .jobs
        .iter()
        .any(|j| matches!(self.jobs[*j].state, JobState::Skipped(_))),
    }
  }
}

fn step_outcome_label(outcome: &StepOutcome) -> String {
  match outcome {
    StepOutcome::Completed(_) => "completed".to_string(),
    StepOutcome::Skipped(reason) => format!("skipped({:?})", reason),
    StepOutcome::Failed => "failed".to_string(),
  }
}
