//! Weft Engine
//!
//! Executes a [`WorkflowGraph`](weft_graph::WorkflowGraph) of command-line
//! steps.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Engine                              │
//! │  - submit(graph, inputs, options) → RunResult               │
//! │  - validates the graph and workflow inputs up front         │
//! └─────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Scheduler                            │
//! │  - readiness counters, FIFO ready queue, concurrency bound  │
//! │  - scatter expansion, `when` conditions, failure policy     │
//! │  - sole owner of job state; workers report over a channel   │
//! └─────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       JobExecutor                           │
//! │  - fingerprint → cache claim → stage → backend → bind       │
//! │  - per-job timeout, single cancel request per interruption  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Once the scheduler settles, the declared workflow outputs are collected
//! and the run is classified: `0` success, `1` failed jobs or unresolved
//! required outputs, `2` rejected before any job ran.
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use weft_engine::{SubmitOptions, submit};
//!
//! let graph = Arc::new(JsonLoader.load_file(path)?);
//! let result = submit(graph, inputs, SubmitOptions::default()).await;
//! std::process::exit(result.exit_code());
//! ```

mod binding;
mod collector;
mod condition;
mod engine;
mod error;
mod events;
mod executor;
mod job;
mod options;
mod resolve;
mod result;
mod scatter;
mod scheduler;

pub use condition::evaluate_condition;
pub use engine::{Engine, submit, submit_with_cancel};
pub use error::JobError;
pub use events::{ChannelNotifier, ExecutionEvent, ExecutionNotifier, NoopNotifier};
pub use job::{JobId, JobRecord, JobState, SkipReason};
pub use options::SubmitOptions;
pub use result::{CancellationNote, ExitClass, FailureReport, RunResult};
