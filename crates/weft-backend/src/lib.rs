//! Weft Backend
//!
//! Execution backends and input staging for the weft engine.
//!
//! - [`ExecutionBackend`]: runs one [`Invocation`] in a fresh working
//!   directory, capturing stdout/stderr to files, and honors cancellation
//! - [`LocalProcessBackend`] and [`ContainerBackend`] are the two built-in
//!   variants; [`Backends`] routes a step to one of them by [`BackendKind`]
//! - [`Stager`]: makes input files reachable by the backend

mod backend;
mod container;
mod error;
mod local;
mod stager;

pub use backend::{
  BackendKind, BackendOutput, Backends, ExecutionBackend, Invocation, ResourceLimits, RunHandle,
};
pub use container::ContainerBackend;
pub use error::{BackendError, StageError};
pub use local::LocalProcessBackend;
pub use stager::{LocalStager, StageMode, StagedInputs, Stager};
