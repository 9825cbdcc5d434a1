//! Weft Graph
//!
//! The typed workflow graph consumed by the weft engine. A graph is an arena
//! of [`Step`]s indexed by [`StepId`]; dependency edges are index references
//! derived from port sources, never direct links.
//!
//! Key properties:
//! - Built once (by a [`DocumentLoader`] or programmatically) and read-only
//!   during execution
//! - [`WorkflowGraph::validate`] rejects cycles and dangling references and
//!   returns the [`Topology`] used for scheduling

mod error;
mod graph;
mod loader;
mod step;
mod types;

pub use error::GraphError;
pub use graph::{StepId, Topology, WorkflowGraph, WorkflowInput, WorkflowOutput};
pub use loader::{DocumentLoader, JsonLoader};
pub use step::{
  ContainerRequirement, InputPort, OutputBinding, OutputPort, Requirements, Scatter, Source, Step,
};
pub use types::{
  DIRECTORY_CLASS, FILE_CLASS, PortType, class_of, directory_value, file_value, is_file_like,
  path_of,
};
