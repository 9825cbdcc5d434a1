//! Document loading boundary.
//!
//! Turning a workflow document into a typed graph is the job of an external
//! loader. [`JsonLoader`] is the minimal implementation: it reads the graph
//! arena as serialized JSON and validates it.

use std::path::Path;

use crate::error::GraphError;
use crate::graph::WorkflowGraph;

/// Produces a validated [`WorkflowGraph`] from some source document.
pub trait DocumentLoader {
  fn load(&self, source: &str) -> Result<WorkflowGraph, GraphError>;
}

/// Loads the serialized graph arena from a JSON string.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLoader;

impl JsonLoader {
  /// Read and load a JSON document from disk.
  pub fn load_file(&self, path: &Path) -> Result<WorkflowGraph, GraphError> {
    let content = std::fs::read_to_string(path)
      .map_err(|e| GraphError::Load(format!("{}: {}", path.display(), e)))?;
    self.load(&content)
  }
}

impl DocumentLoader for JsonLoader {
  fn load(&self, source: &str) -> Result<WorkflowGraph, GraphError> {
    let graph: WorkflowGraph =
      serde_json::from_str(source).map_err(|e| GraphError::Load(e.to_string()))?;
    graph.validate()?;
    Ok(graph)
  }
}
