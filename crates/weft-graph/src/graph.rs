use std::collections::{BTreeSet, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GraphError;
use crate::step::{Source, Step};
use crate::types::PortType;

/// Index of a step in the graph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(pub usize);

impl fmt::Display for StepId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "#{}", self.0)
  }
}

/// A workflow-level input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInput {
  pub name: String,
  pub port_type: PortType,
  #[serde(default = "default_true")]
  pub required: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub default: Option<Value>,
}

/// A workflow-level output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowOutput {
  pub name: String,
  pub source: Source,
  #[serde(default = "default_true")]
  pub required: bool,
}

/// The full typed graph. Steps live in an arena indexed by [`StepId`];
/// edges are derived from [`Source::StepOutput`] references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowGraph {
  pub name: String,
  #[serde(default)]
  pub inputs: Vec<WorkflowInput>,
  #[serde(default)]
  pub outputs: Vec<WorkflowOutput>,
  #[serde(default)]
  pub steps: Vec<Step>,
}

impl WorkflowGraph {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      inputs: Vec::new(),
      outputs: Vec::new(),
      steps: Vec::new(),
    }
  }

  /// Append a step and return its id.
  pub fn add_step(&mut self, step: Step) -> StepId {
    self.steps.push(step);
    StepId(self.steps.len() - 1)
  }

  pub fn add_input(&mut self, name: impl Into<String>, port_type: PortType, required: bool) {
    self.inputs.push(WorkflowInput {
      name: name.into(),
      port_type,
      required,
      default: None,
    });
  }

  pub fn add_output(&mut self, name: impl Into<String>, source: Source, required: bool) {
    self.outputs.push(WorkflowOutput {
      name: name.into(),
      source,
      required,
    });
  }

  pub fn step(&self, id: StepId) -> &Step {
    &self.steps[id.0]
  }

  pub fn get_step(&self, id: StepId) -> Option<&Step> {
    self.steps.get(id.0)
  }

  pub fn find_step(&self, name: &str) -> Option<StepId> {
    self.steps.iter().position(|s| s.name == name).map(StepId)
  }

  pub fn step_ids(&self) -> impl Iterator<Item = StepId> + '_ {
    (0..self.steps.len()).map(StepId)
  }

  pub fn get_input(&self, name: &str) -> Option<&WorkflowInput> {
    self.inputs.iter().find(|i| i.name == name)
  }

  /// Validate structure and compute the dependency topology.
  ///
  /// Checks names, every source reference, scatter ports, and acyclicity.
  pub fn validate(&self) -> Result<Topology, GraphError> {
    let mut names = HashSet::new();
    for step in &self.steps {
      if !names.insert(step.name.as_str()) {
        return Err(GraphError::DuplicateStep(step.name.clone()));
      }
      if step.command.is_empty() {
        return Err(GraphError::EmptyCommand {
          step: step.name.clone(),
        });
      }
      check_unique_ports(step)?;
      for port in step.scatter.inputs() {
        if step.get_input(port).is_none() {
          return Err(GraphError::UnknownScatterInput {
            step: step.name.clone(),
            port: port.clone(),
          });
        }
      }
      for input in &step.inputs {
        self.check_source(&step.name, &input.source)?;
      }
    }

    for output in &self.outputs {
      self.check_source(&output.name, &output.source)?;
    }

    let topology = Topology::build(self);
    if let Some(path) = topology.find_cycle() {
      return Err(GraphError::Cycle {
        path: path.iter().map(|id| self.step(*id).name.clone()).collect(),
      });
    }

    Ok(topology)
  }

  fn check_source(&self, consumer: &str, source: &Source) -> Result<(), GraphError> {
    match source {
      Source::Literal(_) => Ok(()),
      Source::WorkflowInput(name) => match self.get_input(name) {
        Some(_) => Ok(()),
        None => Err(GraphError::UnknownWorkflowInput {
          consumer: consumer.to_string(),
          input: name.clone(),
        }),
      },
      Source::StepOutput { step, port } => {
        let producer = self.get_step(*step).ok_or_else(|| GraphError::UnknownStep {
          step: consumer.to_string(),
          index: step.0,
        })?;
        if producer.get_output(port).is_none() {
          return Err(GraphError::UnknownOutputPort {
            step: consumer.to_string(),
            producer: producer.name.clone(),
            port: port.clone(),
          });
        }
        Ok(())
      }
    }
  }
}

fn check_unique_ports(step: &Step) -> Result<(), GraphError> {
  let mut seen = HashSet::new();
  for name in step.inputs.iter().map(|p| &p.name) {
    if !seen.insert(name) {
      return Err(GraphError::DuplicatePort {
        step: step.name.clone(),
        port: name.clone(),
      });
    }
  }
  seen.clear();
  for name in step.outputs.iter().map(|p| &p.name) {
    if !seen.insert(name) {
      return Err(GraphError::DuplicatePort {
        step: step.name.clone(),
        port: name.clone(),
      });
    }
  }
  Ok(())
}

/// Dependency structure derived from a validated graph.
#[derive(Debug, Clone)]
pub struct Topology {
  /// step -> distinct upstream steps, ascending.
  upstream: Vec<Vec<StepId>>,
  /// step -> distinct downstream steps, ascending.
  downstream: Vec<Vec<StepId>>,
  /// step -> distinct predecessor ports it consumes.
  dependency_ports: Vec<Vec<(StepId, String)>>,
  /// Steps with no upstream step.
  entry_points: Vec<StepId>,
}

impl Topology {
  fn build(graph: &WorkflowGraph) -> Self {
    let n = graph.steps.len();
    let mut upstream = vec![BTreeSet::new(); n];
    let mut downstream = vec![BTreeSet::new(); n];
    let mut dependency_ports = vec![BTreeSet::new(); n];

    for (index, step) in graph.steps.iter().enumerate() {
      for input in &step.inputs {
        if let Source::StepOutput { step: producer, port } = &input.source {
          upstream[index].insert(*producer);
          downstream[producer.0].insert(StepId(index));
          dependency_ports[index].insert((*producer, port.clone()));
        }
      }
    }

    let entry_points = (0..n)
      .filter(|i| upstream[*i].is_empty())
      .map(StepId)
      .collect();

    Self {
      upstream: upstream.into_iter().map(|s| s.into_iter().collect()).collect(),
      downstream: downstream.into_iter().map(|s| s.into_iter().collect()).collect(),
      dependency_ports: dependency_ports
        .into_iter()
        .map(|s| s.into_iter().collect())
        .collect(),
      entry_points,
    }
  }

  pub fn upstream(&self, id: StepId) -> &[StepId] {
    self.upstream.get(id.0).map(|v| v.as_slice()).unwrap_or(&[])
  }

  pub fn downstream(&self, id: StepId) -> &[StepId] {
    self.downstream.get(id.0).map(|v| v.as_slice()).unwrap_or(&[])
  }

  pub fn dependency_ports(&self, id: StepId) -> &[(StepId, String)] {
    self
      .dependency_ports
      .get(id.0)
      .map(|v| v.as_slice())
      .unwrap_or(&[])
  }

  pub fn entry_points(&self) -> &[StepId] {
    &self.entry_points
  }

  /// Iterative three-color DFS. Returns the steps on the first cycle found.
  fn find_cycle(&self) -> Option<Vec<StepId>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
      White,
      Grey,
      Black,
    }

    let n = self.downstream.len();
    let mut color = vec![Color::White; n];
    let mut parent: Vec<Option<usize>> = vec![None; n];

    for root in 0..n {
      if color[root] != Color::White {
        continue;
      }
      // (node, next child index)
      let mut stack = vec![(root, 0usize)];
      color[root] = Color::Grey;

      while let Some((node, child)) = stack.pop() {
        let children = &self.downstream[node];
        if child >= children.len() {
          color[node] = Color::Black;
          continue;
        }
        stack.push((node, child + 1));

        let next = children[child].0;
        match color[next] {
          Color::White => {
            parent[next] = Some(node);
            color[next] = Color::Grey;
            stack.push((next, 0));
          }
          Color::Grey => {
            let mut path = vec![StepId(next)];
            let mut current = node;
            while current != next {
              path.push(StepId(current));
              match parent[current] {
                Some(p) => current = p,
                None => break,
              }
            }
            path.push(StepId(next));
            path.reverse();
            return Some(path);
          }
          Color::Black => {}
        }
      }
    }

    None
  }
}

fn default_true() -> bool {
  true
}
