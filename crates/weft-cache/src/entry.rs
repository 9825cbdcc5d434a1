use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::fingerprint::Fingerprint;

/// Memoized result of one fingerprint. Immutable once committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
  pub fingerprint: Fingerprint,
  /// Output port name -> bound value.
  pub outputs: Map<String, Value>,
  /// Blob path -> content hash of every produced artifact.
  #[serde(default)]
  pub artifacts: BTreeMap<String, String>,
  pub created_at: DateTime<Utc>,
}

impl CacheEntry {
  pub fn new(
    fingerprint: Fingerprint,
    outputs: Map<String, Value>,
    artifacts: BTreeMap<String, String>,
  ) -> Self {
    Self {
      fingerprint,
      outputs,
      artifacts,
      created_at: Utc::now(),
    }
  }
}

/// What concurrent claimers of a fingerprint learn from its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum SharedOutcome {
  /// The owner committed this entry.
  Committed(CacheEntry),
  /// The owner's execution failed; the message describes why.
  Failed(String),
}
