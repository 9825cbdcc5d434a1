use std::path::PathBuf;
use std::time::Duration;

/// Per-run settings for [`submit`](crate::submit).
#[derive(Debug, Clone)]
pub struct SubmitOptions {
  /// Upper bound on simultaneously running jobs. Values below 1 are
  /// treated as 1.
  pub max_concurrency: usize,
  /// Abort the run on the first failed job instead of letting independent
  /// branches finish.
  pub fail_fast: bool,
  pub cache_dir: PathBuf,
  /// Root for staging and invocation directories.
  pub work_dir: PathBuf,
  /// Default per-job timeout; a step's own `timeout_ms` takes precedence.
  pub timeout_per_job: Option<Duration>,
  /// Keep working directories of successful jobs.
  pub debug_retain_workdirs: bool,
  /// How long a cancelled job may take to exit before it is abandoned.
  pub cancel_grace_period: Duration,
}

impl SubmitOptions {
  pub(crate) fn concurrency(&self) -> usize {
    self.max_concurrency.max(1)
  }
}

impl Default for SubmitOptions {
  fn default() -> Self {
    let base = std::env::temp_dir().join("weft");
    Self {
      max_concurrency: 4,
      fail_fast: false,
      cache_dir: base.join("cache"),
      work_dir: base.join("runs"),
      timeout_per_job: None,
      debug_retain_workdirs: false,
      cancel_grace_period: Duration::from_secs(5),
    }
  }
}
