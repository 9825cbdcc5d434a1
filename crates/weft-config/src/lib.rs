//! Weft Config
//!
//! Loads `config.toml` from the weft data directory (`~/.weft` by default).
//! Every key is optional; a missing file yields the defaults.
//!
//! ```toml
//! [run]
//! max_concurrency = 8
//! fail_fast = true
//! timeout_ms = 600000
//! cancel_grace_ms = 5000
//! retain_workdirs = false
//!
//! [paths]
//! cache_dir = "/scratch/weft-cache"
//! work_dir = "/scratch/weft-runs"
//!
//! [backend]
//! container_runtime = "podman"
//! stage_mode = "copy"
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// File name looked up inside the data directory.
pub const CONFIG_FILE: &str = "config.toml";

/// Errors from reading or parsing a settings file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  #[error("failed to read '{path}': {source}")]
  Read {
    path: String,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse '{path}': {source}")]
  Parse {
    path: String,
    #[source]
    source: toml::de::Error,
  },
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
  pub run: RunSettings,
  pub paths: PathSettings,
  pub backend: BackendSettings,
}

/// Defaults for a run; command-line flags override them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
  pub max_concurrency: usize,
  pub fail_fast: bool,
  /// Per-job timeout. `None` means unbounded.
  pub timeout_ms: Option<u64>,
  /// Time between a graceful terminate and a forced kill.
  pub cancel_grace_ms: u64,
  pub retain_workdirs: bool,
}

impl Default for RunSettings {
  fn default() -> Self {
    Self {
      max_concurrency: 4,
      fail_fast: false,
      timeout_ms: None,
      cancel_grace_ms: 5_000,
      retain_workdirs: false,
    }
  }
}

/// Directory overrides. Relative defaults live under the data directory.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PathSettings {
  pub cache_dir: Option<PathBuf>,
  pub work_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
  /// Docker-compatible CLI used for containerized steps.
  pub container_runtime: String,
  pub stage_mode: StageModeSetting,
}

impl Default for BackendSettings {
  fn default() -> Self {
    Self {
      container_runtime: "docker".to_string(),
      stage_mode: StageModeSetting::Symlink,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageModeSetting {
  #[default]
  Symlink,
  Copy,
}

impl Settings {
  /// Parse settings from TOML text.
  pub fn from_toml_str(path: &Path, content: &str) -> Result<Self, ConfigError> {
    toml::from_str(content).map_err(|source| ConfigError::Parse {
      path: path.display().to_string(),
      source,
    })
  }

  /// Read `{data_dir}/config.toml`, failing on unreadable or invalid files.
  /// A missing file yields the defaults.
  pub async fn try_load(data_dir: &Path) -> Result<Self, ConfigError> {
    let path = data_dir.join(CONFIG_FILE);
    match tokio::fs::read_to_string(&path).await {
      Ok(content) => Self::from_toml_str(&path, &content),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
        debug!(path = %path.display(), "no config file, using defaults");
        Ok(Self::default())
      }
      Err(source) => Err(ConfigError::Read {
        path: path.display().to_string(),
        source,
      }),
    }
  }

  /// Like [`Settings::try_load`], but a bad file only logs a warning and
  /// yields the defaults.
  pub async fn load(data_dir: &Path) -> Self {
    match Self::try_load(data_dir).await {
      Ok(settings) => settings,
      Err(e) => {
        warn!(error = %e, "ignoring config file, using defaults");
        Self::default()
      }
    }
  }

  pub fn cache_dir(&self, data_dir: &Path) -> PathBuf {
    self
      .paths
      .cache_dir
      .clone()
      .unwrap_or_else(|| data_dir.join("cache"))
  }

  pub fn work_dir(&self, data_dir: &Path) -> PathBuf {
    self
      .paths
      .work_dir
      .clone()
      .unwrap_or_else(|| data_dir.join("runs"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_missing_file_gives_defaults() {
    let tmp = tempfile::tempdir().unwrap();
    let settings = Settings::load(tmp.path()).await;
    assert_eq!(settings, Settings::default());
    assert_eq!(settings.run.max_concurrency, 4);
    assert_eq!(settings.cache_dir(tmp.path()), tmp.path().join("cache"));
  }

  #[tokio::test]
  async fn test_partial_file_keeps_other_defaults() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(
      tmp.path().join(CONFIG_FILE),
      r#"
[run]
fail_fast = true
timeout_ms = 1500

[paths]
cache_dir = "/scratch/cache"

[backend]
stage_mode = "copy"
"#,
    )
    .unwrap();

    let settings = Settings::try_load(tmp.path()).await.unwrap();
    assert!(settings.run.fail_fast);
    assert_eq!(settings.run.timeout_ms, Some(1500));
    assert_eq!(settings.run.max_concurrency, 4);
    assert_eq!(settings.cache_dir(tmp.path()), PathBuf::from("/scratch/cache"));
    assert_eq!(settings.work_dir(tmp.path()), tmp.path().join("runs"));
    assert_eq!(settings.backend.stage_mode, StageModeSetting::Copy);
    assert_eq!(settings.backend.container_runtime, "docker");
  }

  #[tokio::test]
  async fn test_malformed_file() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(tmp.path().join(CONFIG_FILE), "run = { not toml").unwrap();

    assert!(matches!(
      Settings::try_load(tmp.path()).await,
      Err(ConfigError::Parse { .. })
    ));
    assert_eq!(Settings::load(tmp.path()).await, Settings::default());
  }
}
