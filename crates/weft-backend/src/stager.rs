//! Input staging.
//!
//! Before a job runs, every File and Directory value among its inputs is
//! made available under a per-job staging directory and the value's `path`
//! is rewritten to point there. Other members of the value (such as a
//! `checksum`) are preserved.
//!
//! Containers only see the staging directory, so inputs staged for a
//! container are always copied, never linked.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, warn};
use weft_graph::{DIRECTORY_CLASS, class_of, is_file_like, path_of};

use crate::backend::BackendKind;
use crate::error::StageError;

/// Inputs after staging.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedInputs {
  /// Directory owning every staged path. `None` if nothing was staged.
  pub root: Option<PathBuf>,
  /// The input values with file paths rewritten.
  pub inputs: Map<String, Value>,
}

/// Places job input files where the backend can reach them.
#[async_trait]
pub trait Stager: Send + Sync {
  /// Stage `inputs` for a job that will run on `target`.
  async fn stage(
    &self,
    job_id: &str,
    inputs: &Map<String, Value>,
    target: BackendKind,
  ) -> Result<StagedInputs, StageError>;

  /// Release everything [`Stager::stage`] created.
  async fn unstage(&self, staged: StagedInputs) -> Result<(), StageError>;
}

/// How [`LocalStager`] materializes a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StageMode {
  #[default]
  Symlink,
  Copy,
}

/// Stages into `{root}/{job id}/{n}/{file name}` on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalStager {
  root: PathBuf,
  mode: StageMode,
}

impl LocalStager {
  pub fn new(root: impl Into<PathBuf>, mode: StageMode) -> Self {
    Self {
      root: root.into(),
      mode,
    }
  }

  fn mode_for(&self, target: BackendKind) -> StageMode {
    match target {
      BackendKind::Container => StageMode::Copy,
      BackendKind::LocalProcess => self.mode,
    }
  }

  async fn place(
    &self,
    mode: StageMode,
    source: &Path,
    dest: &Path,
    is_dir: bool,
  ) -> Result<(), StageError> {
    if let Some(parent) = dest.parent() {
      tokio::fs::create_dir_all(parent).await?;
    }
    match mode {
      #[cfg(unix)]
      StageMode::Symlink => {
        tokio::fs::symlink(source, dest).await?;
      }
      _ if is_dir => copy_tree(source, dest).await?,
      _ => {
        tokio::fs::copy(source, dest).await?;
      }
    }
    Ok(())
  }
}

#[async_trait]
impl Stager for LocalStager {
  async fn stage(
    &self,
    job_id: &str,
    inputs: &Map<String, Value>,
    target: BackendKind,
  ) -> Result<StagedInputs, StageError> {
    let job_root = self.root.join(job_id);
    let mode = self.mode_for(target);

    // Source path -> staged path, in first-seen order.
    let mut placements: Vec<(String, PathBuf, bool)> = Vec::new();
    let mut assigned: HashMap<String, PathBuf> = HashMap::new();
    for (name, value) in inputs {
      collect_paths(value, &mut |path, is_dir| {
        if assigned.contains_key(path) {
          return;
        }
        let file_name = Path::new(path)
          .file_name()
          .map(|n| n.to_os_string())
          .unwrap_or_else(|| name.clone().into());
        let dest = job_root
          .join(placements.len().to_string())
          .join(file_name);
        assigned.insert(path.to_string(), dest.clone());
        placements.push((path.to_string(), dest, is_dir));
      });
    }

    for (source, dest, is_dir) in &placements {
      let source_path = Path::new(source);
      if tokio::fs::metadata(source_path).await.is_err() {
        let input = inputs
          .iter()
          .find(|(_, v)| references(v, source))
          .map(|(k, _)| k.clone())
          .unwrap_or_default();
        let _ = tokio::fs::remove_dir_all(&job_root).await;
        return Err(StageError::MissingSource {
          input,
          path: source.clone(),
        });
      }
      // Links must not depend on the caller's working directory.
      let source_path = tokio::fs::canonicalize(source_path).await?;
      self.place(mode, &source_path, dest, *is_dir).await?;
    }

    let staged = inputs
      .iter()
      .map(|(name, value)| (name.clone(), rewrite(value, &assigned)))
      .collect();

    debug!(job_id, files = placements.len(), mode = ?mode, "inputs_staged");
    Ok(StagedInputs {
      root: (!placements.is_empty()).then_some(job_root),
      inputs: staged,
    })
  }

  async fn unstage(&self, staged: StagedInputs) -> Result<(), StageError> {
    if let Some(root) = staged.root {
      match tokio::fs::remove_dir_all(&root).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
          warn!(root = %root.display(), error = %e, "failed to unstage inputs");
          return Err(e.into());
        }
      }
    }
    Ok(())
  }
}

/// Visit every file-like value with its path and whether it is a directory.
fn collect_paths(value: &Value, visit: &mut impl FnMut(&str, bool)) {
  match value {
    Value::Array(items) => items.iter().for_each(|item| collect_paths(item, visit)),
    Value::Object(map) => {
      if is_file_like(value) {
        if let Some(path) = path_of(value) {
          visit(path, class_of(value) == Some(DIRECTORY_CLASS));
        }
      } else {
        map.values().for_each(|v| collect_paths(v, visit));
      }
    }
    _ => {}
  }
}

fn references(value: &Value, path: &str) -> bool {
  let mut found = false;
  collect_paths(value, &mut |p, _| found |= p == path);
  found
}

fn rewrite(value: &Value, assigned: &HashMap<String, PathBuf>) -> Value {
  match value {
    Value::Array(items) => Value::Array(items.iter().map(|v| rewrite(v, assigned)).collect()),
    Value::Object(map) if is_file_like(value) => {
      let mut out = map.clone();
      if let Some(dest) = path_of(value).and_then(|p| assigned.get(p)) {
        out.insert(
          "path".to_string(),
          Value::String(dest.to_string_lossy().into_owned()),
        );
      }
      Value::Object(out)
    }
    Value::Object(map) => Value::Object(
      map
        .iter()
        .map(|(k, v)| (k.clone(), rewrite(v, assigned)))
        .collect(),
    ),
    other => other.clone(),
  }
}

async fn copy_tree(source: &Path, dest: &Path) -> std::io::Result<()> {
  let mut pending = vec![(source.to_path_buf(), dest.to_path_buf())];
  while let Some((from, to)) = pending.pop() {
    tokio::fs::create_dir_all(&to).await?;
    let mut entries = tokio::fs::read_dir(&from).await?;
    while let Some(entry) = entries.next_entry().await? {
      let target = to.join(entry.file_name());
      if entry.file_type().await?.is_dir() {
        pending.push((entry.path(), target));
      } else {
        tokio::fs::copy(entry.path(), target).await?;
      }
    }
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use weft_graph::{directory_value, file_value};

  #[tokio::test]
  async fn test_stage_rewrites_paths_and_unstage_removes() {
    let source = tempfile::tempdir().unwrap();
    let staging = tempfile::tempdir().unwrap();
    let file = source.path().join("reads.txt");
    std::fs::write(&file, "ACGT").unwrap();
    let dir = source.path().join("refs");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("chr1"), "N").unwrap();

    let mut with_checksum = file_value(&file);
    with_checksum["checksum"] = json!("sha256:abc");
    let inputs = Map::from_iter([
      ("reads".to_string(), with_checksum),
      ("refs".to_string(), directory_value(&dir)),
      ("more".to_string(), json!([file_value(&file)])),
      ("n".to_string(), json!(3)),
    ]);

    let stager = LocalStager::new(staging.path(), StageMode::Copy);
    let staged = stager.stage("job-1", &inputs, BackendKind::LocalProcess).await.unwrap();

    let staged_reads = path_of(&staged.inputs["reads"]).unwrap().to_string();
    assert!(staged_reads.starts_with(staging.path().to_str().unwrap()));
    assert_eq!(std::fs::read_to_string(&staged_reads).unwrap(), "ACGT");
    assert_eq!(staged.inputs["reads"]["checksum"], json!("sha256:abc"));
    assert_eq!(
      path_of(&staged.inputs["more"][0]),
      Some(staged_reads.as_str())
    );
    let staged_refs = path_of(&staged.inputs["refs"]).unwrap().to_string();
    assert_eq!(
      std::fs::read_to_string(Path::new(&staged_refs).join("chr1")).unwrap(),
      "N"
    );
    assert_eq!(staged.inputs["n"], json!(3));

    let root = staged.root.clone().unwrap();
    stager.unstage(staged).await.unwrap();
    assert!(!root.exists());
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn test_symlink_mode() {
    let source = tempfile::tempdir().unwrap();
    let staging = tempfile::tempdir().unwrap();
    let file = source.path().join("a.txt");
    std::fs::write(&file, "a").unwrap();

    let stager = LocalStager::new(staging.path(), StageMode::Symlink);
    let inputs = Map::from_iter([("a".to_string(), file_value(&file))]);
    let staged = stager.stage("job-2", &inputs, BackendKind::LocalProcess).await.unwrap();

    let staged_path = PathBuf::from(path_of(&staged.inputs["a"]).unwrap());
    assert!(
      std::fs::symlink_metadata(&staged_path)
        .unwrap()
        .file_type()
        .is_symlink()
    );
    stager.unstage(staged).await.unwrap();
    assert!(file.exists());
  }

  #[tokio::test]
  async fn test_missing_source_and_plain_values() {
    let staging = tempfile::tempdir().unwrap();
    let stager = LocalStager::new(staging.path(), StageMode::Copy);

    let plain = Map::from_iter([("x".to_string(), json!("hello"))]);
    let staged = stager.stage("job-3", &plain, BackendKind::LocalProcess).await.unwrap();
    assert_eq!(staged.root, None);
    assert_eq!(staged.inputs, plain);

    let missing = Map::from_iter([("f".to_string(), file_value("/no/such/file"))]);
    let err = stager.stage("job-4", &missing, BackendKind::LocalProcess).await.unwrap_err();
    assert!(matches!(err, StageError::MissingSource { ref input, .. } if input == "f"));
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn test_container_target_copies_even_in_symlink_mode() {
    let source = tempfile::tempdir().unwrap();
    let staging = tempfile::tempdir().unwrap();
    let file = source.path().join("a.txt");
    std::fs::write(&file, "a").unwrap();

    let stager = LocalStager::new(staging.path(), StageMode::Symlink);
    let inputs = Map::from_iter([("a".to_string(), file_value(&file))]);
    let staged = stager
      .stage("job-5", &inputs, BackendKind::Container)
      .await
      .unwrap();

    let staged_path = PathBuf::from(path_of(&staged.inputs["a"]).unwrap());
    let metadata = std::fs::symlink_metadata(&staged_path).unwrap();
    assert!(metadata.file_type().is_file());
    assert_eq!(std::fs::read_to_string(&staged_path).unwrap(), "a");
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn test_relative_source_links_to_absolute_target() {
    let source = tempfile::tempdir().unwrap();
    let staging = tempfile::tempdir().unwrap();
    std::fs::write(source.path().join("rel.txt"), "relative").unwrap();

    // Climb from the cwd to `/`, then descend into the temp dir.
    let cwd = std::env::current_dir().unwrap();
    let mut relative = PathBuf::new();
    for _ in cwd.components().skip(1) {
      relative.push("..");
    }
    relative.push(source.path().strip_prefix("/").unwrap());
    relative.push("rel.txt");
    assert!(relative.is_relative());
    let stager = LocalStager::new(staging.path(), StageMode::Symlink);
    let inputs = Map::from_iter([("f".to_string(), file_value(&relative))]);
    let staged = stager
      .stage("job-6", &inputs, BackendKind::LocalProcess)
      .await
      .unwrap();

    let staged_path = PathBuf::from(path_of(&staged.inputs["f"]).unwrap());
    let target = std::fs::read_link(&staged_path).unwrap();
    assert!(target.is_absolute());
    assert_eq!(target, std::fs::canonicalize(&relative).unwrap());
    assert_eq!(std::fs::read_to_string(&staged_path).unwrap(), "relative");
  }
}
