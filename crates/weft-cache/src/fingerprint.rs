//! Job fingerprints.
//!
//! A fingerprint is the SHA-256 of a canonical JSON document built from the
//! command template, the backend requirement, and the resolved inputs. File
//! and directory values enter the document by content hash, never by path,
//! so the same data staged at different locations fingerprints identically.

use std::fmt;
use std::path::{Path, PathBuf};

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use weft_graph::{DIRECTORY_CLASS, FILE_CLASS, class_of, path_of};

use crate::canonical::to_canonical_json;
use crate::error::CacheError;

const CHECKSUM_PREFIX: &str = "sha256:";

/// Stable identity of a job's work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
  pub fn from_hex(hex: impl Into<String>) -> Self {
    Self(hex.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// Two-character shard prefix used for on-disk layout.
  pub fn shard(&self) -> &str {
    self.0.get(..2).unwrap_or("00")
  }
}

impl fmt::Display for Fingerprint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Everything that identifies a job's work.
pub struct FingerprintInput<'a> {
  pub command: &'a [String],
  pub container_image: Option<&'a str>,
  pub inputs: &'a Map<String, Value>,
  /// Blob directory of the cache. Only files below it keep their recorded
  /// `checksum`, since blob names are content hashes.
  pub trusted_blobs: Option<&'a Path>,
}

/// Compute the fingerprint for a job.
///
/// Files published into the cache's blob directory keep their `checksum`;
/// every other file or directory is hashed from disk, whatever checksum the
/// value claims.
pub async fn fingerprint(input: FingerprintInput<'_>) -> Result<Fingerprint, CacheError> {
  let mut inputs = Map::new();
  for (name, value) in input.inputs {
    inputs.insert(
      name.clone(),
      content_addressed(value, input.trusted_blobs).await?,
    );
  }

  let document = json!({
    "command": input.command,
    "container": input.container_image,
    "inputs": Value::Object(inputs),
  });

  Ok(Fingerprint(sha256_hex(to_canonical_json(&document).as_bytes())))
}

/// Replace every file-like value by its content hash.
fn content_addressed<'a>(
  value: &'a Value,
  trusted: Option<&'a Path>,
) -> BoxFuture<'a, Result<Value, CacheError>> {
  async move {
    match value {
      Value::Array(items) => {
        let mut out = Vec::with_capacity(items.len());
        for item in items {
          out.push(content_addressed(item, trusted).await?);
        }
        Ok(Value::Array(out))
      }
      Value::Object(map) => match (class_of(value), path_of(value)) {
        (Some(FILE_CLASS), Some(path)) => {
          let path = Path::new(path);
          let recorded = value
            .get("checksum")
            .and_then(Value::as_str)
            .filter(|_| trusted.is_some_and(|root| path.starts_with(root)));
          let checksum = match recorded {
            Some(checksum) => checksum.to_string(),
            None => checksum_of(&hash_file(path).await?),
          };
          Ok(json!({ "class": FILE_CLASS, "checksum": checksum }))
        }
        (Some(DIRECTORY_CLASS), Some(path)) => {
          let checksum = checksum_of(&hash_directory(Path::new(path)).await?);
          Ok(json!({ "class": DIRECTORY_CLASS, "checksum": checksum }))
        }
        _ => {
          let mut out = Map::new();
          for (k, v) in map {
            out.insert(k.clone(), content_addressed(v, trusted).await?);
          }
          Ok(Value::Object(out))
        }
      },
      other => Ok(other.clone()),
    }
  }
  .boxed()
}

/// SHA-256 of a file's bytes, hex encoded.
pub async fn hash_file(path: &Path) -> Result<String, CacheError> {
  let mut file = tokio::fs::File::open(path)
    .await
    .map_err(|e| hash_error(path, e))?;
  let mut hasher = Sha256::new();
  let mut buf = vec![0u8; 64 * 1024];
  loop {
    let n = file.read(&mut buf).await.map_err(|e| hash_error(path, e))?;
    if n == 0 {
      break;
    }
    hasher.update(&buf[..n]);
  }
  Ok(format!("{:x}", hasher.finalize()))
}

/// SHA-256 over the sorted `(relative path, file hash)` pairs of a tree.
pub async fn hash_directory(root: &Path) -> Result<String, CacheError> {
  let mut files = list_files(root).await.map_err(|e| hash_error(root, e))?;
  files.sort();

  let mut hasher = Sha256::new();
  for path in files {
    let relative = path.strip_prefix(root).unwrap_or(&path);
    hasher.update(relative.to_string_lossy().as_bytes());
    hasher.update([0u8]);
    hasher.update(hash_file(&path).await?.as_bytes());
    hasher.update([b'\n']);
  }
  Ok(format!("{:x}", hasher.finalize()))
}

/// All regular files below `root`.
pub(crate) async fn list_files(root: &Path) -> std::io::Result<Vec<PathBuf>> {
  let mut files = Vec::new();
  let mut pending = vec![root.to_path_buf()];
  while let Some(dir) = pending.pop() {
    let mut entries = tokio::fs::read_dir(&dir).await?;
    while let Some(entry) = entries.next_entry().await? {
      let file_type = entry.file_type().await?;
      if file_type.is_dir() {
        pending.push(entry.path());
      } else {
        files.push(entry.path());
      }
    }
  }
  Ok(files)
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
  format!("{:x}", Sha256::digest(bytes))
}

pub(crate) fn checksum_of(hex: &str) -> String {
  format!("{}{}", CHECKSUM_PREFIX, hex)
}

fn hash_error(path: &Path, e: std::io::Error) -> CacheError {
  CacheError::Hash {
    path: path.display().to_string(),
    message: e.to_string(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use weft_graph::file_value;

  fn command() -> Vec<String> {
    vec!["cat".to_string(), "{{ inputs.f.path }}".to_string()]
  }

  #[tokio::test]
  async fn test_fingerprint_is_path_independent() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.txt");
    let b = dir.path().join("nested-b.txt");
    std::fs::write(&a, "same bytes").unwrap();
    std::fs::write(&b, "same bytes").unwrap();

    let cmd = command();
    let inputs_a = Map::from_iter([("f".to_string(), file_value(&a))]);
    let inputs_b = Map::from_iter([("f".to_string(), file_value(&b))]);

    let fp_a = fingerprint(FingerprintInput {
      command: &cmd,
      container_image: None,
      inputs: &inputs_a,
      trusted_blobs: None,
    })
    .await
    .unwrap();
    let fp_b = fingerprint(FingerprintInput {
      command: &cmd,
      container_image: None,
      inputs: &inputs_b,
      trusted_blobs: None,
    })
    .await
    .unwrap();

    assert_eq!(fp_a, fp_b);
    assert_eq!(fp_a.as_str().len(), 64);
  }

  #[tokio::test]
  async fn test_fingerprint_tracks_content_and_values() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a.txt");
    std::fs::write(&path, "one").unwrap();

    let cmd = command();
    let inputs = Map::from_iter([("f".to_string(), file_value(&path))]);
    let before = fingerprint(FingerprintInput {
      command: &cmd,
      container_image: None,
      inputs: &inputs,
      trusted_blobs: None,
    })
    .await
    .unwrap();

    std::fs::write(&path, "two").unwrap();
    let after = fingerprint(FingerprintInput {
      command: &cmd,
      container_image: None,
      inputs: &inputs,
      trusted_blobs: None,
    })
    .await
    .unwrap();
    assert_ne!(before, after);

    let in_container = fingerprint(FingerprintInput {
      command: &cmd,
      container_image: Some("alpine:3"),
      inputs: &inputs,
      trusted_blobs: None,
    })
    .await
    .unwrap();
    assert_ne!(after, in_container);
  }

  #[tokio::test]
  async fn test_literal_key_order_is_irrelevant() {
    let cmd = command();
    let first: Map<String, Value> =
      serde_json::from_str(r#"{"a": 1, "b": {"x": 1, "y": 2}}"#).unwrap();
    let second: Map<String, Value> =
      serde_json::from_str(r#"{"b": {"y": 2, "x": 1}, "a": 1}"#).unwrap();

    let fp1 = fingerprint(FingerprintInput {
      command: &cmd,
      container_image: None,
      inputs: &first,
      trusted_blobs: None,
    })
    .await
    .unwrap();
    let fp2 = fingerprint(FingerprintInput {
      command: &cmd,
      container_image: None,
      inputs: &second,
      trusted_blobs: None,
    })
    .await
    .unwrap();
    assert_eq!(fp1, fp2);
  }

  #[tokio::test]
  async fn test_directory_hash() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("sub")).unwrap();
    std::fs::write(dir.path().join("sub/x"), "x").unwrap();
    std::fs::write(dir.path().join("y"), "y").unwrap();

    let first = hash_directory(dir.path()).await.unwrap();
    std::fs::write(dir.path().join("y"), "changed").unwrap();
    let second = hash_directory(dir.path()).await.unwrap();
    assert_ne!(first, second);
  }

  #[tokio::test]
  async fn test_missing_file_is_hash_error() {
    let cmd = command();
    let inputs = Map::from_iter([("f".to_string(), file_value("/definitely/not/here"))]);
    let result = fingerprint(FingerprintInput {
      command: &cmd,
      container_image: None,
      inputs: &inputs,
      trusted_blobs: None,
    })
    .await;
    assert!(matches!(result, Err(CacheError::Hash { .. })));
  }

  #[tokio::test]
  async fn test_recorded_checksum_only_trusted_under_blobs() {
    let dir = tempfile::tempdir().unwrap();
    let blobs = dir.path().join("blobs");
    std::fs::create_dir_all(&blobs).unwrap();
    let outside = dir.path().join("data.txt");
    std::fs::write(&outside, "one").unwrap();
    let blob = blobs.join("abc");
    std::fs::write(&blob, "blob bytes").unwrap();

    let cmd = command();
    let fp = |value: Value| {
      let cmd = cmd.clone();
      let blobs = blobs.clone();
      async move {
        let inputs = Map::from_iter([("f".to_string(), value)]);
        fingerprint(FingerprintInput {
          command: &cmd,
          container_image: None,
          inputs: &inputs,
          trusted_blobs: Some(blobs.as_path()),
        })
        .await
        .unwrap()
      }
    };

    let mut claimed = file_value(&outside);
    claimed["checksum"] = json!("sha256:stale");
    let before = fp(claimed.clone()).await;
    assert_eq!(before, fp(file_value(&outside)).await);
    std::fs::write(&outside, "two").unwrap();
    assert_ne!(before, fp(claimed).await);

    let mut published = file_value(&blob);
    published["checksum"] = json!("sha256:abc");
    let mut other = file_value(&blob);
    other["checksum"] = json!("sha256:def");
    assert_ne!(fp(published).await, fp(other).await);
  }
}
