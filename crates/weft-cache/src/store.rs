//! Disk-backed cache store with per-fingerprint in-flight coordination.
//!
//! Layout under the cache root:
//! ```text
//! {root}/
//! ├── entries/
//! │   └── 3f/
//! │       └── 3fa9…e1.json      one committed CacheEntry per fingerprint
//! └── blobs/
//!     └── 9b2c…07               produced artifacts, named by content hash
//! ```
//!
//! Entries are published with a hard link from a private temp file, so a
//! reader never observes a partial entry and the first committer wins.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::fs;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::entry::{CacheEntry, SharedOutcome};
use crate::error::CacheError;
use crate::fingerprint::{Fingerprint, hash_directory, hash_file, list_files};

type OutcomeSender = watch::Sender<Option<SharedOutcome>>;

/// Result of [`CacheStore::claim`].
pub enum Claim {
  /// A committed entry already exists.
  Hit(CacheEntry),
  /// The caller must execute and then resolve the guard.
  Owner(InflightGuard),
  /// Another job is executing the same fingerprint.
  Wait(InflightWaiter),
}

/// A blob published into the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedBlob {
  pub path: PathBuf,
  /// Hex SHA-256 of the content.
  pub hash: String,
}

/// Summary counters for a cache root.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
  pub entries: usize,
  pub blobs: usize,
}

/// Content-addressed map from fingerprint to prior results.
///
/// Cheap to clone; clones share the in-flight table.
#[derive(Clone)]
pub struct CacheStore {
  inner: Arc<Inner>,
}

struct Inner {
  root: PathBuf,
  inflight: Mutex<HashMap<Fingerprint, OutcomeSender>>,
}

impl CacheStore {
  /// Open (and create if needed) a cache rooted at `root`.
  pub async fn open(root: impl Into<PathBuf>) -> Result<Self, CacheError> {
    let root = root.into();
    fs::create_dir_all(root.join("entries")).await?;
    fs::create_dir_all(root.join("blobs")).await?;
    debug!(root = %root.display(), "cache opened");
    Ok(Self {
      inner: Arc::new(Inner {
        root,
        inflight: Mutex::new(HashMap::new()),
      }),
    })
  }

  pub fn root(&self) -> &Path {
    &self.inner.root
  }

  fn entry_path(&self, fingerprint: &Fingerprint) -> PathBuf {
    self
      .inner
      .root
      .join("entries")
      .join(fingerprint.shard())
      .join(format!("{}.json", fingerprint))
  }

  /// Directory holding published blobs, each named by its content hash.
  pub fn blob_dir(&self) -> PathBuf {
    self.inner.root.join("blobs")
  }

  /// Look up a committed entry.
  ///
  /// Advisory: a missing, unreadable, or corrupt entry is a miss. Corruption
  /// is logged and never surfaced as an error.
  pub async fn lookup(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
    match self.read_entry(fingerprint).await {
      Ok(entry) => entry,
      Err(e) => {
        warn!(fingerprint = %fingerprint, error = %e, "cache entry unreadable, treating as miss");
        None
      }
    }
  }

  async fn read_entry(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>, CacheError> {
    let path = self.entry_path(fingerprint);
    let content = match fs::read_to_string(&path).await {
      Ok(content) => content,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
      Err(e) => return Err(e.into()),
    };

    let entry: CacheEntry =
      serde_json::from_str(&content).map_err(|e| CacheError::Corrupt {
        fingerprint: fingerprint.to_string(),
        message: e.to_string(),
      })?;

    if &entry.fingerprint != fingerprint {
      return Err(CacheError::Corrupt {
        fingerprint: fingerprint.to_string(),
        message: format!("entry is keyed as '{}'", entry.fingerprint),
      });
    }

    for blob in entry.artifacts.keys() {
      if fs::metadata(blob).await.is_err() {
        return Err(CacheError::Corrupt {
          fingerprint: fingerprint.to_string(),
          message: format!("artifact '{}' is missing", blob),
        });
      }
    }

    Ok(Some(entry))
  }

  /// Claim a fingerprint for execution.
  ///
  /// At most one [`Claim::Owner`] exists per fingerprint at a time; every
  /// other concurrent claimer gets a [`Claim::Wait`] on the owner's outcome.
  pub async fn claim(&self, fingerprint: &Fingerprint) -> Claim {
    if let Some(waiter) = self.try_wait(fingerprint) {
      return Claim::Wait(waiter);
    }

    if let Some(entry) = self.lookup(fingerprint).await {
      return Claim::Hit(entry);
    }

    let guard = {
      let mut inflight = self.lock_inflight();
      if let Some(sender) = inflight.get(fingerprint) {
        return Claim::Wait(InflightWaiter {
          receiver: sender.subscribe(),
        });
      }
      let (sender, _) = watch::channel(None);
      inflight.insert(fingerprint.clone(), sender.clone());
      InflightGuard {
        store: self.clone(),
        fingerprint: fingerprint.clone(),
        sender,
      }
    };

    // A previous owner may have committed between the lookup and the insert.
    if let Some(entry) = self.lookup(fingerprint).await {
      guard.share(SharedOutcome::Committed(entry.clone()));
      return Claim::Hit(entry);
    }

    Claim::Owner(guard)
  }

  fn try_wait(&self, fingerprint: &Fingerprint) -> Option<InflightWaiter> {
    self
      .lock_inflight()
      .get(fingerprint)
      .map(|sender| InflightWaiter {
        receiver: sender.subscribe(),
      })
  }

  fn lock_inflight(&self) -> std::sync::MutexGuard<'_, HashMap<Fingerprint, OutcomeSender>> {
    self
      .inner
      .inflight
      .lock()
      .unwrap_or_else(|e| e.into_inner())
  }

  /// Persist an entry. Idempotent: if an intact entry for the fingerprint
  /// already exists it is kept and returned instead.
  pub async fn commit(&self, entry: CacheEntry) -> Result<CacheEntry, CacheError> {
    let path = self.entry_path(&entry.fingerprint);
    let dir = path
      .parent()
      .map(Path::to_path_buf)
      .unwrap_or_else(|| self.inner.root.clone());
    fs::create_dir_all(&dir).await?;

    let tmp = dir.join(format!(".{}.tmp-{}", entry.fingerprint, uuid::Uuid::new_v4()));
    fs::write(&tmp, serde_json::to_vec_pretty(&entry)?).await?;

    let result = match fs::hard_link(&tmp, &path).await {
      Ok(()) => {
        info!(fingerprint = %entry.fingerprint, "cache_committed");
        Ok(entry)
      }
      Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
        match self.read_entry(&entry.fingerprint).await {
          Ok(Some(existing)) => {
            debug!(fingerprint = %entry.fingerprint, "cache entry already committed, keeping first");
            Ok(existing)
          }
          _ => {
            warn!(fingerprint = %entry.fingerprint, "replacing corrupt cache entry");
            fs::rename(&tmp, &path).await?;
            Ok(entry)
          }
        }
      }
      Err(e) => Err(e.into()),
    };

    let _ = fs::remove_file(&tmp).await;
    result
  }

  /// Copy a produced file or directory into the blob store.
  ///
  /// Blobs are named by content hash, so publishing identical content twice
  /// is a no-op.
  pub async fn publish(&self, source: &Path) -> Result<PublishedBlob, CacheError> {
    let metadata = fs::metadata(source).await?;
    let hash = if metadata.is_dir() {
      hash_directory(source).await?
    } else {
      hash_file(source).await?
    };

    let dest = self.blob_dir().join(&hash);
    if fs::metadata(&dest).await.is_ok() {
      return Ok(PublishedBlob { path: dest, hash });
    }

    let tmp = self
      .blob_dir()
      .join(format!(".{}.tmp-{}", hash, uuid::Uuid::new_v4()));
    if metadata.is_dir() {
      copy_tree(source, &tmp).await?;
    } else {
      fs::copy(source, &tmp).await?;
    }

    if let Err(e) = fs::rename(&tmp, &dest).await {
      // Someone else published the same content first.
      if fs::metadata(&dest).await.is_err() {
        return Err(e.into());
      }
      if metadata.is_dir() {
        let _ = fs::remove_dir_all(&tmp).await;
      } else {
        let _ = fs::remove_file(&tmp).await;
      }
    }

    Ok(PublishedBlob { path: dest, hash })
  }

  /// Count committed entries and blobs.
  pub async fn stats(&self) -> Result<CacheStats, CacheError> {
    let entries = list_files(&self.inner.root.join("entries"))
      .await?
      .into_iter()
      .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
      .count();

    let mut blobs = 0;
    let mut dir = fs::read_dir(self.blob_dir()).await?;
    while let Some(entry) = dir.next_entry().await? {
      if !entry.file_name().to_string_lossy().starts_with('.') {
        blobs += 1;
      }
    }

    Ok(CacheStats { entries, blobs })
  }
}

async fn copy_tree(source: &Path, dest: &Path) -> Result<(), CacheError> {
  let mut pending = vec![(source.to_path_buf(), dest.to_path_buf())];
  while let Some((from, to)) = pending.pop() {
    fs::create_dir_all(&to).await?;
    let mut entries = fs::read_dir(&from).await?;
    while let Some(entry) = entries.next_entry().await? {
      let target = to.join(entry.file_name());
      if entry.file_type().await?.is_dir() {
        pending.push((entry.path(), target));
      } else {
        fs::copy(entry.path(), target).await?;
      }
    }
  }
  Ok(())
}

/// Exclusive right to execute one fingerprint.
///
/// Resolve it with [`InflightGuard::commit`] or [`InflightGuard::fail`].
/// Dropping it unresolved (e.g. on cancellation) releases the claim and
/// lets one waiter take over.
pub struct InflightGuard {
  store: CacheStore,
  fingerprint: Fingerprint,
  sender: OutcomeSender,
}

impl InflightGuard {
  pub fn fingerprint(&self) -> &Fingerprint {
    &self.fingerprint
  }

  /// Persist the entry and hand it to every waiter.
  ///
  /// A persistence failure only loses memoization; waiters still receive
  /// the entry.
  pub async fn commit(self, entry: CacheEntry) -> CacheEntry {
    let committed = match self.store.commit(entry.clone()).await {
      Ok(committed) => committed,
      Err(e) => {
        warn!(fingerprint = %self.fingerprint, error = %e, "cache commit failed");
        entry
      }
    };
    self.share(SharedOutcome::Committed(committed.clone()));
    committed
  }

  /// Report a failed execution to every waiter.
  pub fn fail(self, message: impl Into<String>) {
    self.share(SharedOutcome::Failed(message.into()));
  }

  fn share(self, outcome: SharedOutcome) {
    self.sender.send_replace(Some(outcome));
  }
}

impl Drop for InflightGuard {
  fn drop(&mut self) {
    self.store.lock_inflight().remove(&self.fingerprint);
  }
}

/// Handle on another job's in-flight execution of the same fingerprint.
pub struct InflightWaiter {
  receiver: watch::Receiver<Option<SharedOutcome>>,
}

impl InflightWaiter {
  /// Wait for the owner to resolve.
  ///
  /// Returns `None` if the owner was dropped without an outcome; the caller
  /// should claim again.
  pub async fn wait(mut self) -> Option<SharedOutcome> {
    loop {
      if let Some(outcome) = self.receiver.borrow_and_update().clone() {
        return Some(outcome);
      }
      if self.receiver.changed().await.is_err() {
        return self.receiver.borrow().clone();
      }
    }
  }
}
