//! Cache error types.

/// Errors that can occur while reading or writing the cache.
///
/// None of these are fatal to a run: lookups degrade to a miss and failed
/// writes only lose memoization.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
  /// Filesystem access failed.
  #[error("cache io error: {0}")]
  Io(#[from] std::io::Error),

  /// An entry could not be encoded or decoded.
  #[error("cache serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  /// An entry exists but cannot be trusted.
  #[error("corrupt cache entry '{fingerprint}': {message}")]
  Corrupt { fingerprint: String, message: String },

  /// A value referenced a file that could not be hashed.
  #[error("cannot hash '{path}': {message}")]
  Hash { path: String, message: String },
}
