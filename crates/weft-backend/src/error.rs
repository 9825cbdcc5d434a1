//! Backend and staging error types.

/// Errors raised while launching or supervising an invocation.
///
/// A command that runs and exits non-zero is not an error here; the exit
/// code is reported in [`BackendOutput`](crate::BackendOutput).
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
  #[error("invocation has an empty argument vector")]
  EmptyCommand,

  #[error("failed to spawn '{program}': {message}")]
  Spawn { program: String, message: String },

  #[error("failed to prepare working directory '{path}': {message}")]
  Workdir { path: String, message: String },

  #[error("container backend requires an image")]
  MissingImage,

  #[error("backend io error: {0}")]
  Io(#[from] std::io::Error),
}

/// Errors raised while staging inputs into a job's directory.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
  #[error("input '{input}' references missing path '{path}'")]
  MissingSource { input: String, path: String },

  #[error("staging io error: {0}")]
  Io(#[from] std::io::Error),
}
