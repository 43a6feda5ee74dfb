//! Typed errors for the remote store, the cache engine and the sync engine.
//!
//! Application plumbing (config, opening databases, the CLI) uses
//! `color_eyre::Result`; these enums exist where callers branch on the kind
//! of failure.

use thiserror::Error;

/// Failure of a remote-store call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
  /// Network trouble, timeouts, 5xx, 408 and 429. Worth retrying.
  #[error("transient remote failure: {0}")]
  Transient(String),

  /// The server understood and refused the request. Retrying cannot help.
  #[error("remote rejected request ({status}): {message}")]
  Permanent { status: u16, message: String },

  /// The action has no user to replay it as.
  #[error("action has no user id")]
  MissingUser,

  /// A thread-scoped action lost its thread id.
  #[error("action has no thread id")]
  MissingThread,
}

impl RemoteError {
  pub fn transient(message: impl Into<String>) -> Self {
    Self::Transient(message.into())
  }

  pub fn permanent(status: u16, message: impl Into<String>) -> Self {
    Self::Permanent {
      status,
      message: message.into(),
    }
  }

  /// Classify an HTTP status code returned by the remote store.
  pub fn from_status(status: u16, message: impl Into<String>) -> Self {
    match status {
      408 | 429 => Self::Transient(format!("HTTP {}: {}", status, message.into())),
      400..=499 => Self::permanent(status, message),
      _ => Self::Transient(format!("HTTP {}: {}", status, message.into())),
    }
  }

  pub fn is_permanent(&self) -> bool {
    !matches!(self, Self::Transient(_))
  }
}

impl From<reqwest::Error> for RemoteError {
  fn from(err: reqwest::Error) -> Self {
    match err.status() {
      Some(status) => Self::from_status(status.as_u16(), err.to_string()),
      None => Self::Transient(err.to_string()),
    }
  }
}

/// Failure to produce a response for an intercepted request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
  #[error("network error: {0}")]
  Network(String),

  #[error("network request timed out after {0}ms")]
  Timeout(u64),

  #[error("cache storage error: {0}")]
  Cache(String),
}

impl From<reqwest::Error> for FetchError {
  fn from(err: reqwest::Error) -> Self {
    Self::Network(err.to_string())
  }
}

/// Failure of the HTTP response cache itself.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheStoreError {
  /// Writing would push usage past the granted quota.
  #[error("storage quota exceeded: {needed} bytes needed, {available} available")]
  QuotaExceeded { needed: u64, available: u64 },

  #[error("cache storage failure: {0}")]
  Storage(String),
}

impl From<rusqlite::Error> for CacheStoreError {
  fn from(err: rusqlite::Error) -> Self {
    Self::Storage(err.to_string())
  }
}

impl From<CacheStoreError> for FetchError {
  fn from(err: CacheStoreError) -> Self {
    Self::Cache(err.to_string())
  }
}

/// Error surfaced from a sync engine write path.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
  /// The remote store refused the write permanently; it was not queued.
  #[error(transparent)]
  Rejected(RemoteError),
}

/// Failure talking to the request interceptor.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InterceptorError {
  /// The worker task has exited and no longer takes commands.
  #[error("request interceptor has stopped")]
  Stopped,

  #[error(transparent)]
  Fetch(#[from] FetchError),
}
