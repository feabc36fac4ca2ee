//! Error types for the cache core.

use thiserror::Error;

use crate::cache::{MutationId, QueryKey};

/// A failed call to an external fetch or write function.
///
/// Cloneable so a single failure can be observed by every caller sharing
/// an in-flight request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct FetchError {
  message: String,
  status: Option<u16>,
}

impl FetchError {
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
      status: None,
    }
  }

  /// A non-success response with its HTTP status code.
  pub fn with_status(status: u16, message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
      status: Some(status),
    }
  }

  pub fn message(&self) -> &str {
    &self.message
  }

  pub fn status(&self) -> Option<u16> {
    self.status
  }
}

impl From<reqwest::Error> for FetchError {
  fn from(err: reqwest::Error) -> Self {
    match err.status() {
      Some(status) => Self::with_status(status.as_u16(), err.to_string()),
      None => Self::new(err.to_string()),
    }
  }
}

/// Errors surfaced by the query client.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
  #[error("fetch failed for {key}: {source}")]
  FetchFailure {
    key: QueryKey,
    #[source]
    source: FetchError,
  },

  #[error("persistence failed: {0}")]
  PersistenceFailure(String),

  #[error("persisted snapshot discarded: expected version {expected:?}, found {found:?}")]
  VersionMismatch { expected: String, found: String },

  #[error("replay of mutation {id} for {key} failed: {source}")]
  MutationConflict {
    id: MutationId,
    key: QueryKey,
    #[source]
    source: FetchError,
  },

  #[error("no mutation function registered for {0}")]
  MissingMutationFn(QueryKey),
}

impl CacheError {
  /// The key this error concerns, if any.
  pub fn key(&self) -> Option<&QueryKey> {
    match self {
      Self::FetchFailure { key, .. }
      | Self::MutationConflict { key, .. }
      | Self::MissingMutationFn(key) => Some(key),
      Self::PersistenceFailure(_) | Self::VersionMismatch { .. } => None,
    }
  }
}

impl From<serde_json::Error> for CacheError {
  fn from(err: serde_json::Error) -> Self {
    Self::PersistenceFailure(format!("serialization error: {}", err))
  }
}

impl From<rusqlite::Error> for CacheError {
  fn from(err: rusqlite::Error) -> Self {
    Self::PersistenceFailure(format!("storage error: {}", err))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_fetch_error_keeps_status() {
    let err = FetchError::with_status(503, "503 Service Unavailable");
    assert_eq!(err.status(), Some(503));
    assert_eq!(err.to_string(), "503 Service Unavailable");
  }

  #[test]
  fn test_cache_error_key() {
    let key = QueryKey::new(["user", "1"]);
    let err = CacheError::FetchFailure {
      key: key.clone(),
      source: FetchError::new("boom"),
    };
    assert_eq!(err.key(), Some(&key));
    assert_eq!(err.to_string(), r#"fetch failed for ["user","1"]: boom"#);
    assert!(CacheError::PersistenceFailure("disk".into()).key().is_none());
  }
}
