//! Snapshot persistence on top of a [`KeyValueStorage`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::mutation::PendingMutation;
use super::storage::KeyValueStorage;
use super::store::CacheEntry;
use super::traits::Cacheable;
use crate::error::CacheError;

/// Storage key used when none is configured.
pub const DEFAULT_PERSIST_KEY: &str = "offline-query-cache";

/// Everything needed to rebuild a client after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSnapshot<T> {
  pub entities: Vec<CacheEntry<T>>,
  pub paused_mutations: Vec<PendingMutation<T>>,
  /// The buster the snapshot was written with
  pub schema_version: String,
  pub persisted_at: DateTime<Utc>,
}

/// Writes and reads a single snapshot record tagged with a compatibility
/// token (the "buster").
///
/// A record written under a different buster, or older than `max_age`, is
/// discarded whole on restore.
#[derive(Clone)]
pub struct Persister {
  storage: Arc<dyn KeyValueStorage>,
  key: String,
  buster: String,
  max_age: Duration,
}

impl Persister {
  pub fn new(storage: Arc<dyn KeyValueStorage>) -> Self {
    Self {
      storage,
      key: DEFAULT_PERSIST_KEY.to_string(),
      buster: String::new(),
      max_age: Duration::from_secs(24 * 60 * 60),
    }
  }

  /// Storage key the snapshot is written under.
  pub fn with_key(mut self, key: impl Into<String>) -> Self {
    self.key = key.into();
    self
  }

  pub fn with_buster(mut self, buster: impl Into<String>) -> Self {
    self.buster = buster.into();
    self
  }

  pub fn with_max_age(mut self, max_age: Duration) -> Self {
    self.max_age = max_age;
    self
  }

  pub fn buster(&self) -> &str {
    &self.buster
  }

  pub fn key(&self) -> &str {
    &self.key
  }

  /// Write `snapshot` to storage, replacing any previous record.
  pub async fn persist<T: Cacheable>(&self, snapshot: &PersistedSnapshot<T>) -> Result<(), CacheError> {
    self.persist_holding(snapshot, ()).await
  }

  /// Like [`Self::persist`], keeping `guard` alive until the blocking write
  /// has finished, whether or not the caller is still waiting for it.
  pub(crate) async fn persist_holding<T: Cacheable, G: Send + 'static>(
    &self,
    snapshot: &PersistedSnapshot<T>,
    guard: G,
  ) -> Result<(), CacheError> {
    let value = serde_json::to_string(snapshot)?;
    let storage = Arc::clone(&self.storage);
    let key = self.key.clone();

    tokio::task::spawn_blocking(move || {
      let _guard = guard;
      storage.set_string(&key, &value)
    })
    .await
    .map_err(|e| CacheError::PersistenceFailure(format!("persist task failed: {}", e)))??;

    debug!(
      key = %self.key,
      entities = snapshot.entities.len(),
      paused = snapshot.paused_mutations.len(),
      "persisted cache snapshot"
    );
    Ok(())
  }

  /// Read the stored snapshot.
  ///
  /// Returns `Ok(None)` when nothing is stored or the record has expired.
  /// A buster mismatch removes the record and returns
  /// [`CacheError::VersionMismatch`]; an undecodable record is removed and
  /// reported as [`CacheError::PersistenceFailure`].
  pub async fn restore<T: Cacheable>(&self) -> Result<Option<PersistedSnapshot<T>>, CacheError> {
    let storage = Arc::clone(&self.storage);
    let key = self.key.clone();
    let raw = tokio::task::spawn_blocking(move || storage.get_string(&key))
      .await
      .map_err(|e| CacheError::PersistenceFailure(format!("restore task failed: {}", e)))??;

    let Some(raw) = raw else {
      return Ok(None);
    };

    let value: Value = match serde_json::from_str(&raw) {
      Ok(value) => value,
      Err(err) => return Err(self.discard(err.into()).await),
    };

    // Check the version before decoding entities, whose shape may have changed
    let found = value
      .get("schema_version")
      .and_then(Value::as_str)
      .unwrap_or_default()
      .to_string();
    if found != self.buster {
      let mismatch = CacheError::VersionMismatch {
        expected: self.buster.clone(),
        found,
      };
      return Err(self.discard(mismatch).await);
    }

    let snapshot: PersistedSnapshot<T> = match serde_json::from_value(value) {
      Ok(snapshot) => snapshot,
      Err(err) => return Err(self.discard(err.into()).await),
    };

    if let Ok(age) = (Utc::now() - snapshot.persisted_at).to_std() {
      if age > self.max_age {
        debug!(key = %self.key, ?age, "persisted snapshot expired");
        self.remove().await?;
        return Ok(None);
      }
    }

    Ok(Some(snapshot))
  }

  /// Delete the stored snapshot. Other records in the storage are kept.
  pub async fn remove(&self) -> Result<(), CacheError> {
    let storage = Arc::clone(&self.storage);
    let key = self.key.clone();
    tokio::task::spawn_blocking(move || storage.remove(&key))
      .await
      .map_err(|e| CacheError::PersistenceFailure(format!("remove task failed: {}", e)))?
  }

  async fn discard(&self, reason: CacheError) -> CacheError {
    if let Err(err) = self.remove().await {
      warn!(key = %self.key, error = %err, "failed to remove discarded snapshot");
    }
    reason
  }
}

impl std::fmt::Debug for Persister {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Persister")
      .field("key", &self.key)
      .field("buster", &self.buster)
      .field("max_age", &self.max_age)
      .finish_non_exhaustive()
  }
}
