//! In-memory entity store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use super::key::QueryKey;

/// Lifecycle status of a cache entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
  /// Nothing has been fetched yet
  #[default]
  Idle,
  /// First fetch in progress, no data available
  Loading,
  /// Data available
  Success,
  /// Last fetch failed
  Error,
}

/// A cached value plus its metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
  pub key: QueryKey,
  pub data: Option<T>,
  pub status: QueryStatus,
  pub error: Option<String>,
  /// When the data (or error) was last written
  pub updated_at: DateTime<Utc>,
  /// Marked stale by an invalidation; refetched on next use
  #[serde(default)]
  pub is_invalidated: bool,
}

impl<T> CacheEntry<T> {
  fn empty(key: QueryKey) -> Self {
    Self {
      key,
      data: None,
      status: QueryStatus::Idle,
      error: None,
      updated_at: Utc::now(),
      is_invalidated: false,
    }
  }

  /// Whether the entry can be served without a refetch.
  pub fn is_fresh(&self, stale_time: Duration) -> bool {
    if self.status != QueryStatus::Success || self.data.is_none() || self.is_invalidated {
      return false;
    }
    match (Utc::now() - self.updated_at).to_std() {
      Ok(age) => age < stale_time,
      // Written "in the future" (clock skew): treat as just written
      Err(_) => !stale_time.is_zero(),
    }
  }
}

/// Mapping from query key to cached entry.
///
/// Writes are last-write-wins; reads of missing keys return `None`.
#[derive(Debug)]
pub struct EntityStore<T> {
  entries: BTreeMap<QueryKey, CacheEntry<T>>,
}

impl<T> Default for EntityStore<T> {
  fn default() -> Self {
    Self {
      entries: BTreeMap::new(),
    }
  }
}

impl<T> EntityStore<T> {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn get(&self, key: &QueryKey) -> Option<&CacheEntry<T>> {
    self.entries.get(key)
  }

  /// Overwrite the data for `key` and mark it successful.
  pub fn set(&mut self, key: &QueryKey, data: T) -> &CacheEntry<T> {
    let entry = self.entry_mut(key);
    entry.data = Some(data);
    entry.status = QueryStatus::Success;
    entry.error = None;
    entry.is_invalidated = false;
    entry.updated_at = Utc::now();
    entry
  }

  /// Record a failure for `key`, keeping any data already cached.
  pub fn set_error(&mut self, key: &QueryKey, error: impl Into<String>) -> &CacheEntry<T> {
    let entry = self.entry_mut(key);
    entry.status = QueryStatus::Error;
    entry.error = Some(error.into());
    entry.updated_at = Utc::now();
    entry
  }

  /// Mark a fetch as started. Entries that already hold data keep their status.
  pub fn set_loading(&mut self, key: &QueryKey) {
    let entry = self.entry_mut(key);
    if entry.data.is_none() {
      entry.status = QueryStatus::Loading;
    }
  }

  /// Undo `set_loading` after a cancelled fetch.
  pub fn revert_loading(&mut self, key: &QueryKey) {
    if let Some(entry) = self.entries.get_mut(key) {
      if entry.status == QueryStatus::Loading {
        entry.status = QueryStatus::Idle;
      }
    }
  }

  /// Mark `key` stale. Returns false when the key is not cached.
  pub fn invalidate(&mut self, key: &QueryKey) -> bool {
    match self.entries.get_mut(key) {
      Some(entry) => {
        entry.is_invalidated = true;
        true
      }
      None => false,
    }
  }

  pub fn delete(&mut self, key: &QueryKey) -> Option<CacheEntry<T>> {
    self.entries.remove(key)
  }

  /// All cached keys that start with `prefix`, in key order.
  pub fn find_by_prefix(&self, prefix: &QueryKey) -> Vec<QueryKey> {
    self
      .entries
      .keys()
      .filter(|key| key.starts_with(prefix))
      .cloned()
      .collect()
  }

  /// Insert a whole entry, e.g. one restored from disk.
  pub fn insert_entry(&mut self, entry: CacheEntry<T>) {
    self.entries.insert(entry.key.clone(), entry);
  }

  pub fn entries(&self) -> impl Iterator<Item = &CacheEntry<T>> {
    self.entries.values()
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn clear(&mut self) {
    self.entries.clear();
  }

  fn entry_mut(&mut self, key: &QueryKey) -> &mut CacheEntry<T> {
    self
      .entries
      .entry(key.clone())
      .or_insert_with(|| CacheEntry::empty(key.clone()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn key(id: &str) -> QueryKey {
    QueryKey::new(["user", "use-user-query", id])
  }

  #[test]
  fn test_set_then_get() {
    let mut store = EntityStore::new();
    store.set(&key("1"), "Alice".to_string());

    let entry = store.get(&key("1")).unwrap();
    assert_eq!(entry.data.as_deref(), Some("Alice"));
    assert_eq!(entry.status, QueryStatus::Success);
    assert!(store.get(&key("2")).is_none());
  }

  #[test]
  fn test_set_is_last_write_wins() {
    let mut store = EntityStore::new();
    store.set(&key("1"), 1);
    store.set(&key("1"), 2);
    assert_eq!(store.get(&key("1")).unwrap().data, Some(2));
    assert_eq!(store.len(), 1);
  }

  #[test]
  fn test_set_error_keeps_data() {
    let mut store = EntityStore::new();
    store.set(&key("1"), 1);
    store.set_error(&key("1"), "offline");

    let entry = store.get(&key("1")).unwrap();
    assert_eq!(entry.status, QueryStatus::Error);
    assert_eq!(entry.data, Some(1));
    assert_eq!(entry.error.as_deref(), Some("offline"));
  }

  #[test]
  fn test_missing_keys_do_not_fail() {
    let mut store: EntityStore<i32> = EntityStore::new();
    assert!(store.delete(&key("1")).is_none());
    assert!(!store.invalidate(&key("1")));
    store.revert_loading(&key("1"));
    assert!(store.is_empty());

    store.set_error(&key("2"), "boom");
    assert_eq!(store.get(&key("2")).unwrap().data, None);
  }

  #[test]
  fn test_loading_only_without_data() {
    let mut store = EntityStore::new();
    store.set_loading(&key("1"));
    assert_eq!(store.get(&key("1")).unwrap().status, QueryStatus::Loading);
    store.revert_loading(&key("1"));
    assert_eq!(store.get(&key("1")).unwrap().status, QueryStatus::Idle);

    store.set(&key("2"), 5);
    store.set_loading(&key("2"));
    assert_eq!(store.get(&key("2")).unwrap().status, QueryStatus::Success);
  }

  #[test]
  fn test_find_by_prefix() {
    let mut store = EntityStore::new();
    store.set(&key("1"), 1);
    store.set(&key("2"), 2);
    store.set(&QueryKey::new(["post", "1"]), 3);

    let users = store.find_by_prefix(&QueryKey::new(["user"]));
    assert_eq!(users, vec![key("1"), key("2")]);
    assert_eq!(store.find_by_prefix(&QueryKey::default()).len(), 3);
  }

  #[test]
  fn test_freshness() {
    let mut store = EntityStore::new();
    store.set(&key("1"), 1);

    let entry = store.get(&key("1")).unwrap();
    assert!(entry.is_fresh(Duration::from_secs(60)));
    assert!(!entry.is_fresh(Duration::ZERO));

    store.invalidate(&key("1"));
    assert!(!store.get(&key("1")).unwrap().is_fresh(Duration::from_secs(60)));
  }
}
