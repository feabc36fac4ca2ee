//! Durable key-value storage trait and SQLite implementation.

use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::CacheError;

/// Trait for durable storage backends.
///
/// A byte-oriented string store; the persister owns the format of the values.
/// Calls block, so async callers run them on the blocking pool.
pub trait KeyValueStorage: Send + Sync {
  fn get_string(&self, key: &str) -> Result<Option<String>, CacheError>;

  fn set_string(&self, key: &str, value: &str) -> Result<(), CacheError>;

  /// Remove the value stored under `key`, if any.
  fn remove(&self, key: &str) -> Result<(), CacheError>;

  /// Remove every stored value.
  fn clear(&self) -> Result<(), CacheError>;
}

/// Storage that lives only as long as the process. Used in tests and when
/// persistence is not wanted across restarts.
#[derive(Debug, Default)]
pub struct MemoryStorage {
  values: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>, CacheError> {
    self
      .values
      .lock()
      .map_err(|e| CacheError::PersistenceFailure(format!("lock poisoned: {}", e)))
  }
}

impl KeyValueStorage for MemoryStorage {
  fn get_string(&self, key: &str) -> Result<Option<String>, CacheError> {
    Ok(self.lock()?.get(key).cloned())
  }

  fn set_string(&self, key: &str, value: &str) -> Result<(), CacheError> {
    self.lock()?.insert(key.to_string(), value.to_string());
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<(), CacheError> {
    self.lock()?.remove(key);
    Ok(())
  }

  fn clear(&self) -> Result<(), CacheError> {
    self.lock()?.clear();
    Ok(())
  }
}

/// SQLite-based storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the database at `path`.
  pub fn open(path: &Path) -> Result<Self, CacheError> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        CacheError::PersistenceFailure(format!("failed to create cache directory: {}", e))
      })?;
    }

    let conn = Connection::open(path).map_err(|e| {
      CacheError::PersistenceFailure(format!(
        "failed to open cache database at {}: {}",
        path.display(),
        e
      ))
    })?;

    Self::with_connection(conn)
  }

  /// A private database that disappears with the connection.
  pub fn open_in_memory() -> Result<Self, CacheError> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  /// Get the default database path.
  pub fn default_path() -> Option<PathBuf> {
    let data_dir = dirs::data_dir().or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))?;
    Some(data_dir.join("offline-query").join("cache.db"))
  }

  fn with_connection(conn: Connection) -> Result<Self, CacheError> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, CacheError> {
    self
      .conn
      .lock()
      .map_err(|e| CacheError::PersistenceFailure(format!("lock poisoned: {}", e)))
  }

  /// Run database migrations for the storage table.
  fn run_migrations(&self) -> Result<(), CacheError> {
    self.lock()?.execute_batch(STORAGE_SCHEMA)?;
    Ok(())
  }
}

/// Schema for the storage table.
const STORAGE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl KeyValueStorage for SqliteStorage {
  fn get_string(&self, key: &str) -> Result<Option<String>, CacheError> {
    let conn = self.lock()?;
    let value = conn
      .query_row(
        "SELECT value FROM kv_store WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()?;
    Ok(value)
  }

  fn set_string(&self, key: &str, value: &str) -> Result<(), CacheError> {
    let conn = self.lock()?;
    conn.execute(
      "INSERT OR REPLACE INTO kv_store (key, value, updated_at)
       VALUES (?, ?, datetime('now'))",
      params![key, value],
    )?;
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<(), CacheError> {
    self
      .lock()?
      .execute("DELETE FROM kv_store WHERE key = ?", params![key])?;
    Ok(())
  }

  fn clear(&self) -> Result<(), CacheError> {
    self.lock()?.execute("DELETE FROM kv_store", [])?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn exercise(storage: &dyn KeyValueStorage) {
    assert_eq!(storage.get_string("cache").unwrap(), None);

    storage.set_string("cache", "one").unwrap();
    storage.set_string("cache", "two").unwrap();
    assert_eq!(storage.get_string("cache").unwrap().as_deref(), Some("two"));

    storage.set_string("other", "three").unwrap();
    storage.remove("cache").unwrap();
    storage.remove("missing").unwrap();
    assert_eq!(storage.get_string("cache").unwrap(), None);
    assert_eq!(storage.get_string("other").unwrap().as_deref(), Some("three"));

    storage.clear().unwrap();
    assert_eq!(storage.get_string("cache").unwrap(), None);
  }

  #[test]
  fn test_memory_storage() {
    exercise(&MemoryStorage::new());
  }

  #[test]
  fn test_sqlite_storage_in_memory() {
    exercise(&SqliteStorage::open_in_memory().unwrap());
  }

  #[test]
  fn test_sqlite_storage_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.db");

    {
      let storage = SqliteStorage::open(&path).unwrap();
      storage.set_string("cache", "{\"v\":1}").unwrap();
    }

    let storage = SqliteStorage::open(&path).unwrap();
    assert_eq!(
      storage.get_string("cache").unwrap().as_deref(),
      Some("{\"v\":1}")
    );
  }
}
