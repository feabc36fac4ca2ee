//! Consumer-facing query state and subscriptions.
//!
//! Inspired by TanStack Query. A [`Subscription`] is handed out by
//! [`QueryClient::query`](crate::cache::QueryClient::query) and follows one
//! cache key; it can be polled from an event loop tick or awaited.
//!
//! # Example
//!
//! ```ignore
//! let mut sub = client.query(UserKeys::detail("1"), fetch_user, options);
//!
//! // In event loop tick
//! if sub.poll() {
//!     // State changed, trigger re-render
//! }
//!
//! // In render
//! let state = sub.state();
//! match state.status {
//!     QueryStatus::Loading => render_spinner(),
//!     QueryStatus::Success => render_data(state.data()),
//!     QueryStatus::Error => render_error(state.error()),
//!     QueryStatus::Idle => {}
//! }
//! ```

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::watch;

use crate::cache::client::WeakClient;
use crate::cache::{CacheEntry, Cacheable, QueryKey};

pub use crate::cache::QueryStatus;

/// Read-only projection of one cache entry.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryState<T> {
  pub status: QueryStatus,
  pub data: Option<T>,
  pub error: Option<String>,
  pub updated_at: Option<DateTime<Utc>>,
  /// A fetch is in flight (with or without data already present)
  pub is_fetching: bool,
  pub is_invalidated: bool,
}

impl<T> Default for QueryState<T> {
  fn default() -> Self {
    Self {
      status: QueryStatus::Idle,
      data: None,
      error: None,
      updated_at: None,
      is_fetching: false,
      is_invalidated: false,
    }
  }
}

impl<T: Clone> QueryState<T> {
  pub(crate) fn from_entry(entry: Option<&CacheEntry<T>>, is_fetching: bool) -> Self {
    match entry {
      Some(entry) => Self {
        status: entry.status,
        data: entry.data.clone(),
        error: entry.error.clone(),
        updated_at: Some(entry.updated_at),
        is_fetching,
        is_invalidated: entry.is_invalidated,
      },
      None => Self {
        is_fetching,
        ..Self::default()
      },
    }
  }
}

impl<T> QueryState<T> {
  pub fn is_loading(&self) -> bool {
    self.status == QueryStatus::Loading
  }

  pub fn is_success(&self) -> bool {
    self.status == QueryStatus::Success
  }

  pub fn is_error(&self) -> bool {
    self.status == QueryStatus::Error
  }

  pub fn data(&self) -> Option<&T> {
    self.data.as_ref()
  }

  pub fn error(&self) -> Option<&str> {
    self.error.as_deref()
  }
}

/// Per-query tuning. Defaults come from the client's
/// [`ClientConfig`](crate::cache::ClientConfig).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOptions {
  /// Data younger than this is served without refetching
  pub stale_time: Duration,
  /// Unobserved entries are evicted after this long
  pub cache_time: Duration,
  /// Retries after the first failed attempt
  pub retry: u32,
  /// Delay before the first retry; doubles on each further attempt
  pub retry_delay: Duration,
  pub max_retry_delay: Duration,
}

impl Default for QueryOptions {
  fn default() -> Self {
    Self {
      stale_time: Duration::ZERO,
      cache_time: Duration::from_secs(5 * 60),
      retry: 3,
      retry_delay: Duration::from_secs(1),
      max_retry_delay: Duration::from_secs(30),
    }
  }
}

impl QueryOptions {
  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = stale_time;
    self
  }

  pub fn with_cache_time(mut self, cache_time: Duration) -> Self {
    self.cache_time = cache_time;
    self
  }

  pub fn with_retry(mut self, retry: u32) -> Self {
    self.retry = retry;
    self
  }

  pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
    self.retry_delay = retry_delay;
    self
  }

  /// Backoff before retry number `attempt` (1-based).
  pub fn retry_delay_for(&self, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    self
      .retry_delay
      .saturating_mul(factor)
      .min(self.max_retry_delay)
  }
}

/// Live view of one cache key.
///
/// Dropping the last subscription for a key starts its garbage-collection
/// timer.
pub struct Subscription<T: Cacheable> {
  key: QueryKey,
  rx: watch::Receiver<QueryState<T>>,
  client: WeakClient<T>,
}

impl<T: Cacheable> Subscription<T> {
  pub(crate) fn new(key: QueryKey, rx: watch::Receiver<QueryState<T>>, client: WeakClient<T>) -> Self {
    Self { key, rx, client }
  }

  pub fn key(&self) -> &QueryKey {
    &self.key
  }

  /// Current state of the key.
  pub fn state(&self) -> QueryState<T> {
    self.rx.borrow().clone()
  }

  /// Returns `true` if the state changed since the last poll.
  /// Call this in your event loop tick handler.
  pub fn poll(&mut self) -> bool {
    match self.rx.has_changed() {
      Ok(true) => {
        self.rx.borrow_and_update();
        true
      }
      _ => false,
    }
  }

  /// Wait for the next state change. Returns `None` once the client is gone.
  pub async fn changed(&mut self) -> Option<QueryState<T>> {
    self.rx.changed().await.ok()?;
    Some(self.rx.borrow_and_update().clone())
  }

  /// Wait until no fetch is in flight and return the resulting state.
  pub async fn settled(&mut self) -> QueryState<T> {
    loop {
      let state = self.rx.borrow_and_update().clone();
      if !state.is_fetching {
        return state;
      }
      if self.rx.changed().await.is_err() {
        return state;
      }
    }
  }
}

impl<T: Cacheable> Drop for Subscription<T> {
  fn drop(&mut self) {
    if let Some(client) = self.client.upgrade() {
      client.release(&self.key);
    }
  }
}

impl<T: Cacheable + std::fmt::Debug> std::fmt::Debug for Subscription<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Subscription")
      .field("key", &self.key)
      .field("state", &*self.rx.borrow())
      .finish_non_exhaustive()
  }
}
