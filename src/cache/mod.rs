//! Offline-first query cache.
//!
//! This module provides a generic caching mechanism that:
//! - Stores entities under hierarchical query keys with a status per entry
//! - Deduplicates concurrent fetches and serves stale data while revalidating
//! - Applies mutations optimistically and rolls them back on failure
//! - Pauses mutations while offline and replays them in order on reconnect
//! - Persists a versioned snapshot so cached data and paused mutations
//!   survive restarts

pub(crate) mod client;
mod connectivity;
mod key;
mod mutation;
mod persist;
mod storage;
mod store;
mod traits;

pub use client::{ClientConfig, QueryClient, QueryClientBuilder, RestoreOutcome};
pub use connectivity::Connectivity;
pub use key::{KeyPart, QueryKey};
pub use mutation::{
  mutate_fn, MutateFn, MutationHooks, MutationId, MutationOptions, MutationOutcome, MutationResult,
  PendingMutation, ResumeReport,
};
pub use persist::{PersistedSnapshot, Persister, DEFAULT_PERSIST_KEY};
pub use storage::{KeyValueStorage, MemoryStorage, SqliteStorage};
pub use store::{CacheEntry, EntityStore, QueryStatus};
pub use traits::Cacheable;
