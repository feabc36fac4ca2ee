//! Query client: the entity store plus the query engine around it.

use futures::future::{AbortHandle, Abortable, BoxFuture, Shared};
use futures::FutureExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::connectivity::Connectivity;
use super::key::QueryKey;
use super::mutation::{MutateFn, PausedMutation};
use super::persist::{PersistedSnapshot, Persister};
use super::store::{CacheEntry, EntityStore, QueryStatus};
use super::traits::Cacheable;
use crate::error::{CacheError, FetchError};
use crate::query::{QueryOptions, QueryState, Subscription};

/// A factory function that creates futures for fetching data
pub(crate) type Fetcher<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, FetchError>> + Send + Sync>;

/// An in-flight fetch that every caller for the same key awaits.
type SharedFetch = Shared<BoxFuture<'static, ()>>;

/// Client-wide settings. Every field has a documented default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
  /// Default: zero (always revalidate)
  pub stale_time: Duration,
  /// Default: 5 minutes
  pub cache_time: Duration,
  /// Default: 3
  pub retry: u32,
  /// Default: 1 second, doubling per attempt
  pub retry_delay: Duration,
  /// Default: 30 seconds
  pub max_retry_delay: Duration,
  /// Minimum spacing between snapshot writes. Default: 1 second
  pub persist_throttle: Duration,
  /// Refetch stale active queries after coming back online. Default: true
  pub refetch_on_reconnect: bool,
  /// Refetch stale active queries when the app regains focus. Default: true
  pub refetch_on_focus: bool,
}

impl Default for ClientConfig {
  fn default() -> Self {
    let query = QueryOptions::default();
    Self {
      stale_time: query.stale_time,
      cache_time: query.cache_time,
      retry: query.retry,
      retry_delay: query.retry_delay,
      max_retry_delay: query.max_retry_delay,
      persist_throttle: Duration::from_secs(1),
      refetch_on_reconnect: true,
      refetch_on_focus: true,
    }
  }
}

impl ClientConfig {
  /// Query options seeded from this config.
  pub fn query_options(&self) -> QueryOptions {
    QueryOptions {
      stale_time: self.stale_time,
      cache_time: self.cache_time,
      retry: self.retry,
      retry_delay: self.retry_delay,
      max_retry_delay: self.max_retry_delay,
    }
  }
}

/// What `restore` found in storage.
#[derive(Debug)]
pub enum RestoreOutcome {
  /// No persister configured
  Skipped,
  /// Nothing stored, or the stored snapshot expired
  Empty,
  Restored {
    entries: usize,
    paused_mutations: usize,
  },
  /// Written under another buster and thrown away
  Discarded,
  /// Unreadable; the client starts empty
  Failed(CacheError),
}

struct InFlight {
  id: u64,
  abort: AbortHandle,
  done: SharedFetch,
}

struct Observer<T> {
  tx: watch::Sender<QueryState<T>>,
  fetcher: Option<Fetcher<T>>,
  options: QueryOptions,
}

impl<T> Observer<T> {
  fn new(initial: QueryState<T>, options: QueryOptions) -> Self {
    let (tx, _rx) = watch::channel(initial);
    Self {
      tx,
      fetcher: None,
      options,
    }
  }

  fn is_active(&self) -> bool {
    self.tx.receiver_count() > 0
  }
}

/// Mutable state guarded by the client's lock. Never held across an await.
pub(crate) struct ClientState<T> {
  pub(crate) store: EntityStore<T>,
  in_flight: HashMap<QueryKey, InFlight>,
  observers: HashMap<QueryKey, Observer<T>>,
  /// Unobserved keys: since when, and how long until eviction
  idle_since: HashMap<QueryKey, (Instant, Duration)>,
  pub(crate) paused: VecDeque<PausedMutation<T>>,
  /// Keys whose paused mutations are not replayed automatically
  pub(crate) halted: HashSet<QueryKey>,
  pub(crate) mutation_defaults: Vec<(QueryKey, MutateFn<T>)>,
  next_fetch_id: u64,
  pub(crate) hydrated: bool,
}

impl<T: Cacheable> ClientState<T> {
  fn new(hydrated: bool) -> Self {
    Self {
      store: EntityStore::new(),
      in_flight: HashMap::new(),
      observers: HashMap::new(),
      idle_since: HashMap::new(),
      paused: VecDeque::new(),
      halted: HashSet::new(),
      mutation_defaults: Vec::new(),
      next_fetch_id: 0,
      hydrated,
    }
  }

  fn project(&self, key: &QueryKey) -> QueryState<T> {
    QueryState::from_entry(self.store.get(key), self.in_flight.contains_key(key))
  }

  fn is_observed(&self, key: &QueryKey) -> bool {
    self.observers.get(key).is_some_and(Observer::is_active)
  }

  /// Push the current projection of `key` to its subscribers.
  pub(crate) fn notify(&self, key: &QueryKey) {
    if let Some(observer) = self.observers.get(key) {
      observer.tx.send_replace(self.project(key));
    }
  }

  /// Abort the in-flight fetch for exactly `key`. Returns false if none.
  pub(crate) fn cancel(&mut self, key: &QueryKey) -> bool {
    let Some(fetch) = self.in_flight.remove(key) else {
      return false;
    };
    fetch.abort.abort();
    self.store.revert_loading(key);
    self.notify(key);
    debug!(%key, "cancelled query");
    true
  }

  pub(crate) fn has_paused_for(&self, key: &QueryKey) -> bool {
    self.paused.iter().any(|p| &p.record.mutation_key == key)
  }

  fn snapshot(&self, buster: &str) -> PersistedSnapshot<T> {
    PersistedSnapshot {
      entities: self
        .store
        .entries()
        .filter(|e| e.status == QueryStatus::Success && e.data.is_some())
        .cloned()
        .collect(),
      paused_mutations: self.paused.iter().map(|p| p.record.clone()).collect(),
      schema_version: buster.to_string(),
      persisted_at: chrono::Utc::now(),
    }
  }
}

pub(crate) struct Inner<T> {
  pub(crate) config: ClientConfig,
  pub(crate) state: Mutex<ClientState<T>>,
  pub(crate) connectivity: Connectivity,
  persister: Option<Persister>,
  persist_signal: Arc<Notify>,
  /// Held from taking a snapshot until its write has landed in storage
  persist_lock: Arc<tokio::sync::Mutex<()>>,
  /// One replay at a time, so no paused mutation is sent twice
  pub(crate) resume_lock: tokio::sync::Mutex<()>,
  /// Per-key FIFO execution of mutations
  pub(crate) exec_locks: Mutex<HashMap<QueryKey, Arc<tokio::sync::Mutex<()>>>>,
  tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<T> Drop for Inner<T> {
  fn drop(&mut self) {
    let tasks = self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner);
    for task in tasks.drain(..) {
      task.abort();
    }
    let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
    for (_, fetch) in state.in_flight.drain() {
      fetch.abort.abort();
    }
  }
}

/// Offline-first cache of server entities of one type.
///
/// Cheap to clone; clones share the same cache. Construct one per process
/// (or per test) with [`QueryClient::builder`].
pub struct QueryClient<T: Cacheable> {
  pub(crate) inner: Arc<Inner<T>>,
}

impl<T: Cacheable> Clone for QueryClient<T> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

/// Non-owning handle used by background tasks and subscriptions.
pub(crate) struct WeakClient<T>(Weak<Inner<T>>);

impl<T: Cacheable> WeakClient<T> {
  pub(crate) fn upgrade(&self) -> Option<QueryClient<T>> {
    self.0.upgrade().map(|inner| QueryClient { inner })
  }
}

impl<T> Clone for WeakClient<T> {
  fn clone(&self) -> Self {
    Self(Weak::clone(&self.0))
  }
}

/// Builder for [`QueryClient`].
pub struct QueryClientBuilder<T> {
  config: ClientConfig,
  persister: Option<Persister>,
  connectivity: Connectivity,
  _entity: PhantomData<fn() -> T>,
}

impl<T: Cacheable> QueryClientBuilder<T> {
  pub fn with_config(mut self, config: ClientConfig) -> Self {
    self.config = config;
    self
  }

  pub fn with_persister(mut self, persister: Persister) -> Self {
    self.persister = Some(persister);
    self
  }

  /// Share a connectivity gate with the host (defaults to a fresh online gate).
  pub fn with_connectivity(mut self, connectivity: Connectivity) -> Self {
    self.connectivity = connectivity;
    self
  }

  /// Build the client and start its background tasks.
  ///
  /// Must be called within a Tokio runtime.
  pub fn build(self) -> QueryClient<T> {
    // Without a persister there is nothing to restore before replaying
    let hydrated = self.persister.is_none();
    let has_persister = self.persister.is_some();
    let inner = Arc::new(Inner {
      config: self.config,
      state: Mutex::new(ClientState::new(hydrated)),
      connectivity: self.connectivity,
      persister: self.persister,
      persist_signal: Arc::new(Notify::new()),
      persist_lock: Arc::new(tokio::sync::Mutex::new(())),
      resume_lock: tokio::sync::Mutex::new(()),
      exec_locks: Mutex::new(HashMap::new()),
      tasks: Mutex::new(Vec::new()),
    });
    let client = QueryClient { inner };

    let mut tasks = Vec::new();
    if has_persister {
      tasks.push(tokio::spawn(persist_loop(
        client.downgrade(),
        Arc::clone(&client.inner.persist_signal),
      )));
    }
    tasks.push(tokio::spawn(reconnect_loop(
      client.downgrade(),
      client.inner.connectivity.watch(),
    )));
    *client.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner) = tasks;

    client
  }
}

impl<T: Cacheable> QueryClient<T> {
  pub fn builder() -> QueryClientBuilder<T> {
    QueryClientBuilder {
      config: ClientConfig::default(),
      persister: None,
      connectivity: Connectivity::default(),
      _entity: PhantomData,
    }
  }

  /// A client without persistence. Must be called within a Tokio runtime.
  pub fn new(config: ClientConfig) -> Self {
    Self::builder().with_config(config).build()
  }

  pub fn config(&self) -> &ClientConfig {
    &self.inner.config
  }

  /// Query options seeded from the client config.
  pub fn default_query_options(&self) -> QueryOptions {
    self.inner.config.query_options()
  }

  pub fn connectivity(&self) -> &Connectivity {
    &self.inner.connectivity
  }

  pub fn is_online(&self) -> bool {
    self.inner.connectivity.is_online()
  }

  pub fn persister(&self) -> Option<&Persister> {
    self.inner.persister.as_ref()
  }

  pub(crate) fn state(&self) -> MutexGuard<'_, ClientState<T>> {
    self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub(crate) fn downgrade(&self) -> WeakClient<T> {
    WeakClient(Arc::downgrade(&self.inner))
  }

  // ==========================================================================
  // Entity store access
  // ==========================================================================

  pub fn get_query_data(&self, key: &QueryKey) -> Option<T> {
    self.state().store.get(key).and_then(|e| e.data.clone())
  }

  /// Current projection of `key`, whether or not anyone subscribes to it.
  pub fn query_state(&self, key: &QueryKey) -> QueryState<T> {
    self.state().project(key)
  }

  /// Write `data` for `key` directly, as if it had been fetched.
  pub fn set_query_data(&self, key: &QueryKey, data: T) {
    let mut guard = self.state();
    let state = &mut *guard;
    state.store.set(key, data);
    self.touched(state, key);
  }

  /// Drop every cached entry under `prefix`. Returns how many were removed.
  pub fn remove_queries(&self, prefix: &QueryKey) -> usize {
    let mut guard = self.state();
    let state = &mut *guard;
    let keys = state.store.find_by_prefix(prefix);
    for key in &keys {
      state.cancel(key);
      state.store.delete(key);
      state.idle_since.remove(key);
      state.notify(key);
    }
    drop(guard);
    if !keys.is_empty() {
      self.schedule_persist();
    }
    keys.len()
  }

  /// Copies of every cached entry, in key order.
  pub fn entries(&self) -> Vec<CacheEntry<T>> {
    self.state().store.entries().cloned().collect()
  }

  /// Bookkeeping after any write to `key`: notify subscribers, start the
  /// eviction clock if nobody observes it, and schedule a snapshot write.
  pub(crate) fn touched(&self, state: &mut ClientState<T>, key: &QueryKey) {
    state.notify(key);
    if !state.is_observed(key) && !state.idle_since.contains_key(key) {
      let ttl = self.inner.config.cache_time;
      state.idle_since.insert(key.clone(), (Instant::now(), ttl));
      self.schedule_gc(ttl);
    }
    self.schedule_persist();
  }

  // ==========================================================================
  // Queries
  // ==========================================================================

  /// Subscribe to `key`, fetching it if the cached value is missing or stale.
  ///
  /// The returned subscription reflects every later write to the key,
  /// including refetches triggered by invalidation. Must be called within a
  /// Tokio runtime.
  pub fn query<F, Fut>(&self, key: QueryKey, fetcher: F, options: QueryOptions) -> Subscription<T>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
  {
    let fetcher: Fetcher<T> = Arc::new(move || fetcher().boxed());

    let rx = {
      let mut guard = self.state();
      let state = &mut *guard;
      state.idle_since.remove(&key);
      let initial = state.project(&key);
      let observer = state
        .observers
        .entry(key.clone())
        .or_insert_with(|| Observer::new(initial, options.clone()));
      observer.fetcher = Some(Arc::clone(&fetcher));
      observer.options = options.clone();
      observer.tx.subscribe()
    };

    self.ensure_fresh(&key, fetcher, &options);
    Subscription::new(key, rx, self.downgrade())
  }

  /// Resolve `key` without subscribing to it.
  ///
  /// Fresh data is returned as-is; otherwise this joins (or starts) the
  /// in-flight fetch for the key. Fetch failures end up in the returned
  /// state rather than as an error.
  pub async fn fetch_query<F, Fut>(&self, key: QueryKey, fetcher: F, options: QueryOptions) -> QueryState<T>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
  {
    let fetcher: Fetcher<T> = Arc::new(move || fetcher().boxed());
    if let Some(done) = self.ensure_fresh(&key, fetcher, &options) {
      done.await;
    }
    self.query_state(&key)
  }

  /// Abort in-flight fetches under `prefix`. In-flight mutations are not
  /// affected. Returns the number of fetches cancelled.
  pub fn cancel_queries(&self, prefix: &QueryKey) -> usize {
    let mut state = self.state();
    let keys: Vec<QueryKey> = state
      .in_flight
      .keys()
      .filter(|k| k.starts_with(prefix))
      .cloned()
      .collect();
    keys.iter().filter(|key| state.cancel(key)).count()
  }

  /// Mark every entry under `prefix` stale and refetch the ones that are
  /// actively observed, waiting for those refetches to settle.
  pub async fn invalidate_queries(&self, prefix: &QueryKey) {
    let pending = {
      let mut guard = self.state();
      let state = &mut *guard;
      for key in state.store.find_by_prefix(prefix) {
        state.store.invalidate(&key);
        state.notify(&key);
      }

      if self.is_online() {
        let active: Vec<(QueryKey, Fetcher<T>, QueryOptions)> = state
          .observers
          .iter()
          .filter(|(key, observer)| key.starts_with(prefix) && observer.is_active())
          .filter_map(|(key, observer)| {
            let fetcher = observer.fetcher.clone()?;
            Some((key.clone(), fetcher, observer.options.clone()))
          })
          .collect();

        active
          .into_iter()
          .map(|(key, fetcher, options)| {
            state.cancel(&key);
            self.start_fetch(state, &key, fetcher, &options)
          })
          .collect::<Vec<_>>()
      } else {
        Vec::new()
      }
    };

    self.schedule_persist();
    futures::future::join_all(pending).await;
  }

  /// Refetch every actively observed query whose data is stale.
  pub async fn refetch_stale(&self) {
    if !self.is_online() {
      return;
    }

    let pending = {
      let mut guard = self.state();
      let state = &mut *guard;
      let stale: Vec<(QueryKey, Fetcher<T>, QueryOptions)> = state
        .observers
        .iter()
        .filter(|(key, observer)| {
          observer.is_active()
            && !state.in_flight.contains_key(*key)
            && !state
              .store
              .get(key)
              .is_some_and(|e| e.is_fresh(observer.options.stale_time))
        })
        .filter_map(|(key, observer)| {
          let fetcher = observer.fetcher.clone()?;
          Some((key.clone(), fetcher, observer.options.clone()))
        })
        .collect();

      stale
        .into_iter()
        .map(|(key, fetcher, options)| self.start_fetch(state, &key, fetcher, &options))
        .collect::<Vec<_>>()
    };

    if !pending.is_empty() {
      debug!(count = pending.len(), "refetching stale queries");
    }
    futures::future::join_all(pending).await;
  }

  /// Report the foreground state of the host app. Becoming active refetches
  /// stale active queries when `refetch_on_focus` is set.
  pub async fn set_focused(&self, focused: bool) {
    if focused && self.inner.config.refetch_on_focus {
      self.refetch_stale().await;
    }
  }

  /// Join the in-flight fetch for `key`, or start one if the cached value
  /// is not fresh and we are online.
  fn ensure_fresh(&self, key: &QueryKey, fetcher: Fetcher<T>, options: &QueryOptions) -> Option<SharedFetch> {
    let mut guard = self.state();
    let state = &mut *guard;

    if let Some(fetch) = state.in_flight.get(key) {
      debug!(%key, "joining in-flight fetch");
      return Some(fetch.done.clone());
    }

    if state
      .store
      .get(key)
      .is_some_and(|e| e.is_fresh(options.stale_time))
    {
      debug!(%key, "serving fresh cache entry");
      return None;
    }

    if !self.is_online() {
      debug!(%key, "offline, serving cached state without fetching");
      return None;
    }

    Some(self.start_fetch(state, key, fetcher, options))
  }

  fn start_fetch(
    &self,
    state: &mut ClientState<T>,
    key: &QueryKey,
    fetcher: Fetcher<T>,
    options: &QueryOptions,
  ) -> SharedFetch {
    state.next_fetch_id += 1;
    let id = state.next_fetch_id;
    state.store.set_loading(key);

    let (abort, registration) = AbortHandle::new_pair();
    let task = run_fetch(self.downgrade(), key.clone(), id, fetcher, options.clone());
    let done = Abortable::new(task, registration).map(|_| ()).boxed().shared();

    state.in_flight.insert(
      key.clone(),
      InFlight {
        id,
        abort,
        done: done.clone(),
      },
    );
    self.touched(state, key);

    tokio::spawn(done.clone());
    done
  }

  /// Write a fetch result, unless the fetch was cancelled or superseded.
  fn settle_fetch(&self, key: &QueryKey, id: u64, outcome: Result<T, FetchError>) {
    let mut guard = self.state();
    let state = &mut *guard;

    if state.in_flight.get(key).map(|f| f.id) != Some(id) {
      debug!(%key, "discarding result of superseded fetch");
      return;
    }
    state.in_flight.remove(key);

    match outcome {
      Ok(data) => {
        state.store.set(key, data);
      }
      Err(source) => {
        let err = CacheError::FetchFailure {
          key: key.clone(),
          source,
        };
        warn!(error = %err, "query failed");
        state.store.set_error(key, err.to_string());
      }
    }
    self.touched(state, key);
  }

  // ==========================================================================
  // Garbage collection
  // ==========================================================================

  /// Called when a subscription is dropped.
  pub(crate) fn release(&self, key: &QueryKey) {
    let ttl = {
      let mut state = self.state();
      let Some(observer) = state.observers.get(key) else {
        return;
      };
      // The dropping receiver is still counted
      if observer.tx.receiver_count() > 1 {
        return;
      }
      let ttl = observer.options.cache_time;
      state.idle_since.insert(key.clone(), (Instant::now(), ttl));
      ttl
    };
    self.schedule_gc(ttl);
  }

  fn schedule_gc(&self, after: Duration) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
      return;
    };
    let weak = self.downgrade();
    handle.spawn(async move {
      tokio::time::sleep(after).await;
      if let Some(client) = weak.upgrade() {
        client.collect_garbage();
      }
    });
  }

  /// Evict entries nobody has observed for longer than their cache time.
  /// Returns how many were evicted.
  pub fn collect_garbage(&self) -> usize {
    let mut guard = self.state();
    let state = &mut *guard;
    let now = Instant::now();

    let expired: Vec<QueryKey> = state
      .idle_since
      .iter()
      .filter(|(key, (since, ttl))| {
        now.duration_since(*since) >= *ttl
          && !state.observers.get(*key).is_some_and(Observer::is_active)
          && !state.in_flight.contains_key(*key)
      })
      .map(|(key, _)| key.clone())
      .collect();

    for key in &expired {
      state.store.delete(key);
      state.idle_since.remove(key);
      state.observers.remove(key);
      debug!(%key, "evicted unobserved cache entry");
    }
    drop(guard);

    if !expired.is_empty() {
      self.schedule_persist();
    }
    expired.len()
  }

  // ==========================================================================
  // Persistence
  // ==========================================================================

  pub(crate) fn schedule_persist(&self) {
    if self.inner.persister.is_some() {
      self.inner.persist_signal.notify_one();
    }
  }

  /// Write a snapshot immediately instead of waiting for the throttle.
  ///
  /// A no-op before `restore` has run, so a fresh process cannot overwrite a
  /// snapshot it has not read yet. Writes land in the order their snapshots
  /// were taken, even when the awaiting task is aborted mid-write.
  pub async fn persist_now(&self) -> Result<(), CacheError> {
    let Some(persister) = self.inner.persister.clone() else {
      return Ok(());
    };
    let guard = Arc::clone(&self.inner.persist_lock).lock_owned().await;
    let snapshot = {
      let state = self.state();
      if !state.hydrated {
        return Ok(());
      }
      state.snapshot(persister.buster())
    };
    persister.persist_holding(&snapshot, guard).await
  }

  /// Load the persisted snapshot into this client.
  ///
  /// Restored entries replace cached ones only when newer; restored paused
  /// mutations are queued ahead of any submitted in this process. Paused
  /// mutations become eligible for replay once this has run.
  pub async fn restore(&self) -> RestoreOutcome {
    let Some(persister) = self.inner.persister.clone() else {
      self.state().hydrated = true;
      return RestoreOutcome::Skipped;
    };

    let outcome = match persister.restore::<T>().await {
      Ok(Some(snapshot)) => {
        let (entries, paused_mutations) = self.hydrate(snapshot);
        info!(entries, paused_mutations, "restored cache snapshot");
        RestoreOutcome::Restored {
          entries,
          paused_mutations,
        }
      }
      Ok(None) => RestoreOutcome::Empty,
      Err(CacheError::VersionMismatch { expected, found }) => {
        debug!(%expected, %found, "persisted snapshot has another version, discarded");
        RestoreOutcome::Discarded
      }
      Err(err) => {
        warn!(error = %err, "failed to restore cache, starting empty");
        RestoreOutcome::Failed(err)
      }
    };

    // Every outcome counts, including a discarded or unreadable snapshot
    self.state().hydrated = true;
    self.schedule_persist();
    outcome
  }

  fn hydrate(&self, snapshot: PersistedSnapshot<T>) -> (usize, usize) {
    let mut guard = self.state();
    let state = &mut *guard;

    let mut entries = 0;
    for entry in snapshot.entities {
      let key = entry.key.clone();
      let newer = state
        .store
        .get(&key)
        .map_or(true, |current| entry.updated_at > current.updated_at);
      if newer {
        state.store.insert_entry(entry);
        self.touched(state, &key);
        entries += 1;
      }
    }

    let known: HashSet<_> = state.paused.iter().map(|p| p.record.id).collect();
    let restored: Vec<PausedMutation<T>> = snapshot
      .paused_mutations
      .into_iter()
      .filter(|record| !known.contains(&record.id))
      .map(PausedMutation::restored)
      .collect();
    let paused = restored.len();
    for mutation in restored.into_iter().rev() {
      state.paused.push_front(mutation);
    }

    (entries, paused)
  }

  // ==========================================================================
  // Lifecycle
  // ==========================================================================

  /// Reset all in-memory state. Persisted data is left alone.
  pub fn clear(&self) {
    let mut guard = self.state();
    let state = &mut *guard;
    for (_, fetch) in state.in_flight.drain() {
      fetch.abort.abort();
    }
    state.store.clear();
    state.idle_since.clear();
    state.paused.clear();
    state.halted.clear();
    for observer in state.observers.values() {
      observer.tx.send_replace(QueryState::default());
    }
  }

  /// Flush a final snapshot and stop background work.
  pub async fn shutdown(&self) {
    if let Err(err) = self.persist_now().await {
      warn!(error = %err, "failed to persist cache on shutdown");
    }

    let tasks = std::mem::take(&mut *self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner));
    for task in tasks {
      task.abort();
    }

    let mut state = self.state();
    for (_, fetch) in state.in_flight.drain() {
      fetch.abort.abort();
    }
  }

  /// Called by the reconnect listener on every Offline→Online transition.
  async fn on_reconnect(&self) {
    if !self.state().hydrated {
      debug!("back online before restore, deferring replay");
      return;
    }

    info!("back online, resuming paused mutations");
    let report = self.resume_paused_mutations().await;
    if !report.conflicts.is_empty() {
      warn!(conflicts = report.conflicts.len(), "some paused mutations could not be replayed");
    }
    if self.inner.config.refetch_on_reconnect {
      self.refetch_stale().await;
    }
  }
}

async fn run_fetch<T: Cacheable>(
  client: WeakClient<T>,
  key: QueryKey,
  id: u64,
  fetcher: Fetcher<T>,
  options: QueryOptions,
) {
  let mut failures = 0;
  let outcome = loop {
    match fetcher().await {
      Ok(data) => break Ok(data),
      Err(err) if failures < options.retry => {
        failures += 1;
        let delay = options.retry_delay_for(failures);
        debug!(%key, attempt = failures, ?delay, error = %err, "fetch failed, retrying");
        tokio::time::sleep(delay).await;
      }
      Err(err) => break Err(err),
    }
  };

  if let Some(client) = client.upgrade() {
    client.settle_fetch(&key, id, outcome);
  }
}

/// Coalesce persist requests: one write per throttle window.
async fn persist_loop<T: Cacheable>(client: WeakClient<T>, signal: Arc<Notify>) {
  loop {
    signal.notified().await;

    let Some(throttle) = client.upgrade().map(|c| c.inner.config.persist_throttle) else {
      break;
    };
    tokio::time::sleep(throttle).await;

    let Some(strong) = client.upgrade() else {
      break;
    };
    if let Err(err) = strong.persist_now().await {
      warn!(error = %err, "failed to persist cache snapshot");
    }
  }
}

async fn reconnect_loop<T: Cacheable>(client: WeakClient<T>, mut rx: watch::Receiver<bool>) {
  while rx.changed().await.is_ok() {
    let online = *rx.borrow_and_update();
    if !online {
      debug!("connectivity lost");
      continue;
    }
    let Some(strong) = client.upgrade() else {
      break;
    };
    strong.on_reconnect().await;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::{KeyValueStorage, MemoryStorage};
  use serde::{Deserialize, Serialize};
  use std::sync::atomic::{AtomicUsize, Ordering};

  #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
  struct Item {
    id: String,
    name: String,
  }

  impl Cacheable for Item {
    fn cache_key(&self) -> String {
      self.id.clone()
    }

    fn entity_type() -> &'static str {
      "item"
    }
  }

  fn item(name: &str) -> Item {
    Item {
      id: "1".into(),
      name: name.into(),
    }
  }

  fn key() -> QueryKey {
    QueryKey::new(["item", "1"])
  }

  fn options() -> QueryOptions {
    QueryOptions::default()
      .with_retry(0)
      .with_retry_delay(Duration::from_millis(1))
  }

  /// Fetcher that counts calls and answers after a short delay.
  fn counting(
    calls: Arc<AtomicUsize>,
    value: Item,
  ) -> impl Fn() -> BoxFuture<'static, Result<Item, FetchError>> + Clone + Send + Sync + 'static {
    move || {
      let calls = calls.clone();
      let value = value.clone();
      async move {
        calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(value)
      }
      .boxed()
    }
  }

  #[tokio::test]
  async fn test_query_transitions_loading_to_success() {
    let client = QueryClient::<Item>::new(ClientConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));

    let mut sub = client.query(key(), counting(calls.clone(), item("Alice")), options());
    let loading = sub.state();
    assert!(loading.is_loading());
    assert!(loading.is_fetching);

    let settled = sub.settled().await;
    assert!(settled.is_success());
    assert_eq!(settled.data(), Some(&item("Alice")));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_concurrent_queries_share_one_fetch() {
    let client = QueryClient::<Item>::new(ClientConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let fetcher = counting(calls.clone(), item("Alice"));

    let (a, b) = tokio::join!(
      client.fetch_query(key(), fetcher.clone(), options()),
      client.fetch_query(key(), fetcher.clone(), options()),
    );

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(a.data(), Some(&item("Alice")));
    assert_eq!(a, b);

    let mut first = client.query(key(), fetcher.clone(), options());
    let mut second = client.query(key(), fetcher, options());
    first.settled().await;
    second.settled().await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_fresh_data_is_not_refetched() {
    let client = QueryClient::<Item>::new(ClientConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let fresh = options().with_stale_time(Duration::from_secs(60));

    client.fetch_query(key(), counting(calls.clone(), item("Alice")), fresh.clone()).await;
    let state = client.fetch_query(key(), counting(calls.clone(), item("Bob")), fresh).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(state.data(), Some(&item("Alice")));
  }

  #[tokio::test]
  async fn test_stale_data_stays_visible_while_refetching() {
    let client = QueryClient::<Item>::new(ClientConfig::default());
    client.set_query_data(&key(), item("Alice"));

    let calls = Arc::new(AtomicUsize::new(0));
    let mut sub = client.query(key(), counting(calls, item("Bob")), options());

    let revalidating = sub.state();
    assert!(revalidating.is_success());
    assert!(revalidating.is_fetching);
    assert_eq!(revalidating.data(), Some(&item("Alice")));

    assert_eq!(sub.settled().await.data(), Some(&item("Bob")));
  }

  #[tokio::test]
  async fn test_failures_retry_then_surface_as_error() {
    let client = QueryClient::<Item>::new(ClientConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let fetcher = move || {
      let counter = counter.clone();
      async move {
        counter.fetch_add(1, Ordering::SeqCst);
        Err::<Item, _>(FetchError::with_status(500, "500 Internal Server Error"))
      }
    };

    let state = client.fetch_query(key(), fetcher, options().with_retry(2)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(state.is_error());
    assert!(state.error().unwrap().contains("500 Internal Server Error"));
  }

  #[tokio::test]
  async fn test_retry_recovers() {
    let client = QueryClient::<Item>::new(ClientConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let fetcher = move || {
      let attempt = counter.fetch_add(1, Ordering::SeqCst);
      async move {
        if attempt < 2 {
          Err(FetchError::new("timeout"))
        } else {
          Ok(item("Alice"))
        }
      }
    };

    let state = client.fetch_query(key(), fetcher, options().with_retry(3)).await;
    assert!(state.is_success());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn test_cancel_discards_result() {
    let client = QueryClient::<Item>::new(ClientConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let sub = client.query(key(), counting(calls, item("Alice")), options());

    assert_eq!(client.cancel_queries(&QueryKey::new(["item"])), 1);
    assert_eq!(sub.state().status, QueryStatus::Idle);
    assert!(!sub.state().is_fetching);

    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(client.get_query_data(&key()), None);
  }

  #[tokio::test]
  async fn test_cancel_leaves_other_keys_alone() {
    let client = QueryClient::<Item>::new(ClientConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let other = QueryKey::new(["item", "2"]);
    let _a = client.query(key(), counting(calls.clone(), item("Alice")), options());
    let mut b = client.query(other.clone(), counting(calls, item("Bob")), options());

    assert_eq!(client.cancel_queries(&key()), 1);
    assert_eq!(b.settled().await.data(), Some(&item("Bob")));
  }

  #[tokio::test]
  async fn test_offline_query_does_not_fetch() {
    let client = QueryClient::<Item>::new(ClientConfig::default());
    client.connectivity().set_online(false);
    let calls = Arc::new(AtomicUsize::new(0));

    let state = client.fetch_query(key(), counting(calls.clone(), item("Alice")), options()).await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(state.status, QueryStatus::Idle);
  }

  #[tokio::test]
  async fn test_invalidate_refetches_active_observers() {
    let client = QueryClient::<Item>::new(ClientConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let fresh = options().with_stale_time(Duration::from_secs(60));
    let mut sub = client.query(key(), counting(calls.clone(), item("Alice")), fresh);
    sub.settled().await;

    let unobserved = QueryKey::new(["item", "2"]);
    client.set_query_data(&unobserved, item("Zed"));

    client.invalidate_queries(&QueryKey::new(["item"])).await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(!client.query_state(&key()).is_invalidated);
    assert!(client.query_state(&unobserved).is_invalidated);
  }

  #[tokio::test]
  async fn test_unobserved_entries_are_evicted() {
    let config = ClientConfig {
      cache_time: Duration::from_millis(10),
      ..ClientConfig::default()
    };
    let client = QueryClient::<Item>::new(config);
    let calls = Arc::new(AtomicUsize::new(0));
    let short = options().with_cache_time(Duration::from_millis(10));

    let mut sub = client.query(key(), counting(calls, item("Alice")), short);
    sub.settled().await;

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(client.get_query_data(&key()).is_some(), "observed entries stay");

    drop(sub);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(client.get_query_data(&key()).is_none());
  }

  #[tokio::test]
  async fn test_focus_refetches_stale_queries() {
    let client = QueryClient::<Item>::new(ClientConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let mut sub = client.query(key(), counting(calls.clone(), item("Alice")), options());
    sub.settled().await;

    client.set_focused(false).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    client.set_focused(true).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_persist_and_restore_round_trip() {
    let storage = Arc::new(MemoryStorage::new());
    let config = ClientConfig {
      persist_throttle: Duration::from_millis(5),
      ..ClientConfig::default()
    };

    let first = QueryClient::<Item>::builder()
      .with_config(config.clone())
      .with_persister(Persister::new(storage.clone()).with_buster("2"))
      .build();
    assert!(matches!(first.restore().await, RestoreOutcome::Empty));
    first.set_query_data(&key(), item("Alice"));
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert!(storage.get_string(crate::cache::DEFAULT_PERSIST_KEY).unwrap().is_some());
    first.shutdown().await;

    let second = QueryClient::<Item>::builder()
      .with_config(config)
      .with_persister(Persister::new(storage).with_buster("2"))
      .build();
    assert!(matches!(
      second.restore().await,
      RestoreOutcome::Restored { entries: 1, .. }
    ));
    assert_eq!(second.entries(), first.entries());
  }

  #[tokio::test]
  async fn test_restore_with_other_buster_starts_empty() {
    let storage = Arc::new(MemoryStorage::new());

    let first = QueryClient::<Item>::builder()
      .with_persister(Persister::new(storage.clone()).with_buster("1"))
      .build();
    first.restore().await;
    first.set_query_data(&key(), item("Alice"));
    first.persist_now().await.unwrap();

    let second = QueryClient::<Item>::builder()
      .with_persister(Persister::new(storage).with_buster("2"))
      .build();
    assert!(matches!(second.restore().await, RestoreOutcome::Discarded));
    assert!(second.entries().is_empty());
  }

  #[tokio::test]
  async fn test_nothing_is_written_before_restore() {
    let storage = Arc::new(MemoryStorage::new());
    storage.set_string(crate::cache::DEFAULT_PERSIST_KEY, "precious").unwrap();

    let client = QueryClient::<Item>::builder()
      .with_persister(Persister::new(storage.clone()))
      .build();
    client.set_query_data(&key(), item("Alice"));
    client.persist_now().await.unwrap();

    assert_eq!(
      storage.get_string(crate::cache::DEFAULT_PERSIST_KEY).unwrap().as_deref(),
      Some("precious")
    );
  }

  struct BrokenStorage;

  impl KeyValueStorage for BrokenStorage {
    fn get_string(&self, _key: &str) -> Result<Option<String>, CacheError> {
      Err(CacheError::PersistenceFailure("disk unplugged".into()))
    }

    fn set_string(&self, _key: &str, _value: &str) -> Result<(), CacheError> {
      Err(CacheError::PersistenceFailure("disk unplugged".into()))
    }

    fn remove(&self, _key: &str) -> Result<(), CacheError> {
      Err(CacheError::PersistenceFailure("disk unplugged".into()))
    }

    fn clear(&self) -> Result<(), CacheError> {
      Err(CacheError::PersistenceFailure("disk unplugged".into()))
    }
  }

  #[tokio::test]
  async fn test_storage_failures_never_block_the_cache() {
    let config = ClientConfig {
      persist_throttle: Duration::from_millis(1),
      ..ClientConfig::default()
    };
    let client = QueryClient::<Item>::builder()
      .with_config(config)
      .with_persister(Persister::new(Arc::new(BrokenStorage)))
      .build();

    assert!(matches!(client.restore().await, RestoreOutcome::Failed(_)));
    client.set_query_data(&key(), item("Alice"));
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(client.get_query_data(&key()), Some(item("Alice")));
    assert!(client.persist_now().await.is_err());
  }

  #[tokio::test]
  async fn test_clear_resets_state() {
    let client = QueryClient::<Item>::new(ClientConfig::default());
    client.set_query_data(&key(), item("Alice"));
    client.clear();
    assert!(client.entries().is_empty());
    assert_eq!(client.remove_queries(&QueryKey::default()), 0);
  }
}
