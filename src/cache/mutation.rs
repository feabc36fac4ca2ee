//! Optimistic mutations, rollback, and offline replay.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};
use ulid::Ulid;

use super::client::QueryClient;
use super::key::QueryKey;
use super::traits::Cacheable;
use crate::error::{CacheError, FetchError};

/// A write against the external API. Returns the server's view of the entity.
pub type MutateFn<T> = Arc<dyn Fn(T) -> BoxFuture<'static, Result<T, FetchError>> + Send + Sync>;

/// Box a closure as a [`MutateFn`].
pub fn mutate_fn<T, F, Fut>(f: F) -> MutateFn<T>
where
  F: Fn(T) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
{
  Arc::new(move |payload| f(payload).boxed())
}

/// Time-ordered identifier of a mutation, stable across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MutationId(Ulid);

impl MutationId {
  fn new() -> Self {
    Self(Ulid::new())
  }
}

impl fmt::Display for MutationId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// A mutation that has started but not settled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMutation<T> {
  pub id: MutationId,
  /// The cache key the mutation writes to
  pub mutation_key: QueryKey,
  pub payload: T,
  /// Entry data before the optimistic write; `None` if nothing was cached
  pub rollback_snapshot: Option<T>,
  pub submitted_at: DateTime<Utc>,
}

impl<T> PendingMutation<T> {
  pub fn new(mutation_key: QueryKey, payload: T, rollback_snapshot: Option<T>) -> Self {
    Self {
      id: MutationId::new(),
      mutation_key,
      payload,
      rollback_snapshot,
      submitted_at: Utc::now(),
    }
  }
}

/// What a settled mutation passes to `on_settled`.
#[derive(Debug, Clone)]
pub struct MutationOutcome<T> {
  pub id: MutationId,
  pub key: QueryKey,
  pub payload: T,
  pub result: Result<T, CacheError>,
  /// The rollback token: the value restored on failure
  pub rollback: Option<T>,
}

type OnMutate<T> = Arc<dyn Fn(&T) + Send + Sync>;
type OnSettled<T> = Arc<dyn Fn(&MutationOutcome<T>) + Send + Sync>;

/// Callbacks around a mutation's lifecycle.
pub struct MutationHooks<T> {
  on_mutate: Option<OnMutate<T>>,
  on_settled: Option<OnSettled<T>>,
}

impl<T> Default for MutationHooks<T> {
  fn default() -> Self {
    Self {
      on_mutate: None,
      on_settled: None,
    }
  }
}

impl<T> Clone for MutationHooks<T> {
  fn clone(&self) -> Self {
    Self {
      on_mutate: self.on_mutate.clone(),
      on_settled: self.on_settled.clone(),
    }
  }
}

/// Per-call mutation settings.
pub struct MutationOptions<T> {
  mutate_fn: Option<MutateFn<T>>,
  hooks: MutationHooks<T>,
}

impl<T> Default for MutationOptions<T> {
  fn default() -> Self {
    Self {
      mutate_fn: None,
      hooks: MutationHooks::default(),
    }
  }
}

impl<T: Cacheable> MutationOptions<T> {
  pub fn new() -> Self {
    Self::default()
  }

  /// The write to perform. Without one, the client's mutation defaults for
  /// the key are used.
  pub fn with_mutate_fn<F, Fut>(mut self, f: F) -> Self
  where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
  {
    self.mutate_fn = Some(mutate_fn(f));
    self
  }

  /// Runs with the payload before the optimistic write.
  pub fn on_mutate(mut self, f: impl Fn(&T) + Send + Sync + 'static) -> Self {
    self.hooks.on_mutate = Some(Arc::new(f));
    self
  }

  /// Runs once the mutation has succeeded or been rolled back.
  pub fn on_settled(mut self, f: impl Fn(&MutationOutcome<T>) + Send + Sync + 'static) -> Self {
    self.hooks.on_settled = Some(Arc::new(f));
    self
  }
}

/// How `mutate` ended.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationResult<T> {
  /// Sent and accepted; carries the server's response
  Committed(T),
  /// Queued for replay once online
  Paused(MutationId),
}

/// Result of replaying paused mutations.
#[derive(Debug, Default)]
pub struct ResumeReport {
  pub committed: Vec<MutationId>,
  /// One entry per key whose replay was halted
  pub conflicts: Vec<CacheError>,
  /// Paused mutations left in the queue
  pub remaining: usize,
}

/// A queued mutation plus the in-process parts that are not persisted.
pub(crate) struct PausedMutation<T> {
  pub(crate) record: PendingMutation<T>,
  mutate_fn: Option<MutateFn<T>>,
  hooks: MutationHooks<T>,
}

impl<T> PausedMutation<T> {
  /// A mutation read back from storage. Its write function comes from the
  /// mutation defaults.
  pub(crate) fn restored(record: PendingMutation<T>) -> Self {
    Self {
      record,
      mutate_fn: None,
      hooks: MutationHooks::default(),
    }
  }
}

impl<T: Cacheable> QueryClient<T> {
  /// Register the write used for mutations under `prefix` that were not
  /// given one, notably mutations restored after a restart. The first
  /// registered matching prefix wins.
  pub fn set_mutation_defaults(&self, prefix: QueryKey, mutate_fn: MutateFn<T>) {
    let mut state = self.state();
    state.mutation_defaults.retain(|(p, _)| p != &prefix);
    state.mutation_defaults.push((prefix, mutate_fn));
  }

  fn mutation_default(&self, key: &QueryKey) -> Option<MutateFn<T>> {
    self
      .state()
      .mutation_defaults
      .iter()
      .find(|(prefix, _)| key.starts_with(prefix))
      .map(|(_, f)| Arc::clone(f))
  }

  /// Optimistically write `payload` to `key` and send it.
  ///
  /// The cached value changes immediately. On success the optimistic value
  /// is kept and the key's domain is invalidated; on failure the previous
  /// value is restored and the error returned. While offline, or while
  /// earlier paused mutations for the same key are queued, the mutation is
  /// paused and replayed later in submission order.
  pub async fn mutate(
    &self,
    key: QueryKey,
    payload: T,
    options: MutationOptions<T>,
  ) -> Result<MutationResult<T>, CacheError> {
    let MutationOptions { mutate_fn, hooks } = options;
    let resolved = mutate_fn.clone().or_else(|| self.mutation_default(&key));

    if resolved.is_none() && self.is_online() {
      return Err(CacheError::MissingMutationFn(key));
    }

    if let Some(on_mutate) = &hooks.on_mutate {
      on_mutate(&payload);
    }
    let record = self.apply_optimistic(&key, payload);

    let pause = {
      let state = self.state();
      !self.is_online() || state.has_paused_for(&key) || state.halted.contains(&key)
    };
    let resolved = match resolved {
      Some(f) if !pause => f,
      _ => return Ok(MutationResult::Paused(self.pause(record, mutate_fn, hooks))),
    };

    self
      .execute(&record, resolved, &hooks)
      .await
      .map(MutationResult::Committed)
  }

  /// Cancel, snapshot and write in one critical section.
  fn apply_optimistic(&self, key: &QueryKey, payload: T) -> PendingMutation<T> {
    let mut guard = self.state();
    let state = &mut *guard;

    state.cancel(key);
    let snapshot = state.store.get(key).and_then(|e| e.data.clone());
    let optimistic = match &snapshot {
      Some(current) => current.merge(&payload),
      None => payload.clone(),
    };
    state.store.set(key, optimistic);
    self.touched(state, key);

    PendingMutation::new(key.clone(), payload, snapshot)
  }

  fn pause(&self, record: PendingMutation<T>, mutate_fn: Option<MutateFn<T>>, hooks: MutationHooks<T>) -> MutationId {
    let id = record.id;
    info!(key = %record.mutation_key, %id, "pausing mutation until online");

    let resume_now = {
      let mut state = self.state();
      state.paused.push_back(PausedMutation {
        record,
        mutate_fn,
        hooks,
      });
      state.hydrated && self.is_online()
    };
    self.schedule_persist();

    // Queued behind an earlier mutation for the same key while online
    if resume_now {
      if let Ok(handle) = tokio::runtime::Handle::try_current() {
        let client = self.clone();
        handle.spawn(async move {
          client.resume_paused_mutations().await;
        });
      }
    }
    id
  }

  fn exec_lock(&self, key: &QueryKey) -> Arc<tokio::sync::Mutex<()>> {
    let mut locks = self
      .inner
      .exec_locks
      .lock()
      .unwrap_or_else(std::sync::PoisonError::into_inner);
    Arc::clone(locks.entry(key.clone()).or_default())
  }

  fn release_exec_lock(&self, key: &QueryKey) {
    let mut locks = self
      .inner
      .exec_locks
      .lock()
      .unwrap_or_else(std::sync::PoisonError::into_inner);
    // Only the map holds it: nobody is waiting
    if locks.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
      locks.remove(key);
    }
  }

  /// Send one mutation and reconcile the cache with the result.
  async fn execute(
    &self,
    record: &PendingMutation<T>,
    mutate_fn: MutateFn<T>,
    hooks: &MutationHooks<T>,
  ) -> Result<T, CacheError> {
    let key = &record.mutation_key;
    let lock = self.exec_lock(key);
    let guard = lock.lock().await;

    // A read that started after the optimistic write must not clobber it
    self.state().cancel(key);

    let result = mutate_fn(record.payload.clone())
      .await
      .map_err(|source| CacheError::FetchFailure {
        key: key.clone(),
        source,
      });

    match &result {
      Ok(_) => info!(%key, id = %record.id, "mutation committed"),
      Err(err) => {
        warn!(id = %record.id, error = %err, "mutation failed, rolling back");
        self.rollback(record);
      }
    }

    drop(guard);
    drop(lock);
    self.release_exec_lock(key);

    self.invalidate_queries(&key.domain()).await;

    if let Some(on_settled) = &hooks.on_settled {
      on_settled(&MutationOutcome {
        id: record.id,
        key: key.clone(),
        payload: record.payload.clone(),
        result: result.clone(),
        rollback: record.rollback_snapshot.clone(),
      });
    }
    result
  }

  fn rollback(&self, record: &PendingMutation<T>) {
    let mut guard = self.state();
    let state = &mut *guard;
    let key = &record.mutation_key;

    state.cancel(key);
    match &record.rollback_snapshot {
      Some(previous) => {
        state.store.set(key, previous.clone());
      }
      None => {
        state.store.delete(key);
      }
    }
    self.touched(state, key);
  }

  /// Replay paused mutations in submission order.
  ///
  /// Stops early when connectivity drops. A failed replay rolls that
  /// mutation back and halts automatic replay for its key, so later writes
  /// to the same entity are not sent out of order; see [`Self::retry_halted`].
  pub async fn resume_paused_mutations(&self) -> ResumeReport {
    let _resume = self.inner.resume_lock.lock().await;
    let mut report = ResumeReport::default();
    let mut blocked: HashSet<QueryKey> = self.state().halted.clone();

    loop {
      if !self.is_online() {
        debug!("offline, stopping replay");
        break;
      }

      let next = {
        let state = self.state();
        state
          .paused
          .iter()
          .find(|p| !blocked.contains(&p.record.mutation_key))
          .map(|p| (p.record.clone(), p.mutate_fn.clone(), p.hooks.clone()))
      };
      let Some((record, own_fn, hooks)) = next else {
        break;
      };
      let key = record.mutation_key.clone();

      let Some(mutate_fn) = own_fn.or_else(|| self.mutation_default(&key)) else {
        warn!(%key, id = %record.id, "no mutation function registered, halting replay");
        self.state().halted.insert(key.clone());
        blocked.insert(key.clone());
        report.conflicts.push(CacheError::MissingMutationFn(key));
        continue;
      };

      debug!(%key, id = %record.id, "replaying paused mutation");
      let result = self.execute(&record, mutate_fn, &hooks).await;
      self.state().paused.retain(|p| p.record.id != record.id);
      self.schedule_persist();

      match result {
        Ok(_) => report.committed.push(record.id),
        Err(err) => {
          let source = match err {
            CacheError::FetchFailure { source, .. } => source,
            other => FetchError::new(other.to_string()),
          };
          let conflict = CacheError::MutationConflict {
            id: record.id,
            key: key.clone(),
            source,
          };
          warn!(error = %conflict, "halting replay for key");
          self.state().halted.insert(key.clone());
          blocked.insert(key);
          report.conflicts.push(conflict);
        }
      }
    }

    report.remaining = self.state().paused.len();
    report
  }

  /// Lift the halt on `key` and replay its paused mutations.
  pub async fn retry_halted(&self, key: &QueryKey) -> ResumeReport {
    self.state().halted.remove(key);
    self.resume_paused_mutations().await
  }

  /// Drop paused mutations under `prefix` without sending them. Their
  /// optimistic values stay cached but are invalidated.
  pub async fn discard_paused(&self, prefix: &QueryKey) -> usize {
    let discarded = {
      let mut state = self.state();
      let before = state.paused.len();
      state
        .paused
        .retain(|p| !p.record.mutation_key.starts_with(prefix));
      state.halted.retain(|key| !key.starts_with(prefix));
      before - state.paused.len()
    };

    if discarded > 0 {
      info!(%prefix, discarded, "discarded paused mutations");
      self.schedule_persist();
      self.invalidate_queries(prefix).await;
    }
    discarded
  }

  /// Copies of the queued mutations, oldest first.
  pub fn paused_mutations(&self) -> Vec<PendingMutation<T>> {
    self.state().paused.iter().map(|p| p.record.clone()).collect()
  }

  /// Keys whose replay is halted after a conflict.
  pub fn halted_keys(&self) -> Vec<QueryKey> {
    let mut keys: Vec<QueryKey> = self.state().halted.iter().cloned().collect();
    keys.sort();
    keys
  }
}
