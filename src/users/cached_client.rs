//! Cached user client that pairs a `UserBackend` with a `QueryClient`.

use crate::cache::{mutate_fn, MutationOptions, MutationResult, QueryClient};
use crate::error::CacheError;
use crate::query::{QueryOptions, QueryState, Subscription};

use super::cache::UserKeys;
use super::client::UserBackend;
use super::types::User;

/// User client with transparent caching support.
///
/// Reads go through the query cache; writes are optimistic and survive
/// being made offline, including across restarts.
#[derive(Clone)]
pub struct CachedUserClient<B: UserBackend> {
  backend: B,
  cache: QueryClient<User>,
}

impl<B: UserBackend> CachedUserClient<B> {
  /// Wrap `cache` and register the user write as the mutation default for
  /// every user key, so restored paused mutations can be replayed.
  pub fn new(backend: B, cache: QueryClient<User>) -> Self {
    let writer = backend.clone();
    cache.set_mutation_defaults(
      UserKeys::all(),
      mutate_fn(move |user: User| {
        let backend = writer.clone();
        async move { backend.put_user(&user).await }
      }),
    );
    Self { backend, cache }
  }

  pub fn cache(&self) -> &QueryClient<User> {
    &self.cache
  }

  fn options(&self) -> QueryOptions {
    self.cache.default_query_options()
  }

  /// Subscribe to a user's record.
  pub fn user(&self, id: &str) -> Subscription<User> {
    let backend = self.backend.clone();
    let id_owned = id.to_string();
    self.cache.query(
      UserKeys::detail(id),
      move || {
        let backend = backend.clone();
        let id = id_owned.clone();
        async move { backend.get_user(&id).await }
      },
      self.options(),
    )
  }

  /// Resolve a user's record once, from cache when fresh.
  pub async fn get_user(&self, id: &str) -> QueryState<User> {
    let backend = self.backend.clone();
    let id_owned = id.to_string();
    self
      .cache
      .fetch_query(
        UserKeys::detail(id),
        move || {
          let backend = backend.clone();
          let id = id_owned.clone();
          async move { backend.get_user(&id).await }
        },
        self.options(),
      )
      .await
  }

  /// Write `user`, optimistically updating the cached record.
  pub async fn update_user(&self, user: User) -> Result<MutationResult<User>, CacheError> {
    self
      .cache
      .mutate(UserKeys::detail(&user.id), user, MutationOptions::new())
      .await
  }
}
