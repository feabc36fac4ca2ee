//! Caching implementations for user types.

use crate::cache::{Cacheable, QueryKey};

use super::types::User;

impl Cacheable for User {
  fn cache_key(&self) -> String {
    self.id.clone()
  }

  fn entity_type() -> &'static str {
    "user"
  }
}

/// Query keys for user data.
///
/// Every user key starts with `["user"]`, so invalidating [`UserKeys::all`]
/// reaches all of them.
pub struct UserKeys;

impl UserKeys {
  pub fn all() -> QueryKey {
    QueryKey::new(["user"])
  }

  /// Key of a single user's record.
  pub fn detail(id: &str) -> QueryKey {
    Self::all().child("use-user-query").child(id)
  }
}
