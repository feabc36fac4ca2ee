//! Core traits for cached entities.

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

/// Trait for entities that can be cached.
///
/// Implementors provide an identity and a type name; `merge` decides how an
/// optimistic payload is laid over the currently cached value.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  /// Unique identifier for this entity (e.g., user id)
  fn cache_key(&self) -> String;

  /// Entity type name for logging and storage organization (e.g., "user")
  fn entity_type() -> &'static str;

  /// Lay `patch` over `self`, field by field.
  ///
  /// The default performs a shallow merge of the JSON representations: every
  /// top-level field present in `patch` replaces the one in `self`. When either
  /// side is not a JSON object the patch wins outright.
  fn merge(&self, patch: &Self) -> Self {
    let (Ok(Value::Object(mut base)), Ok(Value::Object(overlay))) =
      (serde_json::to_value(self), serde_json::to_value(patch))
    else {
      return patch.clone();
    };

    base.extend(overlay);
    serde_json::from_value(Value::Object(base)).unwrap_or_else(|_| patch.clone())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde::Deserialize;

  #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
  struct Profile {
    id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bio: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    city: Option<String>,
  }

  impl Cacheable for Profile {
    fn cache_key(&self) -> String {
      self.id.clone()
    }

    fn entity_type() -> &'static str {
      "profile"
    }
  }

  #[test]
  fn test_merge_keeps_fields_missing_from_patch() {
    let current = Profile {
      id: "1".into(),
      bio: Some("hello".into()),
      city: Some("Oslo".into()),
    };
    let patch = Profile {
      id: "1".into(),
      bio: None,
      city: Some("Bergen".into()),
    };

    let merged = current.merge(&patch);
    assert_eq!(merged.bio.as_deref(), Some("hello"));
    assert_eq!(merged.city.as_deref(), Some("Bergen"));
  }
}
