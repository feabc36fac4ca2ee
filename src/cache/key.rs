//! Structured query keys.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A single primitive token in a [`QueryKey`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPart {
  Bool(bool),
  Int(i64),
  Str(String),
}

impl From<&str> for KeyPart {
  fn from(s: &str) -> Self {
    KeyPart::Str(s.to_string())
  }
}

impl From<String> for KeyPart {
  fn from(s: String) -> Self {
    KeyPart::Str(s)
  }
}

impl From<&String> for KeyPart {
  fn from(s: &String) -> Self {
    KeyPart::Str(s.clone())
  }
}

impl From<i64> for KeyPart {
  fn from(n: i64) -> Self {
    KeyPart::Int(n)
  }
}

impl From<u32> for KeyPart {
  fn from(n: u32) -> Self {
    KeyPart::Int(i64::from(n))
  }
}

impl From<bool> for KeyPart {
  fn from(b: bool) -> Self {
    KeyPart::Bool(b)
  }
}

impl fmt::Display for KeyPart {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      KeyPart::Bool(b) => write!(f, "{}", b),
      KeyPart::Int(n) => write!(f, "{}", n),
      KeyPart::Str(s) => write!(f, "{:?}", s),
    }
  }
}

/// Ordered token sequence identifying a cached query or a mutation target.
///
/// Keys compare structurally and by prefix, so `["user"]` addresses every
/// key that starts with `"user"`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKey(Vec<KeyPart>);

impl QueryKey {
  pub fn new<I, P>(parts: I) -> Self
  where
    I: IntoIterator<Item = P>,
    P: Into<KeyPart>,
  {
    Self(parts.into_iter().map(Into::into).collect())
  }

  /// Extend this key with one more token.
  pub fn child(&self, part: impl Into<KeyPart>) -> Self {
    let mut parts = self.0.clone();
    parts.push(part.into());
    Self(parts)
  }

  pub fn parts(&self) -> &[KeyPart] {
    &self.0
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  /// Whether `prefix` is a leading subsequence of this key.
  ///
  /// The empty key is a prefix of every key.
  pub fn starts_with(&self, prefix: &QueryKey) -> bool {
    self.0.starts_with(&prefix.0)
  }

  /// The first token, used as the invalidation scope of mutations.
  pub fn domain(&self) -> QueryKey {
    Self(self.0.iter().take(1).cloned().collect())
  }
}

impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "[")?;
    for (i, part) in self.0.iter().enumerate() {
      if i > 0 {
        write!(f, ",")?;
      }
      write!(f, "{}", part)?;
    }
    write!(f, "]")
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_prefix_matching() {
    let key = QueryKey::new(["user", "use-user-query", "1"]);

    assert!(key.starts_with(&QueryKey::new(["user"])));
    assert!(key.starts_with(&QueryKey::new(["user", "use-user-query"])));
    assert!(key.starts_with(&key));
    assert!(key.starts_with(&QueryKey::default()));
    assert!(!key.starts_with(&QueryKey::new(["post"])));
    assert!(!QueryKey::new(["user"]).starts_with(&key));
  }

  #[test]
  fn test_domain() {
    let key = QueryKey::new(["user", "use-user-query", "1"]);
    assert_eq!(key.domain(), QueryKey::new(["user"]));
    assert!(QueryKey::default().domain().is_empty());
  }

  #[test]
  fn test_mixed_tokens_are_distinct() {
    let text = QueryKey::new(["user"]).child("1");
    let number = QueryKey::new(["user"]).child(1i64);
    assert_ne!(text, number);
    assert_eq!(text.to_string(), r#"["user","1"]"#);
    assert_eq!(number.to_string(), r#"["user",1]"#);
  }

  #[test]
  fn test_serializes_as_plain_array() {
    let key = QueryKey::new(["user"]).child(7i64).child(true);
    let json = serde_json::to_string(&key).unwrap();
    assert_eq!(json, r#"["user",7,true]"#);

    let parsed: QueryKey = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, key);
  }
}
