use serde::{Deserialize, Deserializer, Serialize};

/// A user record. Other fields served by the users API are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
  #[serde(deserialize_with = "deserialize_id")]
  pub id: String,
  pub name: String,
}

impl User {
  pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
    Self {
      id: id.into(),
      name: name.into(),
    }
  }
}

/// The API serves numeric ids; keys and payloads use strings.
fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
  D: Deserializer<'de>,
{
  #[derive(Deserialize)]
  #[serde(untagged)]
  enum Id {
    Num(u64),
    Str(String),
  }

  Ok(match Id::deserialize(deserializer)? {
    Id::Num(n) => n.to_string(),
    Id::Str(s) => s,
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_numeric_id_becomes_string_and_extra_fields_are_dropped() {
    let user: User =
      serde_json::from_str(r#"{"id": 1, "name": "Leanne Graham", "email": "Sincere@april.biz"}"#).unwrap();
    assert_eq!(user, User::new("1", "Leanne Graham"));
  }

  #[test]
  fn test_serializes_only_id_and_name() {
    let json = serde_json::to_value(User::new("1", "Bob")).unwrap();
    assert_eq!(json, serde_json::json!({"id": "1", "name": "Bob"}));
  }
}
