use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

/// Opaque identity of a project, haiku, prompt or image.
///
/// The server uses integer ids for some tables and UUID strings for others.
/// Both are accepted on the wire and stored as text, so the client never
/// relies on the shape of an id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct EntityId(String);

/// Projects share the id space of every other entity.
pub type ProjectId = EntityId;

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for EntityId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<u64> for EntityId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

impl<'de> Deserialize<'de> for EntityId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum WireId {
            Number(serde_json::Number),
            Text(String),
        }

        match WireId::deserialize(deserializer)? {
            WireId::Number(n) => Ok(Self(n.to_string())),
            WireId::Text(s) if s.trim().is_empty() => Err(D::Error::custom("empty entity id")),
            WireId::Text(s) => Ok(Self(s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_and_strings_become_the_same_kind_of_id() {
        let from_number: EntityId = serde_json::from_str("42").unwrap();
        let from_text: EntityId = serde_json::from_str("\"42\"").unwrap();
        assert_eq!(from_number, from_text);
        assert_eq!(from_number.as_str(), "42");
    }

    #[test]
    fn uuid_strings_are_kept_verbatim() {
        let id: EntityId =
            serde_json::from_str("\"5f0c6a52-0a8e-4d3c-9a57-0d5b8a4f8e11\"").unwrap();
        assert_eq!(id.to_string(), "5f0c6a52-0a8e-4d3c-9a57-0d5b8a4f8e11");
    }

    #[test]
    fn rejects_blank_and_structured_ids() {
        assert!(serde_json::from_str::<EntityId>("\"  \"").is_err());
        assert!(serde_json::from_str::<EntityId>("{}").is_err());
        assert!(serde_json::from_str::<EntityId>("null").is_err());
    }
}
