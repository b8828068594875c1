//! Key change events published by the origin side and consumed by every node.
//!
//! Delivery is at-least-once, so consumers must treat every event as
//! idempotent: replaying a `Created` or `Deleted` event has to leave the node
//! in the same state as handling it once.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use time::OffsetDateTime;

use crate::entities::Key;
use crate::error::CoreError;

/// Type of key change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyEventType {
    /// Key was created
    Created,
    /// Key was updated (rotation, limit change, ...)
    Updated,
    /// Key was deleted
    Deleted,
}

impl KeyEventType {
    /// Returns the string representation of the event type.
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyEventType::Created => "created",
            KeyEventType::Updated => "updated",
            KeyEventType::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for KeyEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for KeyEventType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(KeyEventType::Created),
            "updated" => Ok(KeyEventType::Updated),
            "deleted" => Ok(KeyEventType::Deleted),
            other => Err(CoreError::invalid_event_type(other)),
        }
    }
}

/// The identifying part of a key carried inside an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRef {
    pub id: String,
    pub hash: String,
    #[serde(default)]
    pub key_auth_id: Option<String>,
}

impl From<&Key> for KeyRef {
    fn from(key: &Key) -> Self {
        Self {
            id: key.id.clone(),
            hash: key.hash.clone(),
            key_auth_id: Some(key.key_auth_id.clone()),
        }
    }
}

/// Event representing a change to a key at the origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyEvent {
    pub event_type: KeyEventType,
    pub key: KeyRef,
    /// When the change was published
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl KeyEvent {
    /// Create a new key event.
    pub fn new(event_type: KeyEventType, key: KeyRef) -> Self {
        Self {
            event_type,
            key,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    /// Create a "created" event for a key.
    pub fn created(key: &Key) -> Self {
        Self::new(KeyEventType::Created, KeyRef::from(key))
    }

    /// Create an "updated" event for a key.
    pub fn updated(key: &Key) -> Self {
        Self::new(KeyEventType::Updated, KeyRef::from(key))
    }

    /// Create a "deleted" event from the key's id and hash.
    pub fn deleted(id: impl Into<String>, hash: impl Into<String>) -> Self {
        Self::new(
            KeyEventType::Deleted,
            KeyRef {
                id: id.into(),
                hash: hash.into(),
                key_auth_id: None,
            },
        )
    }

    pub fn is_deletion(&self) -> bool {
        self.event_type == KeyEventType::Deleted
    }

    /// Encode for transport on a message bus.
    pub fn encode(&self) -> Result<String, CoreError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode an event received from a message bus.
    pub fn decode(payload: &str) -> Result<Self, CoreError> {
        Ok(serde_json::from_str(payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_parse() {
        assert_eq!("created".parse::<KeyEventType>().unwrap(), KeyEventType::Created);
        assert_eq!("deleted".parse::<KeyEventType>().unwrap(), KeyEventType::Deleted);

        let err = "renamed".parse::<KeyEventType>().unwrap_err();
        assert_eq!(err.to_string(), "Invalid key event type: renamed");
    }

    #[test]
    fn test_event_from_key_carries_auth_group() {
        let key = Key::new("key_1", "hash_1", "ka_1");
        let event = KeyEvent::updated(&key);

        assert_eq!(event.event_type, KeyEventType::Updated);
        assert_eq!(event.key.id, "key_1");
        assert_eq!(event.key.hash, "hash_1");
        assert_eq!(event.key.key_auth_id.as_deref(), Some("ka_1"));
        assert!(!event.is_deletion());
    }

    #[test]
    fn test_event_decode_wire_payload() {
        let payload = r#"{
            "event_type": "deleted",
            "key": { "id": "key_9", "hash": "h9" },
            "timestamp": "2024-05-01T12:00:00Z"
        }"#;

        let event = KeyEvent::decode(payload).unwrap();
        assert!(event.is_deletion());
        assert_eq!(event.key.hash, "h9");
        assert!(event.key.key_auth_id.is_none());

        assert!(KeyEvent::decode("{\"event_type\":\"deleted\"}").is_err());
    }
}
