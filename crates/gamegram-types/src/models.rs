use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type RoomId = i64;
pub type MessageId = i64;
pub type ReactionId = i64;

/// Locally generated identity for a message the server has not assigned an id to yet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TempId(String);

impl TempId {
    pub fn generate() -> Self {
        Self(format!("temp-{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TempId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for TempId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of a message inside the local store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum MessageKey {
    Server(MessageId),
    Temp(TempId),
}

impl MessageKey {
    pub fn server_id(&self) -> Option<MessageId> {
        match self {
            Self::Server(id) => Some(*id),
            Self::Temp(_) => None,
        }
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server(id) => write!(f, "{}", id),
            Self::Temp(temp) => write!(f, "{}", temp),
        }
    }
}

/// Delivery state of a message. Only locally authored messages are ever
/// anything other than `Sent`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Delivery {
    Pending,
    Failed { reason: String },
    Sent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub key: MessageKey,
    pub room_id: RoomId,
    pub username: String,
    pub text: String,
    pub is_authenticated: bool,
    pub country: Option<String>,
    pub created_at: DateTime<Utc>,
    pub delivery: Delivery,
    pub reactions: Vec<Reaction>,
}

impl Message {
    pub fn server_id(&self) -> Option<MessageId> {
        self.key.server_id()
    }

    /// True until the server-assigned id replaces the temporary one.
    pub fn is_pending(&self) -> bool {
        !matches!(self.delivery, Delivery::Sent)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.delivery, Delivery::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub id: ReactionId,
    pub message_id: MessageId,
    pub emoji: String,
    pub username: String,
}

impl Reaction {
    pub fn matches(&self, emoji: &str, username: &str) -> bool {
        self.emoji == emoji && self.username == username
    }
}

/// A chat room the client can switch to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub name: String,
}

/// Who is sending from this client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub username: String,
    pub is_authenticated: bool,
    pub country: Option<String>,
}

impl UserIdentity {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            is_authenticated: false,
            country: None,
        }
    }

    /// Anonymous handle of the form `@user1234`, taken from the clock.
    pub fn guest() -> Self {
        let millis = Utc::now().timestamp_millis().rem_euclid(10_000);
        Self::new(format!("@user{:04}", millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_ids_are_unique_and_prefixed() {
        let a = TempId::generate();
        let b = TempId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("temp-"));
    }

    #[test]
    fn guest_handle_has_four_digits() {
        let guest = UserIdentity::guest();
        let digits = guest.username.strip_prefix("@user").unwrap();
        assert_eq!(digits.len(), 4);
        assert!(digits.chars().all(|c| c.is_ascii_digit()));
        assert!(!guest.is_authenticated);
    }

    #[test]
    fn failed_message_is_still_pending() {
        let delivery = Delivery::Failed { reason: "offline".into() };
        let msg = Message {
            key: MessageKey::Temp(TempId::from("temp-1")),
            room_id: 1,
            username: "@me".into(),
            text: "hi".into(),
            is_authenticated: false,
            country: None,
            created_at: Utc::now(),
            delivery,
            reactions: vec![],
        };
        assert!(msg.is_pending());
        assert!(msg.is_failed());
        assert_eq!(msg.server_id(), None);
    }
}
