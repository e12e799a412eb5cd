use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RowError;
use crate::models::{
    Delivery, Message, MessageId, MessageKey, Reaction, ReactionId, Room, RoomId,
};

// -- Messages --

/// A `messages` row as the remote store hands it out. Every field is optional
/// so a malformed row still deserializes and can be rejected with a reason.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: Option<MessageId>,
    pub channel_id: Option<RoomId>,
    pub username: Option<String>,
    pub text: Option<String>,
    #[serde(default)]
    pub is_authenticated: bool,
    pub country: Option<String>,
    pub timestamp: Option<String>,
}

/// Insert payload for a new message. The server assigns id and timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessage {
    pub channel_id: RoomId,
    pub username: String,
    pub text: String,
    pub is_authenticated: bool,
    pub country: Option<String>,
}

impl TryFrom<MessageRow> for Message {
    type Error = RowError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        let id = row.id.ok_or(RowError::MissingField("id"))?;
        let room_id = row.channel_id.ok_or(RowError::MissingField("channel_id"))?;
        let raw_ts = row.timestamp.ok_or(RowError::MissingField("timestamp"))?;
        let created_at = parse_timestamp(&raw_ts)?;

        Ok(Message {
            key: MessageKey::Server(id),
            room_id,
            username: row.username.unwrap_or_else(|| "unknown".to_string()),
            text: row.text.unwrap_or_default(),
            is_authenticated: row.is_authenticated,
            country: row.country,
            created_at,
            delivery: Delivery::Sent,
            reactions: vec![],
        })
    }
}

/// Accepts RFC 3339 as well as the zone-less forms Postgres and SQLite emit,
/// which are taken to be UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, RowError> {
    if let Ok(ts) = raw.parse::<DateTime<Utc>>() {
        return Ok(ts);
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|ndt| ndt.and_utc())
        .ok_or_else(|| RowError::BadTimestamp(raw.to_string()))
}

// -- Reactions --

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReactionRow {
    pub id: Option<ReactionId>,
    pub message_id: Option<MessageId>,
    pub emoji: Option<String>,
    pub username: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewReaction {
    pub message_id: MessageId,
    pub emoji: String,
    pub username: String,
}

impl TryFrom<ReactionRow> for Reaction {
    type Error = RowError;

    fn try_from(row: ReactionRow) -> Result<Self, Self::Error> {
        Ok(Reaction {
            id: row.id.ok_or(RowError::MissingField("id"))?,
            message_id: row.message_id.ok_or(RowError::MissingField("message_id"))?,
            emoji: row.emoji.ok_or(RowError::MissingField("emoji"))?,
            username: row.username.ok_or(RowError::MissingField("username"))?,
        })
    }
}

// -- Channels --

/// A `channels` row. Rooms are listed in id order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelRow {
    pub id: Option<RoomId>,
    pub name: Option<String>,
}

impl TryFrom<ChannelRow> for Room {
    type Error = RowError;

    fn try_from(row: ChannelRow) -> Result<Self, Self::Error> {
        let id = row.id.ok_or(RowError::MissingField("id"))?;
        Ok(Room {
            id,
            name: row.name.unwrap_or_else(|| format!("room-{}", id)),
        })
    }
}

// -- Pages --

/// Which slice of history a page request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "bound", content = "id", rename_all = "snake_case")]
pub enum PageBound {
    /// Newest rows, returned newest-first.
    Latest,
    /// Rows with id strictly below the given one, returned newest-first.
    Before(MessageId),
    /// Rows with id strictly above the given one, returned oldest-first.
    After(MessageId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageQuery {
    pub room_id: RoomId,
    pub bound: PageBound,
    pub limit: u32,
}
