use serde::{Deserialize, Serialize};

use crate::api::{MessageRow, ReactionRow};

/// A row carried by a realtime change, tagged with its table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "table", content = "row", rename_all = "snake_case")]
pub enum ChangeRow {
    Messages(MessageRow),
    Reactions(ReactionRow),
}

/// Events pushed over a realtime subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ChangeEvent {
    Insert(ChangeRow),
    Delete(ChangeRow),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionHandle(pub u64);

/// Join state of a realtime subscription as reported by the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Joining,
    Joined,
    Closed,
    Errored,
}
