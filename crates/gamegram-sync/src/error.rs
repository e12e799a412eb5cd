use thiserror::Error;

use gamegram_types::{MessageKey, RemoteError};

/// Errors surfaced to callers of the engine handle. Transient channel and
/// network failures never appear here; the connection machinery absorbs them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("message is empty")]
    EmptyMessage,
    #[error("a send is already in flight for this composer")]
    SendInFlight,
    #[error("a reaction toggle for this message and emoji is already in flight")]
    ToggleInFlight,
    #[error("unknown message {0}")]
    UnknownMessage(MessageKey),
    /// A remote write failed. The local state still holds what the user
    /// wrote, so the action can be retried.
    #[error("{action} failed: {source}")]
    Write {
        action: WriteAction,
        #[source]
        source: RemoteError,
    },
    #[error("could not list rooms: {0}")]
    ListRooms(#[source] RemoteError),
    #[error("sync engine is stopped")]
    EngineStopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteAction {
    SendMessage,
    AddReaction,
    RemoveReaction,
}

impl std::fmt::Display for WriteAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::SendMessage => "send message",
            Self::AddReaction => "add reaction",
            Self::RemoveReaction => "remove reaction",
        };
        f.write_str(name)
    }
}

impl SyncError {
    pub fn write(action: WriteAction, source: RemoteError) -> Self {
        Self::Write { action, source }
    }
}
