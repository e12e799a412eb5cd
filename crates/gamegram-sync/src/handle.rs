use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::debug;

use gamegram_types::{Message, MessageId, MessageKey, Room, RoomId, TempId};

use crate::connection::ConnectionState;
use crate::error::SyncError;
use crate::reactions::{self, ReactionGroup};
use crate::send::ComposerId;
use crate::viewport::{ScrollDirective, ScrollPosition};

pub(crate) type Reply<T> = oneshot::Sender<Result<T, SyncError>>;

/// Composer used by [`SyncHandle::send_message`].
pub(crate) const DEFAULT_COMPOSER: ComposerId = ComposerId(0);

pub(crate) enum Command {
    Send {
        composer: ComposerId,
        text: String,
        reply: Reply<MessageId>,
    },
    RetrySend {
        temp_id: TempId,
        reply: Reply<MessageId>,
    },
    DiscardFailed {
        temp_id: TempId,
    },
    ToggleReaction {
        message_id: MessageId,
        emoji: String,
        reply: Reply<ToggleOutcome>,
    },
    ScrollToBottom,
    ScrollChanged(ScrollPosition),
    LoadOlder,
    Refresh,
    Visibility(bool),
    Network(bool),
    JoinRoom(RoomId),
    ListRooms(Reply<Vec<Room>>),
    Stop(oneshot::Sender<()>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleOutcome {
    Added,
    Removed,
}

/// Everything the presentation layer renders from.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewState {
    pub room_id: RoomId,
    /// Rooms the user can switch to, ascending by id.
    pub rooms: Arc<[Room]>,
    pub messages: Arc<[Message]>,
    pub username: String,
    pub is_at_bottom: bool,
    pub unviewed_count: usize,
    pub loading_initial: bool,
    pub loading_older: bool,
    pub has_more_history: bool,
    pub last_error: Option<String>,
    pub connection_status: ConnectionState,
}

impl ViewState {
    pub(crate) fn initial(username: String, room_id: RoomId) -> Self {
        Self {
            room_id,
            rooms: Arc::from(Vec::new()),
            messages: Arc::from(Vec::new()),
            username,
            is_at_bottom: true,
            unviewed_count: 0,
            loading_initial: true,
            loading_older: false,
            has_more_history: true,
            last_error: None,
            connection_status: ConnectionState::Connecting,
        }
    }

    /// Cheap change check: the message and room lists are compared by
    /// allocation, since the engine only reallocates them when they change.
    pub(crate) fn differs_from(&self, other: &ViewState) -> bool {
        !Arc::ptr_eq(&self.messages, &other.messages)
            || !Arc::ptr_eq(&self.rooms, &other.rooms)
            || self.room_id != other.room_id
            || self.username != other.username
            || self.is_at_bottom != other.is_at_bottom
            || self.unviewed_count != other.unviewed_count
            || self.loading_initial != other.loading_initial
            || self.loading_older != other.loading_older
            || self.has_more_history != other.has_more_history
            || self.last_error != other.last_error
            || self.connection_status != other.connection_status
    }

    pub fn message(&self, key: &MessageKey) -> Option<&Message> {
        self.messages.iter().find(|m| &m.key == key)
    }

    pub fn reaction_groups(&self, key: &MessageKey) -> Vec<ReactionGroup> {
        self.message(key)
            .map(|m| reactions::summarize(&m.reactions, &self.username))
            .unwrap_or_default()
    }
}

/// Cloneable front door to a running [`crate::SyncEngine`].
#[derive(Clone)]
pub struct SyncHandle {
    pub(crate) commands: mpsc::UnboundedSender<Command>,
    pub(crate) state: watch::Receiver<ViewState>,
    pub(crate) directives: broadcast::Sender<ScrollDirective>,
    pub(crate) composers: Arc<AtomicU64>,
}

impl SyncHandle {
    /// Current view. Use [`Self::subscribe`] to follow changes.
    pub fn view(&self) -> ViewState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ViewState> {
        self.state.clone()
    }

    /// One-shot scroll instructions (auto-scroll, prepend anchoring).
    pub fn directives(&self) -> broadcast::Receiver<ScrollDirective> {
        self.directives.subscribe()
    }

    pub fn composer(&self) -> Composer {
        let id = self.composers.fetch_add(1, Ordering::Relaxed);
        Composer {
            id: ComposerId(id),
            handle: self.clone(),
            draft: String::new(),
        }
    }

    /// Send through the shared default composer. Resolves once the message
    /// is persisted and reconciled.
    pub async fn send_message(&self, text: impl Into<String>) -> Result<MessageId, SyncError> {
        self.send_from(DEFAULT_COMPOSER, text.into()).await
    }

    pub async fn retry_send(&self, temp_id: TempId) -> Result<MessageId, SyncError> {
        self.request(|reply| Command::RetrySend { temp_id, reply }).await
    }

    /// Drop a failed optimistic message. Pending and confirmed messages are
    /// left alone.
    pub fn discard_failed(&self, temp_id: TempId) {
        self.notify(Command::DiscardFailed { temp_id });
    }

    pub async fn toggle_reaction(
        &self,
        message_id: MessageId,
        emoji: impl Into<String>,
    ) -> Result<ToggleOutcome, SyncError> {
        let emoji = emoji.into();
        self.request(|reply| Command::ToggleReaction {
            message_id,
            emoji,
            reply,
        })
        .await
    }

    pub fn scroll_to_bottom(&self) {
        self.notify(Command::ScrollToBottom);
    }

    pub fn on_scroll_position_changed(&self, position: ScrollPosition) {
        self.notify(Command::ScrollChanged(position));
    }

    pub fn load_older(&self) {
        self.notify(Command::LoadOlder);
    }

    pub fn refresh(&self) {
        self.notify(Command::Refresh);
    }

    /// Switch to another room. Loaded messages, pagination and unread state
    /// are reset and the realtime channel moves to the new room.
    pub fn join_room(&self, room_id: RoomId) {
        self.notify(Command::JoinRoom(room_id));
    }

    /// Fetch the room list again. The result is also published in
    /// [`ViewState::rooms`].
    pub async fn list_rooms(&self) -> Result<Vec<Room>, SyncError> {
        self.request(Command::ListRooms).await
    }

    /// Host page visibility changed.
    pub fn set_visible(&self, visible: bool) {
        self.notify(Command::Visibility(visible));
    }

    /// Host network connectivity changed.
    pub fn set_online(&self, online: bool) {
        self.notify(Command::Network(online));
    }

    pub(crate) async fn send_from(
        &self,
        composer: ComposerId,
        text: String,
    ) -> Result<MessageId, SyncError> {
        self.request(|reply| Command::Send {
            composer,
            text,
            reply,
        })
        .await
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .map_err(|_| SyncError::EngineStopped)?;
        rx.await.map_err(|_| SyncError::EngineStopped)?
    }

    fn notify(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("sync engine stopped; dropping command");
        }
    }
}

/// Draft text for one input box. The draft is cleared only after the
/// message has been persisted.
pub struct Composer {
    id: ComposerId,
    handle: SyncHandle,
    draft: String,
}

impl Composer {
    pub fn id(&self) -> ComposerId {
        self.id
    }

    pub fn draft(&self) -> &str {
        &self.draft
    }

    pub fn set_draft(&mut self, text: impl Into<String>) {
        self.draft = text.into();
    }

    pub async fn submit(&mut self) -> Result<MessageId, SyncError> {
        let id = self.handle.send_from(self.id, self.draft.clone()).await?;
        self.draft.clear();
        Ok(id)
    }
}
