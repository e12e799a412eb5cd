use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::api::{ChannelRow, MessageRow, NewMessage, NewReaction, PageQuery, ReactionRow};
use crate::error::RemoteError;
use crate::events::{ChangeEvent, SubscriptionHandle, SubscriptionState};
use crate::models::{MessageId, ReactionId, RoomId};

/// A live realtime subscription. The event stream ends when the channel dies.
#[derive(Debug)]
pub struct Subscription {
    pub handle: SubscriptionHandle,
    pub events: mpsc::UnboundedReceiver<ChangeEvent>,
}

/// The backing store: row queries, row writes and a realtime change feed.
/// Delivery is at-least-once and eventually consistent.
#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    /// Every room, ascending by id.
    async fn fetch_channels(&self) -> Result<Vec<ChannelRow>, RemoteError>;

    async fn fetch_page(&self, query: PageQuery) -> Result<Vec<MessageRow>, RemoteError>;

    async fn fetch_reactions(
        &self,
        message_ids: &[MessageId],
    ) -> Result<Vec<ReactionRow>, RemoteError>;

    async fn insert_message(&self, message: NewMessage) -> Result<MessageRow, RemoteError>;

    async fn insert_reaction(&self, reaction: NewReaction) -> Result<ReactionRow, RemoteError>;

    async fn delete_reaction(&self, id: ReactionId) -> Result<(), RemoteError>;

    /// Resolves once the channel has joined, or fails.
    async fn subscribe(&self, room_id: RoomId) -> Result<Subscription, RemoteError>;

    async fn unsubscribe(&self, handle: SubscriptionHandle);

    async fn subscription_state(&self, handle: SubscriptionHandle) -> SubscriptionState;
}
