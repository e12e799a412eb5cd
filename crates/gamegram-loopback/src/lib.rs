//! In-process [`RemoteStore`] backed by in-memory tables.
//!
//! Assigns ids and timestamps the way the hosted store does, enforces one
//! reaction per (message, user, emoji), fans inserts and deletes out to
//! realtime subscribers, and can be told to misbehave: go offline, refuse
//! writes or handshakes, or let a channel die without saying so.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use gamegram_types::{
    ChangeEvent, ChangeRow, ChannelRow, MessageId, MessageRow, NewMessage, NewReaction, PageBound,
    PageQuery, ReactionId, ReactionRow, RemoteError, RemoteStore, RoomId, Subscription,
    SubscriptionHandle, SubscriptionState,
};

#[derive(Default)]
pub struct LoopbackStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    last_message_id: MessageId,
    last_reaction_id: ReactionId,
    last_handle: u64,
    rooms: BTreeMap<RoomId, String>,
    messages: BTreeMap<MessageId, MessageRow>,
    reactions: BTreeMap<ReactionId, ReactionRow>,
    channels: HashMap<SubscriptionHandle, Channel>,
    subscribe_calls: usize,
    faults: Faults,
}

struct Channel {
    room_id: RoomId,
    state: SubscriptionState,
    tx: Option<mpsc::UnboundedSender<ChangeEvent>>,
}

#[derive(Default)]
struct Faults {
    offline: bool,
    failing_inserts: u32,
    failing_subscribes: u32,
    hang_subscribes: bool,
    latency: Duration,
}

impl LoopbackStore {
    pub fn new() -> Self {
        Self::default()
    }

    // -- Test and harness controls --

    /// Create or rename a room.
    pub fn add_room(&self, room_id: RoomId, name: &str) {
        self.lock().rooms.insert(room_id, name.to_string());
    }

    /// Insert history without notifying subscribers.
    pub fn seed_message(&self, room_id: RoomId, username: &str, text: &str) -> MessageId {
        let mut inner = self.lock();
        let row = inner.store_message(new_message(room_id, username, text));
        row.id.unwrap_or_default()
    }

    /// Another client posts a message: stored and pushed to subscribers.
    pub fn post_as(&self, room_id: RoomId, username: &str, text: &str) -> MessageRow {
        let mut inner = self.lock();
        let row = inner.store_message(new_message(room_id, username, text));
        inner.publish(room_id, ChangeEvent::Insert(ChangeRow::Messages(row.clone())));
        row
    }

    /// Another client reacts to a message.
    pub fn react_as(
        &self,
        message_id: MessageId,
        username: &str,
        emoji: &str,
    ) -> Result<ReactionRow, RemoteError> {
        self.lock().store_reaction(NewReaction {
            message_id,
            emoji: emoji.to_string(),
            username: username.to_string(),
        })
    }

    /// Offline: every call fails, and live channels error out.
    pub fn set_offline(&self, offline: bool) {
        let mut inner = self.lock();
        inner.faults.offline = offline;
        if offline {
            for channel in inner.channels.values_mut() {
                channel.state = SubscriptionState::Errored;
                channel.tx = None;
            }
            info!("loopback store offline");
        } else {
            info!("loopback store online");
        }
    }

    /// Channels stop delivering and report `closed`, without ending their
    /// event streams.
    pub fn kill_subscriptions_silently(&self) {
        let mut inner = self.lock();
        for channel in inner.channels.values_mut() {
            channel.state = SubscriptionState::Closed;
        }
    }

    pub fn fail_next_inserts(&self, count: u32) {
        self.lock().faults.failing_inserts = count;
    }

    pub fn fail_next_subscribes(&self, count: u32) {
        self.lock().faults.failing_subscribes = count;
    }

    /// Handshakes never complete while set.
    pub fn hang_subscribes(&self, hang: bool) {
        self.lock().faults.hang_subscribes = hang;
    }

    /// Delay applied to every call.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().faults.latency = latency;
    }

    /// Channels currently joined.
    pub fn active_subscriptions(&self) -> usize {
        self.lock()
            .channels
            .values()
            .filter(|c| c.state == SubscriptionState::Joined)
            .count()
    }

    /// Channels not yet unsubscribed, whatever their state.
    pub fn open_subscriptions(&self) -> usize {
        self.lock().channels.len()
    }

    pub fn subscribe_calls(&self) -> usize {
        self.lock().subscribe_calls
    }

    pub fn message_count(&self, room_id: RoomId) -> usize {
        self.lock()
            .messages
            .values()
            .filter(|m| m.channel_id == Some(room_id))
            .count()
    }

    pub fn reactions_for(&self, message_id: MessageId) -> Vec<ReactionRow> {
        self.lock()
            .reactions
            .values()
            .filter(|r| r.message_id == Some(message_id))
            .cloned()
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // State stays consistent across a panicking test thread.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn simulate_latency(&self) {
        let latency = self.lock().faults.latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn check_online(&self) -> Result<(), RemoteError> {
        if self.lock().faults.offline {
            return Err(RemoteError::Network("offline".to_string()));
        }
        Ok(())
    }
}

impl Inner {
    fn store_message(&mut self, new: NewMessage) -> MessageRow {
        self.last_message_id += 1;
        let row = MessageRow {
            id: Some(self.last_message_id),
            channel_id: Some(new.channel_id),
            username: Some(new.username),
            text: Some(new.text),
            is_authenticated: new.is_authenticated,
            country: new.country,
            timestamp: Some(Utc::now().to_rfc3339()),
        };
        self.messages.insert(self.last_message_id, row.clone());
        trace!(message_id = self.last_message_id, "stored message");
        row
    }

    fn store_reaction(&mut self, new: NewReaction) -> Result<ReactionRow, RemoteError> {
        let room_id = self
            .messages
            .get(&new.message_id)
            .and_then(|m| m.channel_id)
            .ok_or(RemoteError::NotFound)?;

        let duplicate = self.reactions.values().any(|r| {
            r.message_id == Some(new.message_id)
                && r.username.as_deref() == Some(new.username.as_str())
                && r.emoji.as_deref() == Some(new.emoji.as_str())
        });
        if duplicate {
            return Err(RemoteError::Conflict(
                "duplicate key value violates unique constraint \"reactions_message_user_emoji\""
                    .to_string(),
            ));
        }

        self.last_reaction_id += 1;
        let row = ReactionRow {
            id: Some(self.last_reaction_id),
            message_id: Some(new.message_id),
            emoji: Some(new.emoji),
            username: Some(new.username),
        };
        self.reactions.insert(self.last_reaction_id, row.clone());
        self.publish(room_id, ChangeEvent::Insert(ChangeRow::Reactions(row.clone())));
        Ok(row)
    }

    /// Fan an event out to every joined channel for the room.
    fn publish(&mut self, room_id: RoomId, event: ChangeEvent) {
        for (handle, channel) in self.channels.iter_mut() {
            if channel.room_id != room_id || channel.state != SubscriptionState::Joined {
                continue;
            }
            let Some(tx) = &channel.tx else {
                continue;
            };
            if tx.send(event.clone()).is_err() {
                debug!(handle = handle.0, "subscriber went away");
                channel.state = SubscriptionState::Closed;
                channel.tx = None;
            }
        }
    }
}

#[async_trait]
impl RemoteStore for LoopbackStore {
    async fn fetch_channels(&self) -> Result<Vec<ChannelRow>, RemoteError> {
        self.simulate_latency().await;
        self.check_online()?;

        let inner = self.lock();
        Ok(inner
            .rooms
            .iter()
            .map(|(id, name)| ChannelRow {
                id: Some(*id),
                name: Some(name.clone()),
            })
            .collect())
    }

    async fn fetch_page(&self, query: PageQuery) -> Result<Vec<MessageRow>, RemoteError> {
        self.simulate_latency().await;
        self.check_online()?;

        let inner = self.lock();
        let in_room = |row: &&MessageRow| row.channel_id == Some(query.room_id);
        let limit = query.limit as usize;
        let rows = match query.bound {
            PageBound::Latest => inner
                .messages
                .values()
                .rev()
                .filter(in_room)
                .take(limit)
                .cloned()
                .collect(),
            PageBound::Before(id) => inner
                .messages
                .range(..id)
                .rev()
                .map(|(_, row)| row)
                .filter(in_room)
                .take(limit)
                .cloned()
                .collect(),
            PageBound::After(id) => inner
                .messages
                .range(id.saturating_add(1)..)
                .map(|(_, row)| row)
                .filter(in_room)
                .take(limit)
                .cloned()
                .collect(),
        };
        Ok(rows)
    }

    async fn fetch_reactions(
        &self,
        message_ids: &[MessageId],
    ) -> Result<Vec<ReactionRow>, RemoteError> {
        self.simulate_latency().await;
        self.check_online()?;

        let inner = self.lock();
        Ok(inner
            .reactions
            .values()
            .filter(|r| r.message_id.is_some_and(|id| message_ids.contains(&id)))
            .cloned()
            .collect())
    }

    async fn insert_message(&self, message: NewMessage) -> Result<MessageRow, RemoteError> {
        self.simulate_latency().await;
        self.check_online()?;

        let mut inner = self.lock();
        if inner.faults.failing_inserts > 0 {
            inner.faults.failing_inserts -= 1;
            return Err(RemoteError::Network("connection reset by peer".to_string()));
        }
        let room_id = message.channel_id;
        let row = inner.store_message(message);
        inner.publish(room_id, ChangeEvent::Insert(ChangeRow::Messages(row.clone())));
        Ok(row)
    }

    async fn insert_reaction(&self, reaction: NewReaction) -> Result<ReactionRow, RemoteError> {
        self.simulate_latency().await;
        self.check_online()?;
        self.lock().store_reaction(reaction)
    }

    async fn delete_reaction(&self, id: ReactionId) -> Result<(), RemoteError> {
        self.simulate_latency().await;
        self.check_online()?;

        let mut inner = self.lock();
        let row = inner.reactions.remove(&id).ok_or(RemoteError::NotFound)?;
        let room_id = row
            .message_id
            .and_then(|mid| inner.messages.get(&mid))
            .and_then(|m| m.channel_id);
        if let Some(room_id) = room_id {
            // Delete payloads carry only the primary key.
            let key_only = ReactionRow {
                id: Some(id),
                ..ReactionRow::default()
            };
            inner.publish(room_id, ChangeEvent::Delete(ChangeRow::Reactions(key_only)));
        }
        Ok(())
    }

    async fn subscribe(&self, room_id: RoomId) -> Result<Subscription, RemoteError> {
        self.simulate_latency().await;

        let hang = {
            let mut inner = self.lock();
            inner.subscribe_calls += 1;
            if inner.faults.offline {
                return Err(RemoteError::Network("offline".to_string()));
            }
            if inner.faults.failing_subscribes > 0 {
                inner.faults.failing_subscribes -= 1;
                return Err(RemoteError::Rejected {
                    status: 503,
                    message: "realtime unavailable".to_string(),
                });
            }
            inner.faults.hang_subscribes
        };
        if hang {
            std::future::pending::<()>().await;
        }

        let mut inner = self.lock();
        inner.last_handle += 1;
        let handle = SubscriptionHandle(inner.last_handle);
        let (tx, events) = mpsc::unbounded_channel();
        inner.channels.insert(
            handle,
            Channel {
                room_id,
                state: SubscriptionState::Joined,
                tx: Some(tx),
            },
        );
        debug!(handle = handle.0, room_id, "channel joined");
        Ok(Subscription { handle, events })
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) {
        if self.lock().channels.remove(&handle).is_some() {
            debug!(handle = handle.0, "channel removed");
        }
    }

    async fn subscription_state(&self, handle: SubscriptionHandle) -> SubscriptionState {
        self.lock()
            .channels
            .get(&handle)
            .map(|c| c.state)
            .unwrap_or(SubscriptionState::Closed)
    }
}

fn new_message(room_id: RoomId, username: &str, text: &str) -> NewMessage {
    NewMessage {
        channel_id: room_id,
        username: username.to_string(),
        text: text.to_string(),
        is_authenticated: false,
        country: None,
    }
}
