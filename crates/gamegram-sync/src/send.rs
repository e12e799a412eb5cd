use std::collections::{HashMap, HashSet};

use chrono::Utc;
use tracing::debug;

use gamegram_types::{
    Delivery, Message, MessageId, MessageKey, NewMessage, NewReaction, ReactionId, RoomId, TempId,
    UserIdentity,
};

use crate::error::SyncError;
use crate::store::MessageStore;

/// Identifies one composer (input box). Each may have one send in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ComposerId(pub u64);

/// Remote call a reaction toggle resolved to.
#[derive(Debug, Clone, PartialEq)]
pub enum ToggleAction {
    Add(NewReaction),
    Remove(ReactionId),
}

/// Optimistic writes: provisional messages and reaction toggles.
#[derive(Debug)]
pub struct SendCoordinator {
    room_id: RoomId,
    identity: UserIdentity,
    in_flight: HashMap<ComposerId, TempId>,
    retrying: HashSet<TempId>,
    toggles: HashSet<(MessageId, String)>,
}

impl SendCoordinator {
    pub fn new(room_id: RoomId, identity: UserIdentity) -> Self {
        Self {
            room_id,
            identity,
            in_flight: HashMap::new(),
            retrying: HashSet::new(),
            toggles: HashSet::new(),
        }
    }

    pub fn identity(&self) -> &UserIdentity {
        &self.identity
    }

    /// Build the provisional message for a submit. The caller inserts it
    /// into the store and issues [`Self::payload`] to the remote.
    pub fn prepare(
        &mut self,
        composer: ComposerId,
        text: &str,
    ) -> Result<(TempId, Message), SyncError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SyncError::EmptyMessage);
        }
        if self.in_flight.contains_key(&composer) {
            return Err(SyncError::SendInFlight);
        }

        let temp_id = TempId::generate();
        self.in_flight.insert(composer, temp_id.clone());
        debug!(temp_id = %temp_id, "prepared optimistic message");

        let msg = Message {
            key: MessageKey::Temp(temp_id.clone()),
            room_id: self.room_id,
            username: self.identity.username.clone(),
            text: text.to_string(),
            is_authenticated: self.identity.is_authenticated,
            country: self.identity.country.clone(),
            created_at: Utc::now(),
            delivery: Delivery::Pending,
            reactions: vec![],
        };
        Ok((temp_id, msg))
    }

    /// Re-arm a failed provisional message for another persist attempt.
    pub fn prepare_retry(
        &mut self,
        store: &mut MessageStore,
        temp_id: &TempId,
    ) -> Result<NewMessage, SyncError> {
        if self.retrying.contains(temp_id) || self.in_flight.values().any(|t| t == temp_id) {
            return Err(SyncError::SendInFlight);
        }
        let key = MessageKey::Temp(temp_id.clone());
        match store.get(&key) {
            Some(msg) if msg.is_failed() => {}
            Some(_) => return Err(SyncError::SendInFlight),
            None => return Err(SyncError::UnknownMessage(key)),
        }
        let msg = store
            .mark_pending(temp_id)
            .ok_or_else(|| SyncError::UnknownMessage(key))?;
        let payload = self.payload(msg);
        self.retrying.insert(temp_id.clone());
        Ok(payload)
    }

    pub fn payload(&self, msg: &Message) -> NewMessage {
        NewMessage {
            channel_id: msg.room_id,
            username: msg.username.clone(),
            text: msg.text.clone(),
            is_authenticated: msg.is_authenticated,
            country: msg.country.clone(),
        }
    }

    /// The persist request for `temp_id` finished, either way.
    pub fn finish(&mut self, composer: Option<ComposerId>, temp_id: &TempId) {
        if let Some(composer) = composer {
            if self.in_flight.get(&composer) == Some(temp_id) {
                self.in_flight.remove(&composer);
            }
        }
        self.retrying.remove(temp_id);
    }

    /// Decide between insert and delete from the local view of the message's
    /// reactions. A second toggle of the same pair is refused until the first
    /// one completes.
    pub fn begin_toggle(
        &mut self,
        store: &MessageStore,
        message_id: MessageId,
        emoji: &str,
    ) -> Result<ToggleAction, SyncError> {
        if !store.contains(message_id) {
            return Err(SyncError::UnknownMessage(MessageKey::Server(message_id)));
        }
        let pair = (message_id, emoji.to_string());
        if self.toggles.contains(&pair) {
            return Err(SyncError::ToggleInFlight);
        }

        let action = match store.find_reaction(message_id, emoji, &self.identity.username) {
            Some(existing) => ToggleAction::Remove(existing.id),
            None => ToggleAction::Add(NewReaction {
                message_id,
                emoji: emoji.to_string(),
                username: self.identity.username.clone(),
            }),
        };
        self.toggles.insert(pair);
        Ok(action)
    }

    pub fn finish_toggle(&mut self, message_id: MessageId, emoji: &str) {
        self.toggles.remove(&(message_id, emoji.to_string()));
    }
}
