use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use gamegram_types::{Delivery, Message, MessageId, MessageKey, Reaction, ReactionId, TempId};

/// How a message reached the store. Every delivery path feeds one of these
/// into [`MessageStore::apply`].
#[derive(Debug, Clone)]
pub enum Arrival {
    /// Newest page from the initial load.
    Snapshot(Vec<Message>),
    /// A page strictly older than everything loaded so far.
    Older(Vec<Message>),
    /// Realtime push.
    Pushed(Message),
    /// Rows picked up by the polling fallback.
    Polled(Vec<Message>),
    /// Provisional message authored on this client.
    Optimistic(Message),
    /// Authoritative row for a provisional message.
    Confirmed { temp_id: TempId, message: Message },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted(usize),
    /// Already present; reactions the stored copy lacked were folded in.
    Merged,
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconcile {
    Replaced(usize),
    /// The authoritative row was already delivered by push or poll; the
    /// provisional record was dropped in its favour.
    Superseded,
    Missing,
}

/// A record newly added by a live delivery path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arrived {
    pub key: MessageKey,
    pub username: String,
}

/// What a single [`MessageStore::apply`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub inserted: usize,
    /// Records that grew the live end of the timeline (push, poll, optimistic).
    pub arrived: Vec<Arrived>,
    pub reconciled: Option<Reconcile>,
}

/// Ordered, de-duplicated message collection.
///
/// Confirmed records are kept ascending by server id; provisional records sit
/// after every confirmed id known when they were created. A provisional record
/// keeps its slot when it is confirmed.
#[derive(Debug, Default)]
pub struct MessageStore {
    items: Vec<Message>,
    known: HashSet<MessageId>,
    /// Bumped on every change to `items`.
    revision: u64,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.known.contains(&id)
    }

    pub fn get(&self, key: &MessageKey) -> Option<&Message> {
        self.position(key).map(|idx| &self.items[idx])
    }

    pub fn oldest_id(&self) -> Option<MessageId> {
        self.items.iter().filter_map(Message::server_id).min()
    }

    pub fn newest_id(&self) -> Option<MessageId> {
        self.items.iter().filter_map(Message::server_id).max()
    }

    /// Changes whenever the contents change, so a cached [`Self::snapshot`]
    /// can be reused until then.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Immutable view for rendering.
    pub fn snapshot(&self) -> Arc<[Message]> {
        Arc::from(self.items.as_slice())
    }

    pub fn apply(&mut self, arrival: Arrival) -> MergeReport {
        let mut report = MergeReport::default();
        match arrival {
            Arrival::Snapshot(batch) | Arrival::Older(batch) => {
                for msg in batch {
                    if let Upsert::Inserted(_) = self.upsert(msg) {
                        report.inserted += 1;
                    }
                }
            }
            Arrival::Polled(batch) => {
                for msg in batch {
                    self.upsert_live(msg, &mut report);
                }
            }
            Arrival::Pushed(msg) | Arrival::Optimistic(msg) => {
                self.upsert_live(msg, &mut report);
            }
            Arrival::Confirmed { temp_id, message } => {
                report.reconciled = Some(self.reconcile(&temp_id, message));
            }
        }
        report
    }

    /// Insert a record, or fold a repeat delivery into the stored copy.
    /// Never creates a second record for the same identity.
    pub fn upsert(&mut self, msg: Message) -> Upsert {
        match &msg.key {
            MessageKey::Server(id) => {
                let id = *id;
                if self.known.contains(&id) {
                    return self.merge_existing(id, msg.reactions);
                }
                let idx = self.insertion_index(id);
                self.known.insert(id);
                self.items.insert(idx, msg);
                self.revision += 1;
                trace!(message_id = id, index = idx, "inserted message");
                Upsert::Inserted(idx)
            }
            MessageKey::Temp(temp) => {
                if self.position(&msg.key).is_some() {
                    debug!(temp_id = %temp, "ignoring repeated provisional message");
                    return Upsert::Ignored;
                }
                self.items.push(msg);
                self.revision += 1;
                Upsert::Inserted(self.items.len() - 1)
            }
        }
    }

    /// Forget every record, as when the room changes.
    pub fn clear(&mut self) {
        self.items.clear();
        self.known.clear();
        self.revision += 1;
    }

    /// Swap a provisional record for its authoritative row in place.
    pub fn reconcile(&mut self, temp_id: &TempId, mut authoritative: Message) -> Reconcile {
        let Some(idx) = self.position(&MessageKey::Temp(temp_id.clone())) else {
            warn!(temp_id = %temp_id, "reconcile target not found; it may have been discarded");
            return Reconcile::Missing;
        };
        let Some(id) = authoritative.server_id() else {
            warn!(temp_id = %temp_id, "reconcile called without a server id");
            return Reconcile::Missing;
        };

        if self.known.contains(&id) {
            self.items.remove(idx);
            self.revision += 1;
            debug!(
                temp_id = %temp_id,
                message_id = id,
                "authoritative row arrived first; dropped provisional record"
            );
            return Reconcile::Superseded;
        }

        let slot = &mut self.items[idx];
        authoritative.delivery = Delivery::Sent;
        if authoritative.reactions.is_empty() {
            authoritative.reactions = std::mem::take(&mut slot.reactions);
        }
        *slot = authoritative;
        self.known.insert(id);
        self.revision += 1;
        Reconcile::Replaced(idx)
    }

    pub fn mark_failed(&mut self, temp_id: &TempId, reason: impl Into<String>) -> bool {
        match self.temp_mut(temp_id) {
            Some(msg) => {
                msg.delivery = Delivery::Failed { reason: reason.into() };
                self.revision += 1;
                true
            }
            None => false,
        }
    }

    /// Flip a failed provisional record back to pending for another attempt.
    pub fn mark_pending(&mut self, temp_id: &TempId) -> Option<&Message> {
        let idx = self.position(&MessageKey::Temp(temp_id.clone()))?;
        self.revision += 1;
        let msg = &mut self.items[idx];
        msg.delivery = Delivery::Pending;
        Some(msg)
    }

    /// Drop a provisional record. Confirmed records are never removed.
    pub fn remove_temp(&mut self, temp_id: &TempId) -> Option<Message> {
        let idx = self.position(&MessageKey::Temp(temp_id.clone()))?;
        self.revision += 1;
        Some(self.items.remove(idx))
    }

    /// Returns false if the parent message is unknown or the reaction is
    /// already present (by id or by emoji and user).
    pub fn add_reaction(&mut self, reaction: Reaction) -> bool {
        let Some(msg) = self.server_mut(reaction.message_id) else {
            return false;
        };
        let duplicate = msg
            .reactions
            .iter()
            .any(|r| r.id == reaction.id || r.matches(&reaction.emoji, &reaction.username));
        if duplicate {
            return false;
        }
        msg.reactions.push(reaction);
        self.revision += 1;
        true
    }

    /// Remove a reaction by id. When the parent is not known the whole store
    /// is searched, since delete payloads may carry only the primary key.
    pub fn remove_reaction(
        &mut self,
        message_id: Option<MessageId>,
        reaction_id: ReactionId,
    ) -> bool {
        let candidates: Vec<&mut Message> = match message_id {
            Some(id) => self.server_mut(id).into_iter().collect(),
            None => self.items.iter_mut().collect(),
        };
        let removed = candidates.into_iter().any(|msg| {
            match msg.reactions.iter().position(|r| r.id == reaction_id) {
                Some(pos) => {
                    msg.reactions.remove(pos);
                    true
                }
                None => false,
            }
        });
        if removed {
            self.revision += 1;
        }
        removed
    }

    pub fn find_reaction(
        &self,
        message_id: MessageId,
        emoji: &str,
        username: &str,
    ) -> Option<&Reaction> {
        self.get(&MessageKey::Server(message_id))?
            .reactions
            .iter()
            .find(|r| r.matches(emoji, username))
    }

    fn upsert_live(&mut self, msg: Message, report: &mut MergeReport) {
        let arrived = Arrived {
            key: msg.key.clone(),
            username: msg.username.clone(),
        };
        if let Upsert::Inserted(_) = self.upsert(msg) {
            report.inserted += 1;
            report.arrived.push(arrived);
        }
    }

    fn merge_existing(&mut self, id: MessageId, incoming: Vec<Reaction>) -> Upsert {
        let Some(existing) = self.server_mut(id) else {
            return Upsert::Ignored;
        };
        let mut changed = false;
        for reaction in incoming {
            if !existing.reactions.iter().any(|r| r.id == reaction.id) {
                existing.reactions.push(reaction);
                changed = true;
            }
        }
        if !changed {
            return Upsert::Ignored;
        }
        self.revision += 1;
        Upsert::Merged
    }

    /// Slot for a confirmed id: after the last confirmed record with a lower
    /// id, and ahead of any trailing provisional records.
    fn insertion_index(&self, id: MessageId) -> usize {
        let mut idx = self.items.len();
        while idx > 0 {
            match self.items[idx - 1].server_id() {
                Some(existing) if existing < id => break,
                _ => idx -= 1,
            }
        }
        idx
    }

    fn position(&self, key: &MessageKey) -> Option<usize> {
        if let MessageKey::Server(id) = key {
            if !self.known.contains(id) {
                return None;
            }
        }
        self.items.iter().rposition(|m| &m.key == key)
    }

    fn server_mut(&mut self, id: MessageId) -> Option<&mut Message> {
        let idx = self.position(&MessageKey::Server(id))?;
        self.items.get_mut(idx)
    }

    fn temp_mut(&mut self, temp_id: &TempId) -> Option<&mut Message> {
        let idx = self.position(&MessageKey::Temp(temp_id.clone()))?;
        self.items.get_mut(idx)
    }
}
