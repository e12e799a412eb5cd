use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use futures_util::future::OptionFuture;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep_until, timeout};
use tracing::{debug, info, trace, warn};

use gamegram_types::{
    ChangeEvent, ChangeRow, ChannelRow, Message, MessageId, MessageKey, MessageRow, PageBound,
    PageQuery, ReactionId, ReactionRow, RemoteError, RemoteStore, Room, RoomId, Subscription,
    SubscriptionHandle, SubscriptionState, TempId, UserIdentity,
};

use crate::config::SyncConfig;
use crate::connection::{ConnectionManager, ConnectionState};
use crate::error::{SyncError, WriteAction};
use crate::fetch::{decode_messages, decode_reaction, decode_rooms, fetch_messages};
use crate::handle::{Command, Reply, SyncHandle, ToggleOutcome, ViewState};
use crate::pagination::PaginationController;
use crate::send::{ComposerId, SendCoordinator, ToggleAction};
use crate::store::{Arrival, Arrived, MessageStore, Reconcile};
use crate::viewport::{ScrollDirective, ViewportTracker};

const DIRECTIVE_BUFFER: usize = 64;

/// A running sync engine for one room at a time.
///
/// All state lives in a single task; the [`SyncHandle`] and every piece of
/// remote IO talk to it over channels, so mutations are strictly sequential.
pub struct SyncEngine {
    handle: SyncHandle,
    task: JoinHandle<()>,
}

impl SyncEngine {
    /// Spawn the engine on the current tokio runtime. The initial page load
    /// and the first subscribe attempt start immediately.
    pub fn start(
        config: SyncConfig,
        identity: UserIdentity,
        room_id: RoomId,
        remote: Arc<dyn RemoteStore>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let initial = ViewState::initial(identity.username.clone(), room_id);
        let (state_tx, state_rx) = watch::channel(initial);
        let (directives, _) = broadcast::channel(DIRECTIVE_BUFFER);

        let actor = Actor {
            room_id,
            generation: 0,
            remote,
            store: MessageStore::new(),
            pages: PaginationController::new(room_id, config.page_size),
            conn: ConnectionManager::new(config.reconnect),
            sends: SendCoordinator::new(room_id, identity),
            viewport: ViewportTracker::new(config.bottom_threshold, config.top_threshold),
            rooms: Arc::from(Vec::new()),
            snapshot: Arc::from(Vec::new()),
            snapshot_revision: None,
            channel: None,
            subscribing: None,
            deferred: None,
            orphans: Vec::new(),
            retry: None,
            poll_in_flight: false,
            poll_again: false,
            health_in_flight: false,
            first_load_done: false,
            visible: true,
            online: true,
            last_error: None,
            done_tx,
            state_tx,
            directives: directives.clone(),
            config,
        };
        let task = tokio::spawn(actor.run(cmd_rx, done_rx));

        Self {
            handle: SyncHandle {
                commands: cmd_tx,
                state: state_rx,
                directives,
                composers: Arc::new(AtomicU64::new(1)),
            },
            task,
        }
    }

    pub fn handle(&self) -> SyncHandle {
        self.handle.clone()
    }

    /// Close the realtime channel, cancel timers and wait for the engine task
    /// to finish. In-flight requests are not aborted; their completions are
    /// discarded.
    pub async fn stop(self) {
        let (tx, rx) = oneshot::channel();
        if self.handle.commands.send(Command::Stop(tx)).is_ok() {
            let _ = rx.await;
        }
        if let Err(e) = self.task.await {
            warn!("sync engine task ended abnormally: {}", e);
        }
    }
}

/// Results of spawned IO, fed back into the engine loop.
enum Completion {
    /// IO started for a room, tagged with the room generation it belongs to.
    Room {
        generation: u64,
        io: RoomIo,
    },
    Rooms {
        result: Result<Vec<ChannelRow>, RemoteError>,
        reply: Option<Reply<Vec<Room>>>,
    },
    Subscribed {
        epoch: u64,
        result: Result<Subscription, RemoteError>,
    },
    Change {
        epoch: u64,
        event: ChangeEvent,
    },
    ChannelClosed {
        epoch: u64,
    },
    Health {
        epoch: u64,
        state: SubscriptionState,
    },
}

/// Completions that only make sense for the room they were started in.
enum RoomIo {
    InitialPage(Result<Vec<Message>, RemoteError>),
    OlderPage {
        before: MessageId,
        result: Result<Vec<Message>, RemoteError>,
    },
    Polled(Result<Vec<Message>, RemoteError>),
    Persisted {
        composer: Option<ComposerId>,
        temp_id: TempId,
        result: Result<MessageRow, RemoteError>,
        reply: Reply<MessageId>,
    },
    Toggled {
        message_id: MessageId,
        emoji: String,
        action: ToggleAction,
        result: Result<ToggleDone, RemoteError>,
        reply: Reply<ToggleOutcome>,
    },
    ReactionsResynced {
        message_id: MessageId,
        result: Result<Vec<ReactionRow>, RemoteError>,
    },
}

enum ToggleDone {
    Added(ReactionRow),
    Removed(ReactionId),
}

struct ActiveChannel {
    epoch: u64,
    handle: SubscriptionHandle,
    forwarder: JoinHandle<()>,
}

struct Actor {
    config: SyncConfig,
    room_id: RoomId,
    /// Bumped on every room switch.
    generation: u64,
    remote: Arc<dyn RemoteStore>,

    store: MessageStore,
    pages: PaginationController,
    conn: ConnectionManager,
    sends: SendCoordinator,
    viewport: ViewportTracker,

    rooms: Arc<[Room]>,
    snapshot: Arc<[Message]>,
    snapshot_revision: Option<u64>,

    channel: Option<ActiveChannel>,
    /// Epoch of the subscribe handshake currently running, if any.
    subscribing: Option<u64>,
    /// Connect requested while a handshake was still running.
    deferred: Option<u64>,
    /// Subscriptions from superseded handshakes, torn down by the next
    /// connect.
    orphans: Vec<SubscriptionHandle>,
    /// Scheduled reconnect: deadline and the epoch it was scheduled under.
    retry: Option<(Instant, u64)>,
    poll_in_flight: bool,
    poll_again: bool,
    health_in_flight: bool,
    first_load_done: bool,
    visible: bool,
    online: bool,
    last_error: Option<String>,

    done_tx: mpsc::UnboundedSender<Completion>,
    state_tx: watch::Sender<ViewState>,
    directives: broadcast::Sender<ScrollDirective>,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut done_rx: mpsc::UnboundedReceiver<Completion>,
    ) {
        info!(
            room_id = self.room_id,
            username = %self.sends.identity().username,
            "sync engine started"
        );

        self.load_initial();
        self.load_rooms(None);
        if let Some(epoch) = self.conn.begin_connect() {
            self.connect(epoch);
        }
        self.publish();

        let poll_every = self.config.poll_interval;
        let health_every = self.config.health_check_interval;
        let mut poll = interval_at(Instant::now() + poll_every, poll_every);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut health = interval_at(Instant::now() + health_every, health_every);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let retry_due: OptionFuture<_> = self.retry.map(|(at, _)| sleep_until(at)).into();

            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Stop(ack)) => {
                        self.shutdown(&mut done_rx).await;
                        let _ = ack.send(());
                        break;
                    }
                    Some(cmd) => self.on_command(cmd),
                    None => {
                        self.shutdown(&mut done_rx).await;
                        break;
                    }
                },
                Some(done) = done_rx.recv() => self.on_completion(done),
                _ = poll.tick() => self.on_poll_tick(),
                _ = health.tick() => self.on_health_tick(),
                Some(()) = retry_due => self.on_retry_due(),
            }

            self.publish();
        }

        info!(room_id = self.room_id, "sync engine stopped");
    }

    // -- Commands --

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Send {
                composer,
                text,
                reply,
            } => self.send(composer, &text, reply),
            Command::RetrySend { temp_id, reply } => self.retry_send(temp_id, reply),
            Command::DiscardFailed { temp_id } => self.discard_failed(&temp_id),
            Command::ToggleReaction {
                message_id,
                emoji,
                reply,
            } => self.toggle_reaction(message_id, emoji, reply),
            Command::ScrollToBottom => {
                let directive = self.viewport.scroll_to_bottom();
                self.emit(directive);
            }
            Command::ScrollChanged(position) => {
                let update = self.viewport.on_scroll(position);
                if let Some(directive) = update.directive {
                    self.emit(directive);
                }
                if update.at_top {
                    self.load_older();
                }
            }
            Command::LoadOlder => self.load_older(),
            Command::Refresh => {
                info!(room_id = self.room_id, "refresh requested");
                self.load_initial();
            }
            Command::Visibility(visible) => {
                let resumed = visible && !self.visible;
                self.visible = visible;
                if resumed {
                    self.resume("page visible again");
                }
            }
            Command::Network(online) => {
                let resumed = online && !self.online;
                self.online = online;
                if resumed {
                    self.resume("network back online");
                } else if !online {
                    debug!("host reported network offline");
                }
            }
            Command::JoinRoom(room_id) => self.join_room(room_id),
            Command::ListRooms(reply) => self.load_rooms(Some(reply)),
            // Handled by the run loop.
            Command::Stop(_) => {}
        }
    }

    fn send(&mut self, composer: ComposerId, text: &str, reply: Reply<MessageId>) {
        let (temp_id, msg) = match self.sends.prepare(composer, text) {
            Ok(prepared) => prepared,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        let payload = self.sends.payload(&msg);
        let report = self.store.apply(Arrival::Optimistic(msg));
        self.on_arrivals(&report.arrived);

        let remote = self.remote.clone();
        self.spawn_room_io(async move {
            let result = remote.insert_message(payload).await;
            RoomIo::Persisted {
                composer: Some(composer),
                temp_id,
                result,
                reply,
            }
        });
    }

    fn retry_send(&mut self, temp_id: TempId, reply: Reply<MessageId>) {
        let payload = match self.sends.prepare_retry(&mut self.store, &temp_id) {
            Ok(payload) => payload,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        info!(temp_id = %temp_id, "retrying failed send");

        let remote = self.remote.clone();
        self.spawn_room_io(async move {
            let result = remote.insert_message(payload).await;
            RoomIo::Persisted {
                composer: None,
                temp_id,
                result,
                reply,
            }
        });
    }

    fn discard_failed(&mut self, temp_id: &TempId) {
        let key = MessageKey::Temp(temp_id.clone());
        match self.store.get(&key) {
            Some(msg) if msg.is_failed() => {
                self.store.remove_temp(temp_id);
                info!(temp_id = %temp_id, "discarded failed message");
            }
            Some(_) => debug!(temp_id = %temp_id, "not discarding a message that has not failed"),
            None => debug!(temp_id = %temp_id, "nothing to discard"),
        }
    }

    fn toggle_reaction(
        &mut self,
        message_id: MessageId,
        emoji: String,
        reply: Reply<ToggleOutcome>,
    ) {
        let action = match self.sends.begin_toggle(&self.store, message_id, &emoji) {
            Ok(action) => action,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        debug!(message_id, emoji = %emoji, ?action, "toggling reaction");

        let remote = self.remote.clone();
        self.spawn_room_io(async move {
            let result = match &action {
                ToggleAction::Add(new) => remote
                    .insert_reaction(new.clone())
                    .await
                    .map(ToggleDone::Added),
                ToggleAction::Remove(id) => remote
                    .delete_reaction(*id)
                    .await
                    .map(|()| ToggleDone::Removed(*id)),
            };
            RoomIo::Toggled {
                message_id,
                emoji,
                action,
                result,
                reply,
            }
        });
    }

    /// Catch up on anything missed and, if push delivery is down, reconnect
    /// right away instead of waiting for the backoff.
    fn resume(&mut self, reason: &str) {
        info!(state = ?self.conn.state(), "{}; catching up", reason);
        self.catch_up();
        if self.conn.state() == ConnectionState::Degraded {
            if let Some(epoch) = self.conn.begin_connect() {
                self.connect(epoch);
            }
        }
    }

    // -- Rooms --

    /// Leave the current room for `room_id`: drop everything loaded, start
    /// the initial load and move the realtime channel.
    fn join_room(&mut self, room_id: RoomId) {
        if room_id == self.room_id {
            debug!(room_id, "already in room");
            return;
        }
        info!(from = self.room_id, to = room_id, "switching room");

        self.room_id = room_id;
        self.generation += 1;
        self.store.clear();
        self.pages = PaginationController::new(room_id, self.config.page_size);
        let identity = self.sends.identity().clone();
        self.sends = SendCoordinator::new(room_id, identity);
        self.viewport =
            ViewportTracker::new(self.config.bottom_threshold, self.config.top_threshold);
        self.poll_in_flight = false;
        self.poll_again = false;
        self.first_load_done = false;
        self.last_error = None;

        self.load_initial();
        if let Some(epoch) = self.conn.restart() {
            self.connect(epoch);
        }
    }

    fn load_rooms(&mut self, reply: Option<Reply<Vec<Room>>>) {
        let remote = self.remote.clone();
        self.spawn_io(async move {
            let result = remote.fetch_channels().await;
            Completion::Rooms { result, reply }
        });
    }

    fn on_rooms(
        &mut self,
        result: Result<Vec<ChannelRow>, RemoteError>,
        reply: Option<Reply<Vec<Room>>>,
    ) {
        let outcome = match result {
            Ok(rows) => {
                let rooms = decode_rooms(rows);
                debug!(count = rooms.len(), "room list loaded");
                self.rooms = Arc::from(rooms.as_slice());
                Ok(rooms)
            }
            Err(e) => {
                warn!("could not load rooms: {}", e);
                Err(SyncError::ListRooms(e))
            }
        };
        if let Some(reply) = reply {
            let _ = reply.send(outcome);
        }
    }

    // -- Loading --

    fn load_initial(&mut self) {
        let Some(query) = self.pages.begin_initial() else {
            return;
        };
        let remote = self.remote.clone();
        self.spawn_room_io(async move {
            RoomIo::InitialPage(fetch_messages(remote.as_ref(), query).await)
        });
    }

    fn load_older(&mut self) {
        let Some(query) = self.pages.begin_older() else {
            return;
        };
        let PageBound::Before(before) = query.bound else {
            return;
        };
        debug!(before, "loading older page");

        let remote = self.remote.clone();
        self.spawn_room_io(async move {
            let result = fetch_messages(remote.as_ref(), query).await;
            RoomIo::OlderPage { before, result }
        });
    }

    /// Fetch everything newer than the newest known id.
    fn catch_up(&mut self) {
        if !self.pages.is_loaded() {
            if self.pages.initial_failed() {
                self.load_initial();
            }
            return;
        }
        if self.poll_in_flight {
            self.poll_again = true;
            return;
        }
        self.poll_in_flight = true;

        let query = PageQuery {
            room_id: self.room_id,
            bound: PageBound::After(self.store.newest_id().unwrap_or(0)),
            limit: self.pages.page_size(),
        };
        trace!(bound = ?query.bound, "catch-up fetch");
        let remote = self.remote.clone();
        self.spawn_room_io(async move {
            RoomIo::Polled(fetch_messages(remote.as_ref(), query).await)
        });
    }

    // -- Realtime channel --

    /// Start a subscribe handshake under `epoch`. The previous subscription,
    /// if any, is torn down before the new one is requested. While another
    /// handshake is running the attempt waits for it to finish.
    fn connect(&mut self, epoch: u64) {
        self.retry = None;
        if let Some(running) = self.subscribing {
            debug!(epoch, running, "handshake still running; connecting after it");
            self.deferred = Some(epoch);
            return;
        }
        self.subscribing = Some(epoch);
        let mut previous = std::mem::take(&mut self.orphans);
        if let Some(channel) = self.channel.take() {
            channel.forwarder.abort();
            previous.push(channel.handle);
        }
        info!(
            epoch,
            room_id = self.room_id,
            attempt = self.conn.attempt(),
            "connecting realtime channel"
        );

        let remote = self.remote.clone();
        let room_id = self.room_id;
        let handshake = self.config.handshake_timeout;
        self.spawn_io(async move {
            for handle in previous {
                remote.unsubscribe(handle).await;
            }
            let result = match timeout(handshake, remote.subscribe(room_id)).await {
                Ok(result) => result,
                Err(_) => Err(RemoteError::Timeout),
            };
            Completion::Subscribed { epoch, result }
        });
    }

    fn on_subscribed(&mut self, epoch: u64, result: Result<Subscription, RemoteError>) {
        if self.subscribing == Some(epoch) {
            self.subscribing = None;
        }
        if let Some(next) = self.deferred.take() {
            if let Ok(sub) = result {
                debug!(epoch, handle = sub.handle.0, "superseded handshake joined");
                self.orphans.push(sub.handle);
            }
            if next == self.conn.epoch() {
                self.connect(next);
            }
            return;
        }
        let sub = match result {
            Ok(sub) => sub,
            Err(e) => {
                self.channel_failed(epoch, &format!("subscribe failed: {}", e));
                return;
            }
        };

        if !self.conn.on_subscribed(epoch) {
            debug!(epoch, handle = sub.handle.0, "discarding stale subscription");
            let remote = self.remote.clone();
            tokio::spawn(async move { remote.unsubscribe(sub.handle).await });
            return;
        }

        let Subscription { handle, mut events } = sub;
        let done = self.done_tx.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if done.send(Completion::Change { epoch, event }).is_err() {
                    return;
                }
            }
            let _ = done.send(Completion::ChannelClosed { epoch });
        });
        self.channel = Some(ActiveChannel {
            epoch,
            handle,
            forwarder,
        });

        // Anything written between the last fetch and the join.
        self.catch_up();
    }

    fn channel_failed(&mut self, epoch: u64, reason: &str) {
        let Some(delay) = self.conn.on_failure(epoch, reason) else {
            return;
        };
        if let Some(channel) = &self.channel {
            if channel.epoch == epoch {
                channel.forwarder.abort();
            }
        }
        self.retry = Some((Instant::now() + delay, self.conn.epoch()));
    }

    fn on_retry_due(&mut self) {
        let Some((_, epoch)) = self.retry.take() else {
            return;
        };
        if let Some(next) = self.conn.on_retry_due(epoch) {
            self.connect(next);
        }
    }

    fn on_change(&mut self, epoch: u64, event: ChangeEvent) {
        if epoch != self.conn.epoch() || self.conn.state() != ConnectionState::Subscribed {
            trace!(epoch, current = self.conn.epoch(), "dropping event from stale channel");
            return;
        }
        match event {
            ChangeEvent::Insert(ChangeRow::Messages(row)) => {
                for msg in decode_messages(vec![row], self.room_id) {
                    let report = self.store.apply(Arrival::Pushed(msg));
                    self.on_arrivals(&report.arrived);
                }
            }
            ChangeEvent::Insert(ChangeRow::Reactions(row)) => {
                if let Some(reaction) = decode_reaction(row) {
                    let (id, message_id) = (reaction.id, reaction.message_id);
                    if !self.store.add_reaction(reaction) {
                        trace!(
                            reaction_id = id,
                            message_id,
                            "reaction already known or message not loaded"
                        );
                    }
                }
            }
            ChangeEvent::Delete(ChangeRow::Reactions(row)) => match row.id {
                Some(id) => {
                    self.store.remove_reaction(row.message_id, id);
                }
                None => warn!("reaction delete without an id"),
            },
            ChangeEvent::Delete(ChangeRow::Messages(row)) => {
                debug!(message_id = ?row.id, "ignoring message delete");
            }
        }
    }

    // -- Timers --

    fn on_poll_tick(&mut self) {
        if self.conn.wants_polling() {
            self.catch_up();
        }
    }

    fn on_health_tick(&mut self) {
        if self.conn.state() != ConnectionState::Subscribed || self.health_in_flight {
            return;
        }
        let Some(channel) = &self.channel else {
            return;
        };
        let (epoch, handle) = (channel.epoch, channel.handle);
        self.health_in_flight = true;

        let remote = self.remote.clone();
        self.spawn_io(async move {
            let state = remote.subscription_state(handle).await;
            Completion::Health { epoch, state }
        });
    }

    // -- Completions --

    fn on_completion(&mut self, done: Completion) {
        match done {
            Completion::Room { generation, io } if generation == self.generation => {
                self.on_room_io(io)
            }
            Completion::Room { io, .. } => self.on_left_room_io(io),
            Completion::Rooms { result, reply } => self.on_rooms(result, reply),
            Completion::Subscribed { epoch, result } => self.on_subscribed(epoch, result),
            Completion::Change { epoch, event } => self.on_change(epoch, event),
            Completion::ChannelClosed { epoch } => self.channel_failed(epoch, "channel closed"),
            Completion::Health { epoch, state } => {
                self.health_in_flight = false;
                if self.conn.on_health(epoch, state) {
                    if let Some(next) = self.conn.force_reconnect() {
                        self.connect(next);
                    }
                }
            }
        }
    }

    fn on_room_io(&mut self, io: RoomIo) {
        match io {
            RoomIo::InitialPage(result) => self.on_initial_page(result),
            RoomIo::OlderPage { before, result } => self.on_older_page(before, result),
            RoomIo::Polled(result) => self.on_polled(result),
            RoomIo::Persisted {
                composer,
                temp_id,
                result,
                reply,
            } => self.on_persisted(composer, temp_id, result, reply),
            RoomIo::Toggled {
                message_id,
                emoji,
                action,
                result,
                reply,
            } => self.on_toggled(message_id, &emoji, action, result, reply),
            RoomIo::ReactionsResynced { message_id, result } => match result {
                Ok(rows) => {
                    for reaction in rows.into_iter().filter_map(decode_reaction) {
                        if reaction.message_id == message_id {
                            self.store.add_reaction(reaction);
                        }
                    }
                }
                Err(e) => warn!(message_id, "could not resync reactions: {}", e),
            },
        }
    }

    /// The room was left while this IO ran. Writes still answer their
    /// caller; nothing touches the current room's state.
    fn on_left_room_io(&self, io: RoomIo) {
        match io {
            RoomIo::Persisted {
                temp_id,
                result,
                reply,
                ..
            } => {
                debug!(temp_id = %temp_id, "send finished after its room was left");
                let outcome = result
                    .and_then(confirmed_message)
                    .map(|(id, _)| id)
                    .map_err(|e| SyncError::write(WriteAction::SendMessage, e));
                let _ = reply.send(outcome);
            }
            RoomIo::Toggled {
                action,
                result,
                reply,
                ..
            } => {
                let outcome = match (action, result) {
                    (_, Ok(ToggleDone::Added(_)))
                    | (ToggleAction::Add(_), Err(RemoteError::Conflict(_))) => {
                        Ok(ToggleOutcome::Added)
                    }
                    (_, Ok(ToggleDone::Removed(_)))
                    | (ToggleAction::Remove(_), Err(RemoteError::NotFound)) => {
                        Ok(ToggleOutcome::Removed)
                    }
                    (action, Err(e)) => Err(SyncError::write(toggle_write(&action), e)),
                };
                let _ = reply.send(outcome);
            }
            RoomIo::InitialPage(_)
            | RoomIo::OlderPage { .. }
            | RoomIo::Polled(_)
            | RoomIo::ReactionsResynced { .. } => {
                trace!("dropping result for a room no longer shown");
            }
        }
    }

    fn on_initial_page(&mut self, result: Result<Vec<Message>, RemoteError>) {
        match result {
            Ok(page) => {
                self.pages.complete_initial(&mut self.store, page);
                self.last_error = None;
                if !self.first_load_done {
                    self.first_load_done = true;
                    let directive = self.viewport.scroll_to_bottom();
                    self.emit(directive);
                }
            }
            Err(e) => {
                warn!("initial load failed: {}", e);
                self.pages.fail_initial();
                self.last_error = Some(format!("could not load messages: {}", e));
            }
        }
    }

    fn on_older_page(&mut self, before: MessageId, result: Result<Vec<Message>, RemoteError>) {
        match result {
            Ok(page) => {
                if self.pages.complete_older(&mut self.store, before, page) > 0 {
                    self.viewport.on_prepended();
                }
            }
            Err(e) => {
                warn!(before, "loading older messages failed: {}", e);
                self.pages.fail_older(before);
                if !e.is_transient() {
                    self.last_error = Some(format!("could not load older messages: {}", e));
                }
            }
        }
    }

    fn on_polled(&mut self, result: Result<Vec<Message>, RemoteError>) {
        self.poll_in_flight = false;
        match result {
            Ok(batch) => {
                let full = batch.len() as u32 >= self.pages.page_size();
                let report = self.store.apply(Arrival::Polled(batch));
                if !report.arrived.is_empty() {
                    debug!(count = report.arrived.len(), "catch-up picked up new messages");
                }
                self.on_arrivals(&report.arrived);
                if full {
                    self.poll_again = true;
                }
            }
            Err(e) => debug!("catch-up fetch failed: {}", e),
        }
        if std::mem::take(&mut self.poll_again) {
            self.catch_up();
        }
    }

    fn on_persisted(
        &mut self,
        composer: Option<ComposerId>,
        temp_id: TempId,
        result: Result<MessageRow, RemoteError>,
        reply: Reply<MessageId>,
    ) {
        self.sends.finish(composer, &temp_id);

        let (id, message) = match result.and_then(confirmed_message) {
            Ok(confirmed) => confirmed,
            Err(e) => {
                warn!(temp_id = %temp_id, "send failed: {}", e);
                self.store.mark_failed(&temp_id, e.to_string());
                let err = SyncError::write(WriteAction::SendMessage, e);
                self.last_error = Some(err.to_string());
                let _ = reply.send(Err(err));
                return;
            }
        };

        let report = self.store.apply(Arrival::Confirmed {
            temp_id: temp_id.clone(),
            message: message.clone(),
        });
        if report.reconciled == Some(Reconcile::Missing) {
            // Discarded while the insert was in flight; the row exists remotely.
            let report = self.store.apply(Arrival::Polled(vec![message]));
            self.on_arrivals(&report.arrived);
        }
        debug!(temp_id = %temp_id, message_id = id, "send confirmed");
        self.last_error = None;
        let _ = reply.send(Ok(id));
    }

    fn on_toggled(
        &mut self,
        message_id: MessageId,
        emoji: &str,
        action: ToggleAction,
        result: Result<ToggleDone, RemoteError>,
        reply: Reply<ToggleOutcome>,
    ) {
        self.sends.finish_toggle(message_id, emoji);

        let outcome = match (action, result) {
            (_, Ok(ToggleDone::Added(row))) => {
                if let Some(reaction) = decode_reaction(row) {
                    self.store.add_reaction(reaction);
                }
                Ok(ToggleOutcome::Added)
            }
            (_, Ok(ToggleDone::Removed(id))) => {
                self.store.remove_reaction(Some(message_id), id);
                Ok(ToggleOutcome::Removed)
            }
            (ToggleAction::Add(_), Err(RemoteError::Conflict(reason))) => {
                debug!(message_id, emoji, %reason, "reaction already exists remotely; resyncing");
                self.resync_reactions(message_id);
                Ok(ToggleOutcome::Added)
            }
            (ToggleAction::Remove(id), Err(RemoteError::NotFound)) => {
                self.store.remove_reaction(Some(message_id), id);
                Ok(ToggleOutcome::Removed)
            }
            (action, Err(e)) => {
                let write = toggle_write(&action);
                warn!(message_id, emoji, "{} failed: {}", write, e);
                let err = SyncError::write(write, e);
                self.last_error = Some(err.to_string());
                Err(err)
            }
        };
        let _ = reply.send(outcome);
    }

    fn resync_reactions(&mut self, message_id: MessageId) {
        let remote = self.remote.clone();
        self.spawn_room_io(async move {
            let result = remote.fetch_reactions(&[message_id]).await;
            RoomIo::ReactionsResynced { message_id, result }
        });
    }

    // -- Shutdown --

    async fn shutdown(&mut self, done_rx: &mut mpsc::UnboundedReceiver<Completion>) {
        self.conn.close();
        self.retry = None;
        if let Some(channel) = self.channel.take() {
            channel.forwarder.abort();
            self.remote.unsubscribe(channel.handle).await;
        }
        for handle in std::mem::take(&mut self.orphans) {
            self.remote.unsubscribe(handle).await;
        }

        // A handshake still running would leave an orphan subscription.
        // It is bounded by the handshake timeout.
        if self.subscribing.take().is_some() {
            while let Some(done) = done_rx.recv().await {
                if let Completion::Subscribed { result, .. } = done {
                    if let Ok(sub) = result {
                        self.remote.unsubscribe(sub.handle).await;
                    }
                    break;
                }
            }
        }
        self.publish();
    }

    // -- Output --

    fn on_arrivals(&mut self, arrived: &[Arrived]) {
        for record in arrived {
            let mine = record.username == self.sends.identity().username;
            if let Some(directive) = self.viewport.on_arrival(mine) {
                self.emit(directive);
            }
        }
    }

    fn emit(&self, directive: ScrollDirective) {
        // No receivers is fine; the UI may not be listening yet.
        let _ = self.directives.send(directive);
    }

    fn publish(&mut self) {
        let revision = self.store.revision();
        if self.snapshot_revision != Some(revision) {
            self.snapshot = self.store.snapshot();
            self.snapshot_revision = Some(revision);
        }
        let next = ViewState {
            room_id: self.room_id,
            rooms: self.rooms.clone(),
            messages: self.snapshot.clone(),
            username: self.sends.identity().username.clone(),
            is_at_bottom: self.viewport.is_at_bottom(),
            unviewed_count: self.viewport.unviewed_count(),
            loading_initial: self.pages.is_loading_initial(),
            loading_older: self.pages.is_loading_older(),
            has_more_history: self.pages.has_more(),
            last_error: self.last_error.clone(),
            connection_status: self.conn.state(),
        };
        self.state_tx.send_if_modified(|current| {
            if !current.differs_from(&next) {
                return false;
            }
            *current = next;
            true
        });
    }

    fn spawn_room_io<F>(&self, io: F)
    where
        F: Future<Output = RoomIo> + Send + 'static,
    {
        let generation = self.generation;
        self.spawn_io(async move {
            Completion::Room {
                generation,
                io: io.await,
            }
        });
    }

    fn spawn_io<F>(&self, io: F)
    where
        F: Future<Output = Completion> + Send + 'static,
    {
        let done = self.done_tx.clone();
        tokio::spawn(async move {
            let _ = done.send(io.await);
        });
    }
}

fn toggle_write(action: &ToggleAction) -> WriteAction {
    match action {
        ToggleAction::Add(_) => WriteAction::AddReaction,
        ToggleAction::Remove(_) => WriteAction::RemoveReaction,
    }
}

fn confirmed_message(row: MessageRow) -> Result<(MessageId, Message), RemoteError> {
    let id = row
        .id
        .ok_or_else(|| RemoteError::Malformed("insert response without an id".to_string()))?;
    let message = Message::try_from(row).map_err(|e| RemoteError::Malformed(e.to_string()))?;
    Ok((id, message))
}
