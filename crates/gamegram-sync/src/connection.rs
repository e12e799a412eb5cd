use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use gamegram_types::SubscriptionState;

use crate::retry::ReconnectPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Subscribed,
    Degraded,
    Closed,
}

/// Lifecycle of the single realtime subscription.
///
/// Every connect attempt gets a fresh epoch. Completions, channel events and
/// timers carry the epoch they were started under and are ignored once it is
/// stale, so an old channel can never drive the current one.
#[derive(Debug)]
pub struct ConnectionManager {
    state: ConnectionState,
    attempt: u32,
    epoch: u64,
    policy: ReconnectPolicy,
}

impl ConnectionManager {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            state: ConnectionState::Degraded,
            attempt: 0,
            epoch: 0,
            policy,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Polling runs whenever push delivery is not confirmed.
    pub fn wants_polling(&self) -> bool {
        matches!(self.state, ConnectionState::Connecting | ConnectionState::Degraded)
    }

    /// Start a connect attempt from `Degraded`. Returns the epoch the attempt
    /// runs under, or `None` if an attempt is already running or the manager
    /// is closed.
    pub fn begin_connect(&mut self) -> Option<u64> {
        match self.state {
            ConnectionState::Degraded => Some(self.enter_connecting()),
            ConnectionState::Connecting
            | ConnectionState::Subscribed
            | ConnectionState::Closed => None,
        }
    }

    /// Abandon the current channel and connect again right away.
    pub fn force_reconnect(&mut self) -> Option<u64> {
        match self.state {
            ConnectionState::Subscribed | ConnectionState::Degraded => {
                Some(self.enter_connecting())
            }
            ConnectionState::Connecting | ConnectionState::Closed => None,
        }
    }

    /// Abandon whatever attempt or channel is current and connect again with
    /// a fresh attempt counter, as when the room changes.
    pub fn restart(&mut self) -> Option<u64> {
        if self.state == ConnectionState::Closed {
            return None;
        }
        self.attempt = 0;
        Some(self.enter_connecting())
    }

    pub fn on_subscribed(&mut self, epoch: u64) -> bool {
        if epoch != self.epoch || self.state != ConnectionState::Connecting {
            return false;
        }
        info!(epoch, after_attempts = self.attempt, "realtime channel subscribed");
        self.state = ConnectionState::Subscribed;
        self.attempt = 0;
        true
    }

    /// Handshake failure, handshake timeout, or a channel error. Returns the
    /// delay before the next attempt.
    pub fn on_failure(&mut self, epoch: u64, reason: &str) -> Option<Duration> {
        if epoch != self.epoch {
            debug!(epoch, current = self.epoch, "ignoring stale channel failure");
            return None;
        }
        match self.state {
            ConnectionState::Connecting | ConnectionState::Subscribed => {}
            ConnectionState::Degraded | ConnectionState::Closed => return None,
        }
        self.state = ConnectionState::Degraded;
        self.attempt = self.attempt.saturating_add(1);
        let delay = self.policy.delay_for_attempt(self.attempt);
        warn!(
            attempt = self.attempt,
            delay_ms = delay.as_millis() as u64,
            "realtime channel degraded: {}",
            reason
        );
        Some(delay)
    }

    /// A scheduled retry fired. Only the retry scheduled under the current
    /// epoch may start a new attempt.
    pub fn on_retry_due(&mut self, epoch: u64) -> Option<u64> {
        if epoch != self.epoch {
            return None;
        }
        self.begin_connect()
    }

    /// Result of a periodic health check. Returns true if the channel is
    /// silently dead and must be replaced.
    pub fn on_health(&self, epoch: u64, reported: SubscriptionState) -> bool {
        if epoch != self.epoch || self.state != ConnectionState::Subscribed {
            return false;
        }
        if reported == SubscriptionState::Joined {
            return false;
        }
        warn!(epoch, ?reported, "health check found channel not joined");
        true
    }

    pub fn close(&mut self) {
        self.state = ConnectionState::Closed;
        self.epoch += 1;
    }

    fn enter_connecting(&mut self) -> u64 {
        self.epoch += 1;
        self.state = ConnectionState::Connecting;
        self.epoch
    }
}
