use std::time::Duration;

use crate::retry::ReconnectPolicy;

/// Tunables for one [`crate::SyncEngine`].
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Rows per page for the initial load, older pages and poll batches.
    pub page_size: u32,
    /// Polling fallback cadence while the channel is not subscribed.
    pub poll_interval: Duration,
    /// How often a subscribed channel is checked for silent death.
    pub health_check_interval: Duration,
    /// Upper bound on a subscribe handshake.
    pub handshake_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    /// Distance from the bottom, in pixels, still treated as "at bottom".
    pub bottom_threshold: f64,
    /// Scroll offset at or below which older history is requested.
    pub top_threshold: f64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: 50,
            poll_interval: Duration::from_secs(1),
            health_check_interval: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
            bottom_threshold: 5.0,
            top_threshold: 0.0,
        }
    }
}
