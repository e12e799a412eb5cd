//! Client-side message synchronization for a realtime chat room.
//!
//! [`SyncEngine`] owns the canonical message list for one room and keeps it
//! consistent across the initial page load, backward pagination, realtime
//! pushes, a polling fallback and optimistic local sends. The presentation
//! layer talks to it through a [`SyncHandle`] and renders [`ViewState`].

pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod handle;
pub mod pagination;
pub mod reactions;
pub mod retry;
pub mod send;
pub mod store;
pub mod viewport;

pub use config::SyncConfig;
pub use connection::{ConnectionManager, ConnectionState};
pub use engine::SyncEngine;
pub use error::{SyncError, WriteAction};
pub use handle::{Composer, SyncHandle, ToggleOutcome, ViewState};
pub use pagination::PaginationController;
pub use reactions::{ReactionGroup, summarize};
pub use retry::ReconnectPolicy;
pub use send::{ComposerId, SendCoordinator, ToggleAction};
pub use store::{Arrival, MergeReport, MessageStore, Reconcile, Upsert};
pub use viewport::{ScrollDirective, ScrollPosition, ScrollUpdate, ViewportTracker};
