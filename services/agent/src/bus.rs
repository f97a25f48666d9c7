//! In-process event bus with typed topics.
//!
//! A single `tokio::sync::broadcast` channel carries a closed set of
//! events. Subscribers that lag simply drop old events (the cache is
//! authoritative; bus events are change notifications, not state).

use pb_protocol::{Device, Push};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use crate::state::AgentState;

const CAP: usize = 256;

/// Everything that can be published on the bus.
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// Pipeline-1 observed a new or modified push.
    Pipeline1Push {
        push: Push,
        /// Set for runs where auto-open must not fire (recovery, or a
        /// reconnect with `auto_open_links_on_reconnect = false`).
        suppress_auto_open: bool,
    },
    /// The session snapshot changed (bootstrap, background refresh,
    /// direct push arrival).
    SessionUpdated,
    /// The device list was re-fetched after a device tickle.
    DevicesUpdated(Vec<Device>),
    /// The agent lifecycle state changed.
    StateChanged { from: AgentState, to: AgentState },
    /// An encrypted push could not be decrypted; the envelope was kept.
    DecryptDiagnostic {
        iden: Option<String>,
        reason: String,
    },
}

/// Shared handle to the bus.
#[derive(Clone)]
pub struct Bus {
    tx: Arc<broadcast::Sender<BusEvent>>,
}

impl Bus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CAP);
        Self { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }

    /// Publish to all current subscribers. A subscriber processing (or
    /// panicking in) its own task can never affect the others.
    pub fn publish(&self, event: BusEvent) {
        match self.tx.send(event) {
            Ok(n) => debug!(receivers = n, "bus event published"),
            Err(_) => debug!("bus event dropped (no subscribers)"),
        }
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}
