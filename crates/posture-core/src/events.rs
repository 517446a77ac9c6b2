//! Cohort event system.
//!
//! The supervisor, sessions and pipeline report lifecycle changes on a
//! broadcast channel. Status displays and tests subscribe to it; nothing in
//! the data path depends on anyone listening.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use posture_types::{DeviceIdentity, Role};

use crate::session::SessionState;

/// Events emitted while a cohort runs.
///
/// All events are serializable for logging and IPC.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum CohortEvent {
    /// A new cohort was spawned. Generations start at 1.
    CohortStarted { generation: u64 },
    /// A session changed state.
    SessionState {
        identity: DeviceIdentity,
        state: SessionState,
    },
    /// Every device produced a live sample for the first time in this cohort.
    CohortReady { generation: u64 },
    /// An export row was appended. `rows` counts rows across restarts.
    RowEmitted { rows: u64 },
    /// A merged live record was published. `records` counts across restarts.
    Published { records: u64 },
    /// A task of the cohort failed; the whole cohort is being torn down.
    CohortFailed {
        generation: u64,
        role: Option<Role>,
        error: String,
    },
    /// Waiting before the next cohort.
    Restarting { backoff: Duration },
    /// The supervisor exited.
    Finished,
}

/// Sender for cohort events.
pub type EventSender = broadcast::Sender<CohortEvent>;

/// Receiver for cohort events.
pub type EventReceiver = broadcast::Receiver<CohortEvent>;

/// Event dispatcher for sending events to multiple receivers.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    sender: EventSender,
}

impl EventDispatcher {
    /// Create a new event dispatcher.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Send an event.
    pub fn send(&self, event: CohortEvent) {
        // Ignore error if no receivers
        let _ = self.sender.send(event);
    }

    /// Get the number of active receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(256)
    }
}
