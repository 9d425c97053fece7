//! Engine notifications.
//!
//! Every notification is broadcast to zero or more subscribers. Publishing
//! never fails: with no subscriber the event is dropped, and a subscriber
//! that falls behind sees `RecvError::Lagged` rather than blocking the engine.
//!
//! ```ignore
//! let mut rx = engine.subscribe();
//! tokio::spawn(async move {
//!     while let Ok(event) = rx.recv().await {
//!         println!("{}", event.kind());
//!     }
//! });
//! ```

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::error::ShelveError;
use crate::types::ShelvesetResult;

/// Default channel capacity.
const DEFAULT_CAPACITY: usize = 256;

/// A notification raised by the engine.
#[derive(Debug, Clone)]
pub enum ShelveEvent {
    /// The schedule was armed.
    Started,
    /// The schedule was disarmed.
    Stopped,
    /// One workspace attempt finished, successfully or not.
    ShelvesetCreated(ShelvesetResult),
    /// The backend connection could not be resolved; the schedule is stopped.
    ConnectionError(Arc<ShelveError>),
    /// A run failed outside any single workspace attempt.
    ShelvesetError(Arc<ShelveError>),
}

impl ShelveEvent {
    /// Event type name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::ShelvesetCreated(_) => "shelveset_created",
            Self::ConnectionError(_) => "connection_error",
            Self::ShelvesetError(_) => "shelveset_error",
        }
    }
}

/// Broadcast channel carrying [`ShelveEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ShelveEvent>,
}

impl EventBus {
    /// Create a new event bus.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(DEFAULT_CAPACITY);
        Self { tx }
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: ShelveEvent) {
        // Ignore send errors (no receivers)
        let _ = self.tx.send(event);
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ShelveEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
