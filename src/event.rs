use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Capacity of the notification channel. Subscribers that fall further
/// behind than this see `Lagged` and skip ahead.
const BUS_CAPACITY: usize = 64;

/// A notification published by the host application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostEvent {
    /// A generation is about to run. `kind` is the host's own name for it.
    GenerationStarted { kind: String },
    /// The outbound request payload has been finalized and is being sent.
    RequestDispatched,
    /// A generation finished (successfully or not).
    GenerationEnded { message_id: Option<u64> },
    /// A cooperating companion process finished its post-turn work.
    CompanionCompleted,
}

/// The host's notification bus.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<HostEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publish to every current subscriber. Publishing with no subscribers
    /// is not an error.
    pub fn publish(&self, event: HostEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.tx.subscribe()
    }
}
