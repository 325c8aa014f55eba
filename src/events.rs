//! Process-local pub/sub for the outbox event surface.
//!
//! No persistence, no cross-process delivery: this exists so in-process
//! observers (tests, a future streaming endpoint) can watch activities pass
//! through the pipeline without polling the store.

use serde_json::Value;
use tokio::sync::broadcast;

/// One activity's passage through the pipeline. `activity` is the full,
/// normalized activity document as stored; `object` is the updated object a
/// mutating handler contributed (the `Note` a `Create` just stored, the
/// merged object an `Update` produced, the resolved object a `Like`
/// embedded), or the fresh collection summary for a synthetic collection
/// `Update`. Verbs that mutate nothing (`Follow`, `Announce`, ...) leave it
/// `None` — there is no updated object to hand an observer.
#[derive(Debug, Clone)]
pub struct OutboxEvent {
    pub actor: String,
    pub activity: Value,
    pub object: Option<Value>,
}

#[derive(Clone)]
pub struct OutboxEvents {
    sender: broadcast::Sender<OutboxEvent>,
}

impl OutboxEvents {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OutboxEvent> {
        self.sender.subscribe()
    }

    /// Best-effort publish: a full channel or zero subscribers is not an
    /// error, the pipeline's own success does not depend on anyone
    /// listening.
    pub fn publish(&self, event: OutboxEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for OutboxEvents {
    fn default() -> Self {
        Self::new()
    }
}
