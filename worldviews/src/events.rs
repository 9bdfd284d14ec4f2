//! Outbound change notifications for live views.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangedField {
    Created,
    DetailedContent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterpretationEvent {
    pub article_id: i64,
    pub persona_id: i64,
    pub changed_field: ChangedField,
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<InterpretationEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InterpretationEvent> {
        self.sender.subscribe()
    }

    /// Fire and forget; having no subscriber is not an error
    pub fn emit(&self, event: InterpretationEvent) {
        debug!(
            article_id = event.article_id,
            persona_id = event.persona_id,
            field = ?event.changed_field,
            "interpretation event"
        );
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
