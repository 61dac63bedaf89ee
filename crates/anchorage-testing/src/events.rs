//! Event handler that records lifecycle events for later assertions.

use std::sync::Mutex;

use anchorage_core::{AnchorEvent, AnchorId, EventHandler};
use async_trait::async_trait;

/// Records every event it receives, in order.
#[derive(Debug, Default)]
pub struct RecordingEventHandler {
    events: Mutex<Vec<AnchorEvent>>,
}

impl RecordingEventHandler {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the recorded events.
    pub fn events(&self) -> Vec<AnchorEvent> {
        self.lock().clone()
    }

    /// Events concerning `anchor_id`.
    pub fn events_for(&self, anchor_id: AnchorId) -> Vec<AnchorEvent> {
        self.lock().iter().filter(|event| event.anchor_id() == anchor_id).cloned().collect()
    }

    /// Number of recorded events matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&AnchorEvent) -> bool) -> usize {
        self.lock().iter().filter(|event| predicate(event)).count()
    }

    /// Drops everything recorded so far.
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<AnchorEvent>> {
        self.events.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl EventHandler for RecordingEventHandler {
    async fn handle_event(&self, event: AnchorEvent) {
        self.lock().push(event);
    }
}
