//! Source of event hashes observed during a window.

use anchorage_core::{Digest, EventId, Window};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One hashed event as delivered by the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowEvent {
    /// Identifier of the event.
    pub event_id: EventId,
    /// SHA-256 of the event's canonical encoding.
    pub event_hash: Digest,
    /// When the event was observed.
    pub observed_at: DateTime<Utc>,
}

/// Supplies the events of a window.
///
/// Delivery is at-least-once: the same event may appear more than once and
/// implementations are not required to filter by window bounds.
#[async_trait]
pub trait EventSource: Send + Sync + std::fmt::Debug {
    /// Fetches every event observed in `window`.
    async fn fetch_window(&self, window: &Window) -> Result<Vec<WindowEvent>>;
}
