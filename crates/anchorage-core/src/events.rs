//! Anchor lifecycle notifications.
//!
//! The poster and reconciler emit an [`AnchorEvent`] for every observable
//! lifecycle step. Subscribers (alerting, metrics exporters, audit sinks)
//! implement [`EventHandler`] and never feed back into the pipeline.
//!
//! ```text
//! ┌────────────┐   Created/Posted/       ┌───────────────────────┐
//! │ Service    │   PublishFailed/        │ MulticastEventHandler │
//! │ Poster     │ ──────────────────────▶ │                       │
//! │ Reconciler │   Confirmed/            └───────────────────────┘
//! └────────────┘   RequiresAttention          │            │
//!                                             ▼            ▼
//!                                   TracingEventHandler  custom sinks
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::models::{AnchorId, Digest, LedgerMessageId};

/// Lifecycle event emitted for an anchor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnchorEvent {
    /// A new anchor was persisted for a window.
    Created {
        /// New anchor.
        anchor_id: AnchorId,
        /// Root digest.
        digest: Digest,
        /// Number of leaves.
        leaf_count: u32,
        /// Creation time.
        at: DateTime<Utc>,
    },

    /// The ledger accepted the anchor's message.
    Posted {
        /// Published anchor.
        anchor_id: AnchorId,
        /// Ledger-issued id.
        message_id: LedgerMessageId,
        /// Endpoint that accepted it.
        endpoint: String,
        /// Failed tries before the success in this cycle.
        failed_tries: u32,
        /// Acceptance time.
        at: DateTime<Utc>,
    },

    /// A publish cycle exhausted every endpoint.
    PublishFailed {
        /// Anchor that failed.
        anchor_id: AnchorId,
        /// Cumulative failed tries after this cycle.
        attempt_count: u32,
        /// Last error observed.
        error: String,
        /// Whether the reconciler will try again.
        will_retry: bool,
        /// Failure time.
        at: DateTime<Utc>,
    },

    /// Ledger finality was observed.
    Confirmed {
        /// Confirmed anchor.
        anchor_id: AnchorId,
        /// Ledger-issued id.
        message_id: LedgerMessageId,
        /// Confirmation time.
        at: DateTime<Utc>,
    },

    /// The anchor reached the attempt ceiling and needs an operator.
    RequiresAttention {
        /// Stuck anchor.
        anchor_id: AnchorId,
        /// Cumulative failed tries.
        attempt_count: u32,
        /// Last recorded error.
        last_error: Option<String>,
    },
}

impl AnchorEvent {
    /// Anchor the event refers to.
    pub const fn anchor_id(&self) -> AnchorId {
        match self {
            Self::Created { anchor_id, .. }
            | Self::Posted { anchor_id, .. }
            | Self::PublishFailed { anchor_id, .. }
            | Self::Confirmed { anchor_id, .. }
            | Self::RequiresAttention { anchor_id, .. } => *anchor_id,
        }
    }
}

/// Subscriber for anchor lifecycle events.
///
/// Handlers must not block the pipeline; failures are logged inside the
/// handler and never propagated.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync + std::fmt::Debug {
    /// Handles one event.
    async fn handle_event(&self, event: AnchorEvent);
}

/// Handler that discards every event.
#[derive(Debug, Default)]
pub struct NoOpEventHandler;

#[async_trait::async_trait]
impl EventHandler for NoOpEventHandler {
    async fn handle_event(&self, _event: AnchorEvent) {}
}

/// Handler that writes each event to the tracing subscriber.
///
/// `PublishFailed` and `RequiresAttention` are logged at `warn` so they reach
/// operator alerting.
#[derive(Debug, Default)]
pub struct TracingEventHandler;

#[async_trait::async_trait]
impl EventHandler for TracingEventHandler {
    async fn handle_event(&self, event: AnchorEvent) {
        match &event {
            AnchorEvent::Created { anchor_id, digest, leaf_count, .. } => {
                info!(anchor_id = %anchor_id, digest = %digest, leaf_count, "anchor created");
            },
            AnchorEvent::Posted { anchor_id, message_id, endpoint, failed_tries, .. } => {
                info!(
                    anchor_id = %anchor_id,
                    message_id = %message_id,
                    endpoint = %endpoint,
                    failed_tries,
                    "anchor posted"
                );
            },
            AnchorEvent::PublishFailed { anchor_id, attempt_count, error, will_retry, .. } => {
                warn!(
                    anchor_id = %anchor_id,
                    attempt_count,
                    will_retry,
                    error = %error,
                    "anchor publication failed"
                );
            },
            AnchorEvent::Confirmed { anchor_id, message_id, .. } => {
                info!(anchor_id = %anchor_id, message_id = %message_id, "anchor confirmed");
            },
            AnchorEvent::RequiresAttention { anchor_id, attempt_count, last_error } => {
                warn!(
                    anchor_id = %anchor_id,
                    attempt_count,
                    last_error = last_error.as_deref().unwrap_or("none"),
                    "anchor exhausted automatic retries and requires manual reconciliation"
                );
            },
        }
    }
}

/// Forwards every event to all registered subscribers concurrently.
#[derive(Debug, Clone, Default)]
pub struct MulticastEventHandler {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl MulticastEventHandler {
    /// Creates a handler with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a subscriber.
    pub fn add_subscriber(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    /// Number of subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.handlers.len()
    }
}

#[async_trait::async_trait]
impl EventHandler for MulticastEventHandler {
    async fn handle_event(&self, event: AnchorEvent) {
        let deliveries = self.handlers.iter().map(|handler| {
            let event = event.clone();
            async move { handler.handle_event(event).await }
        });
        futures::future::join_all(deliveries).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Debug, Default)]
    struct CountingHandler {
        seen: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl EventHandler for CountingHandler {
        async fn handle_event(&self, _event: AnchorEvent) {
            self.seen.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn attention_event() -> AnchorEvent {
        AnchorEvent::RequiresAttention {
            anchor_id: AnchorId::new(),
            attempt_count: 10,
            last_error: Some("ledger rejected payload".into()),
        }
    }

    #[tokio::test]
    async fn multicast_reaches_every_subscriber() {
        let first = Arc::new(CountingHandler::default());
        let second = Arc::new(CountingHandler::default());
        let mut multicast = MulticastEventHandler::new();
        multicast.add_subscriber(first.clone());
        multicast.add_subscriber(second.clone());
        multicast.add_subscriber(Arc::new(TracingEventHandler));

        multicast.handle_event(attention_event()).await;

        assert_eq!(multicast.subscriber_count(), 3);
        assert_eq!(first.seen.load(Ordering::SeqCst), 1);
        assert_eq!(second.seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn events_serialize_with_kind_tag() {
        let event = attention_event();
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["kind"], "requires_attention");
        assert_eq!(json["attempt_count"], 10);
    }
}
