//! Publication of anchor digests to an append-only ledger.
//!
//! # Architecture
//!
//! Publication is split between two cooperating components that share the
//! anchor store's compare-and-set lease:
//!
//! 1. **Poster** - takes the POSTING lease, posts the payload to each
//!    endpoint in priority order with bounded retries and records POSTED or
//!    FAILED
//! 2. **Reconciler** - periodically reclaims abandoned leases, re-publishes
//!    retryable anchors, flags exhausted ones and checks confirmation
//!
//! The ledger itself sits behind [`LedgerClient`]; [`HttpLedgerClient`] is
//! the production adapter.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use anchorage_core::{AnchorId, InMemoryAnchorStore, RealClock};
//! use anchorage_ledger::{ClientConfig, HttpLedgerClient, Poster, PosterConfig};
//!
//! # async fn example(anchor_id: AnchorId) -> anchorage_ledger::Result<()> {
//! let ledger = HttpLedgerClient::new("https://gateway.example", ClientConfig::default())?;
//! let poster = Poster::new(
//!     Arc::new(InMemoryAnchorStore::new()),
//!     vec![Arc::new(ledger)],
//!     PosterConfig::default(),
//!     Arc::new(RealClock::new()),
//! )?;
//!
//! let receipt = poster.publish(anchor_id).await?;
//! println!("posted as {}", receipt.message_id);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod error;
pub mod poster;
pub mod reconciler;
pub mod retry;

pub use client::{AnchorPayload, ClientConfig, ConfirmationStatus, HttpLedgerClient, LedgerClient};
pub use error::{ErrorCategory, LedgerError, Result};
pub use poster::{
    ensure_liveness_exceeds_cycle, Poster, PosterConfig, PublishReceipt, DEFAULT_TAG,
};
pub use reconciler::{ReconcileReport, Reconciler, ReconcilerConfig, ABANDONED_ERROR};
pub use retry::{BackoffStrategy, RetryDecision, RetryPolicy};

/// Default per-call timeout in seconds.
pub const DEFAULT_CALL_TIMEOUT_SECONDS: u64 = 30;

/// Default age in seconds after which a POSTING lease is reclaimed.
pub const DEFAULT_POSTING_LIVENESS_SECONDS: u64 = 300;
