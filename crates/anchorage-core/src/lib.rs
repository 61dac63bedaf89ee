//! Core domain models, lifecycle state machine and persistence.
//!
//! Provides the strongly-typed anchor primitives every other crate builds
//! on, the [`AnchorStore`] seam with PostgreSQL and in-memory adapters, the
//! [`Clock`] abstraction used for timestamps and backoff, and lifecycle
//! events.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod events;
pub mod models;
pub mod storage;
pub mod store;
pub mod time;

pub use error::{CoreError, Result};
pub use events::{
    AnchorEvent, EventHandler, MulticastEventHandler, NoOpEventHandler, TracingEventHandler,
};
pub use models::{
    AggregationMethod, Anchor, AnchorFilter, AnchorId, AnchorItem, AnchorOrder, AnchorStatus,
    Digest, EventId, IdempotencyKey, Lease, LedgerMessageId, NewAnchor, NewAnchorItem, Proof,
    ProofStep, Side, Transition, Window, DIGEST_LEN,
};
pub use store::{memory::InMemoryAnchorStore, AnchorStore, PostgresAnchorStore};
pub use time::{Clock, RealClock, TestClock};
