//! Test infrastructure for deterministic pipeline tests.
//!
//! Provides scripted ledger endpoints, an in-memory event source, a
//! recording event handler, fixture builders, proptest strategies,
//! isolated PostgreSQL databases and a [`TestEnv`] that wires the whole
//! pipeline over virtual time.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod database;
pub mod env;
pub mod events;
pub mod fixtures;
pub mod ledger;
pub mod source;
pub mod strategies;

pub use anchorage_core::TestClock;
pub use database::TestDatabase;
pub use env::{TestEnv, TestEnvBuilder, FAILOVER_ENDPOINT, PRIMARY_ENDPOINT};
pub use events::RecordingEventHandler;
pub use ledger::{ConfirmStep, PostStep, ScriptedLedger};
pub use source::StaticEventSource;
pub use strategies::proptest_config;
