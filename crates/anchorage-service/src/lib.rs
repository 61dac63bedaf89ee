//! Anchoring of event windows and inclusion verification.
//!
//! [`AnchorService`] is the caller-facing surface. `trigger_anchor` pulls a
//! window from an [`EventSource`], canonicalizes and aggregates the hashes,
//! persists the anchor with one proof per leaf and optionally publishes it
//! right away. Scheduling is left to the caller; [`Window::daily`] and
//! [`Window::previous_day`] build the usual daily windows.
//!
//! [`Window::daily`]: anchorage_core::Window::daily
//! [`Window::previous_day`]: anchorage_core::Window::previous_day

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod service;
pub mod source;
pub mod verify;

pub use config::{Config, LEDGER_NETWORKS};
pub use error::{AnchorError, Result};
pub use service::{AnchorService, DuplicatePolicy, ServiceConfig, TriggerOutcome};
pub use source::{EventSource, WindowEvent};
pub use verify::{MismatchReason, VerificationOutcome, VerificationReport, Verifier};
