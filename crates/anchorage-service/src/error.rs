//! Service-level error taxonomy with stable codes.
//!
//! Codes are grouped by who has to act:
//!
//! - `E1xxx` input problems the caller can fix
//! - `E2xxx` ledger publication problems
//! - `E3xxx` system problems that need an operator

use anchorage_core::{AnchorId, CoreError, Digest};
use anchorage_ledger::LedgerError;
use anchorage_merkle::MerkleError;
use thiserror::Error;

/// Result type alias using `AnchorError`.
pub type Result<T> = std::result::Result<T, AnchorError>;

/// Errors surfaced by [`AnchorService`](crate::AnchorService).
#[derive(Debug, Error)]
pub enum AnchorError {
    // Input errors (E1001-E1005)
    /// The window produced no leaves; nothing is anchored (E1001).
    #[error("[E1001] Empty window: {window} contains no events")]
    EmptyWindow {
        /// Window that was empty.
        window: String,
    },

    /// Window bounds are unusable (E1002).
    #[error("[E1002] Invalid window: {0}")]
    InvalidWindow(String),

    /// Distinct events share a hash and the policy rejects that (E1003).
    #[error("[E1003] Duplicate event hash: {event_hash} shared by {events} events")]
    DuplicateEventHash {
        /// Shared hash.
        event_hash: Digest,
        /// Number of distinct events sharing it.
        events: usize,
    },

    /// Anchor does not exist (E1004).
    #[error("[E1004] Anchor not found: {anchor_id}")]
    AnchorNotFound {
        /// Anchor requested.
        anchor_id: AnchorId,
    },

    /// Malformed request (E1005).
    #[error("[E1005] Invalid input: {0}")]
    InvalidInput(String),

    // Ledger errors (E2001-E2002)
    /// A ledger call or publish cycle failed (E2001).
    #[error("[E2001] Ledger error: {0}")]
    Ledger(LedgerError),

    /// Another worker holds the anchor (E2002).
    #[error("[E2002] Lease conflict: anchor {anchor_id} is being processed elsewhere")]
    LeaseConflict {
        /// Contended anchor.
        anchor_id: AnchorId,
    },

    // System errors (E3001-E3004)
    /// Re-aggregation produced a different root for an existing key (E3001).
    ///
    /// Indicates non-determinism upstream and is never resolved automatically.
    #[error("[E3001] Digest mismatch for {idempotency_key}: stored {stored}, computed {computed}")]
    DigestMismatch {
        /// Key of the existing anchor.
        idempotency_key: String,
        /// Digest already recorded.
        stored: Digest,
        /// Digest produced by this run.
        computed: Digest,
    },

    /// Store operation failed; the anchor keeps its prior state (E3002).
    #[error("[E3002] Persistence error: {0}")]
    Persistence(CoreError),

    /// The event source could not deliver the window (E3003).
    #[error("[E3003] Event source error: {0}")]
    Source(String),

    /// Unexpected internal failure (E3004).
    #[error("[E3004] Internal error: {0}")]
    Internal(String),
}

impl AnchorError {
    /// Creates an event source error.
    pub fn source(message: impl Into<String>) -> Self {
        Self::Source(message.into())
    }

    /// Creates an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Returns the error code (E1001-E3004).
    pub const fn code(&self) -> &'static str {
        match self {
            Self::EmptyWindow { .. } => "E1001",
            Self::InvalidWindow(_) => "E1002",
            Self::DuplicateEventHash { .. } => "E1003",
            Self::AnchorNotFound { .. } => "E1004",
            Self::InvalidInput(_) => "E1005",
            Self::Ledger(_) => "E2001",
            Self::LeaseConflict { .. } => "E2002",
            Self::DigestMismatch { .. } => "E3001",
            Self::Persistence(_) => "E3002",
            Self::Source(_) => "E3003",
            Self::Internal(_) => "E3004",
        }
    }

    /// Returns whether repeating the call later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Ledger(error) => error.is_retryable(),
            Self::Persistence(error) => error.is_retryable(),
            Self::LeaseConflict { .. } | Self::Source(_) => true,
            Self::EmptyWindow { .. }
            | Self::InvalidWindow(_)
            | Self::DuplicateEventHash { .. }
            | Self::AnchorNotFound { .. }
            | Self::InvalidInput(_)
            | Self::DigestMismatch { .. }
            | Self::Internal(_) => false,
        }
    }
}

impl From<CoreError> for AnchorError {
    fn from(error: CoreError) -> Self {
        match error {
            CoreError::DigestMismatch { idempotency_key, stored, computed } => {
                Self::DigestMismatch { idempotency_key, stored, computed }
            },
            CoreError::LeaseConflict { anchor_id, .. } => Self::LeaseConflict { anchor_id },
            CoreError::InvalidInput(message) => Self::InvalidInput(message),
            other => Self::Persistence(other),
        }
    }
}

impl From<LedgerError> for AnchorError {
    fn from(error: LedgerError) -> Self {
        match error {
            LedgerError::LeaseConflict { anchor_id } => Self::LeaseConflict { anchor_id },
            LedgerError::Store(core) => Self::from(core),
            other => Self::Ledger(other),
        }
    }
}

impl From<MerkleError> for AnchorError {
    fn from(error: MerkleError) -> Self {
        match error {
            MerkleError::EmptyWindow => Self::EmptyWindow { window: "window".to_string() },
            MerkleError::TooManyLeaves { count } => {
                Self::InvalidInput(format!("{count} leaves exceed the addressable range"))
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use anchorage_core::AnchorStatus;

    use super::*;

    #[test]
    fn error_codes_are_grouped_by_category() {
        assert_eq!(AnchorError::EmptyWindow { window: "w".into() }.code(), "E1001");
        assert_eq!(AnchorError::InvalidWindow("w".into()).code(), "E1002");
        assert_eq!(AnchorError::AnchorNotFound { anchor_id: AnchorId::new() }.code(), "E1004");
        assert_eq!(AnchorError::Ledger(LedgerError::configuration("x")).code(), "E2001");
        assert_eq!(AnchorError::source("down").code(), "E3003");
    }

    #[test]
    fn digest_mismatch_is_surfaced_not_wrapped() {
        let error = AnchorError::from(CoreError::DigestMismatch {
            idempotency_key: "k".into(),
            stored: Digest::new([1; 32]),
            computed: Digest::new([2; 32]),
        });

        assert_eq!(error.code(), "E3001");
        assert!(!error.is_retryable());
        assert!(error.to_string().starts_with("[E3001]"));
    }

    #[test]
    fn lease_conflicts_map_from_both_layers() {
        let anchor_id = AnchorId::new();

        let from_core = AnchorError::from(CoreError::LeaseConflict {
            anchor_id,
            expected: AnchorStatus::Pending,
        });
        let from_ledger = AnchorError::from(LedgerError::LeaseConflict { anchor_id });

        assert!(matches!(from_core, AnchorError::LeaseConflict { .. }));
        assert!(matches!(from_ledger, AnchorError::LeaseConflict { .. }));
    }

    #[test]
    fn retryability_follows_the_inner_error() {
        assert!(AnchorError::from(CoreError::Database("reset".into())).is_retryable());
        assert!(AnchorError::from(LedgerError::transient("http://a", "refused")).is_retryable());
        assert!(!AnchorError::from(LedgerError::rejected("http://a", "bad")).is_retryable());
        assert!(!AnchorError::EmptyWindow { window: "w".into() }.is_retryable());
    }
}
