//! Error types for domain validation and persistence.
//!
//! Repository failures are mapped from `sqlx` into a small taxonomy so that
//! callers can tell a lost compare-and-set race apart from a broken database.

use thiserror::Error;

use crate::models::{AnchorId, AnchorStatus, Digest};

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for model validation and store operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(String),

    /// Entity not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Constraint violation.
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The requested edge is not part of the anchor state machine.
    #[error("invalid transition for anchor {anchor_id}: {from} -> {to}")]
    InvalidTransition {
        /// Anchor the transition targeted.
        anchor_id: AnchorId,
        /// Status the caller expected.
        from: AnchorStatus,
        /// Status the caller requested.
        to: AnchorStatus,
    },

    /// Another worker changed the anchor first.
    ///
    /// The compare-and-set found the anchor in a status other than
    /// `expected`. Callers skip the anchor.
    #[error("anchor {anchor_id} is no longer {expected}")]
    LeaseConflict {
        /// Anchor that was contended.
        anchor_id: AnchorId,
        /// Status the caller expected.
        expected: AnchorStatus,
    },

    /// Re-aggregating a window produced a different root.
    ///
    /// Signals non-determinism upstream. Never resolved automatically.
    #[error("digest mismatch for {idempotency_key}: stored {stored}, computed {computed}")]
    DigestMismatch {
        /// Key of the existing anchor.
        idempotency_key: String,
        /// Digest already recorded.
        stored: Digest,
        /// Digest produced by this run.
        computed: Digest,
    },
}

impl CoreError {
    /// Creates an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Creates a not found error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Whether the error means another worker holds the anchor.
    pub const fn is_lease_conflict(&self) -> bool {
        matches!(self, Self::LeaseConflict { .. })
    }

    /// Whether retrying the same operation later may succeed.
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Database(_) => true,
            Self::NotFound(_)
            | Self::ConstraintViolation(_)
            | Self::InvalidInput(_)
            | Self::InvalidTransition { .. }
            | Self::LeaseConflict { .. }
            | Self::DigestMismatch { .. } => false,
        }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("requested row not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::ConstraintViolation(format!("unique constraint violation: {db_err}"))
            },
            sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation() => {
                Self::ConstraintViolation(format!("foreign key constraint violation: {db_err}"))
            },
            sqlx::Error::Database(db_err) if db_err.is_check_violation() => {
                Self::ConstraintViolation(format!("check constraint violation: {db_err}"))
            },
            _ => Self::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Database(format!("stored proof could not be decoded: {err}"))
    }
}
