//! Error types for ledger publication and confirmation.
//!
//! Failures of a single ledger call are classified so the poster can decide
//! between retrying the same endpoint and failing over. Cycle-level outcomes
//! (exhaustion, lease conflicts) are separate variants so the reconciler can
//! count them without string matching.

use std::{fmt, time::Duration};

use anchorage_core::{AnchorId, AnchorStatus, CoreError};
use thiserror::Error;

/// Result type alias for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Error conditions for publication against one or more ledger endpoints.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Connection-level or server-side failure worth retrying.
    #[error("transient ledger failure at {endpoint}: {message}")]
    Transient {
        /// Endpoint that failed.
        endpoint: String,
        /// Failure description.
        message: String,
    },

    /// The call did not complete within the call timeout.
    #[error("ledger call to {endpoint} timed out after {timeout_ms}ms")]
    Timeout {
        /// Endpoint that stalled.
        endpoint: String,
        /// Timeout that elapsed.
        timeout_ms: u64,
    },

    /// The ledger refused the message or answered unintelligibly.
    ///
    /// Never retried on the same endpoint.
    #[error("ledger at {endpoint} rejected the request: {reason}")]
    Rejected {
        /// Endpoint that rejected.
        endpoint: String,
        /// Rejection reason.
        reason: String,
    },

    /// Every endpoint was tried and none accepted the message.
    #[error("publication failed after {failed_tries} tries: {last_error}")]
    Exhausted {
        /// Failed tries in this cycle.
        failed_tries: u32,
        /// Last error observed.
        last_error: String,
    },

    /// The anchor reached the attempt ceiling and waits for an operator.
    #[error("anchor {anchor_id} exhausted its {attempt_count} attempts")]
    AttemptsExhausted {
        /// Anchor that is stuck.
        anchor_id: AnchorId,
        /// Cumulative failed tries.
        attempt_count: u32,
    },

    /// Another worker holds or already moved the anchor.
    #[error("anchor {anchor_id} is leased elsewhere")]
    LeaseConflict {
        /// Contended anchor.
        anchor_id: AnchorId,
    },

    /// Confirmation was requested for an anchor that was never posted.
    #[error("anchor {anchor_id} is {status}, not posted")]
    NotPublished {
        /// Anchor queried.
        anchor_id: AnchorId,
        /// Its current status.
        status: AnchorStatus,
    },

    /// Anchor store failure.
    #[error("anchor store error: {0}")]
    Store(CoreError),

    /// Invalid client or poster configuration.
    #[error("invalid ledger configuration: {message}")]
    Configuration {
        /// Configuration error message.
        message: String,
    },
}

impl LedgerError {
    /// Creates a transient error.
    pub fn transient(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient { endpoint: endpoint.into(), message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            endpoint: endpoint.into(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Creates a rejection error.
    pub fn rejected(endpoint: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Rejected { endpoint: endpoint.into(), reason: reason.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Whether retrying the same endpoint may succeed.
    ///
    /// Only connection-level failures qualify. Rejections fail over, and
    /// cycle-level outcomes are decided by the reconciler.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transient { .. } | Self::Timeout { .. } => true,
            Self::Store(error) => error.is_retryable(),
            Self::Rejected { .. }
            | Self::Exhausted { .. }
            | Self::AttemptsExhausted { .. }
            | Self::LeaseConflict { .. }
            | Self::NotPublished { .. }
            | Self::Configuration { .. } => false,
        }
    }

    /// Whether another worker holds the anchor.
    pub const fn is_lease_conflict(&self) -> bool {
        matches!(self, Self::LeaseConflict { .. })
    }
}

impl From<CoreError> for LedgerError {
    fn from(error: CoreError) -> Self {
        match error {
            CoreError::LeaseConflict { anchor_id, .. } => Self::LeaseConflict { anchor_id },
            other => Self::Store(other),
        }
    }
}

/// Category of ledger error for logs and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Connectivity, timeouts and 5xx.
    Network,
    /// Ledger refused the request.
    Rejected,
    /// Publication gave up.
    Exhausted,
    /// Lost a compare-and-set race.
    Lease,
    /// Anchor store failures.
    Store,
    /// Configuration problems.
    Configuration,
}

impl From<&LedgerError> for ErrorCategory {
    fn from(error: &LedgerError) -> Self {
        match error {
            LedgerError::Transient { .. } | LedgerError::Timeout { .. } => Self::Network,
            LedgerError::Rejected { .. } => Self::Rejected,
            LedgerError::Exhausted { .. } | LedgerError::AttemptsExhausted { .. } => {
                Self::Exhausted
            },
            LedgerError::LeaseConflict { .. } | LedgerError::NotPublished { .. } => Self::Lease,
            LedgerError::Store(_) => Self::Store,
            LedgerError::Configuration { .. } => Self::Configuration,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Rejected => write!(f, "rejected"),
            Self::Exhausted => write!(f, "exhausted"),
            Self::Lease => write!(f, "lease"),
            Self::Store => write!(f, "store"),
            Self::Configuration => write!(f, "configuration"),
        }
    }
}
