//! Error types for aggregation.

use thiserror::Error;

/// Result type for aggregation operations.
pub type Result<T> = std::result::Result<T, MerkleError>;

/// Errors produced while building a tree or resolving proofs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MerkleError {
    /// The window contained no leaves.
    ///
    /// Callers skip anchoring instead of publishing a sentinel digest.
    #[error("window contains no leaves")]
    EmptyWindow,

    /// More leaves than a `u32` leaf index can address.
    #[error("{count} leaves exceed the addressable leaf range")]
    TooManyLeaves {
        /// Number of leaves supplied.
        count: usize,
    },
}
