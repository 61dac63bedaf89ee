//! Deterministic Merkle aggregation for anchoring windows.
//!
//! A window's `(event_id, event_hash)` pairs are put into canonical order by
//! [`canonicalize`], folded into a root by [`aggregate`], and every leaf's
//! sibling path can later be checked with [`verify_path`]. The same set of
//! pairs always yields the same root regardless of arrival order.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod canonical;
pub mod error;
pub mod proof;
pub mod tree;

pub use canonical::{canonicalize, CanonicalLeaf, CanonicalLeaves, DuplicateHash};
pub use error::{MerkleError, Result};
pub use proof::{compute_root, verify_path, verify_proof};
pub use tree::{aggregate, node_hash, Aggregation};
