//! Binary Merkle tree construction with proofs recorded during the build.
//!
//! # Construction
//!
//! Leaves are the raw 32-byte event hashes, used as-is. Each level pairs
//! adjacent nodes left to right:
//!
//! ```text
//! parent = SHA-256(0x01 || left || right)
//! ```
//!
//! Both children are exactly 32 bytes, so the concatenation is fixed-width
//! and unambiguous. The `0x01` prefix is the RFC 6962 interior-node
//! separator.
//!
//! A level with an odd node count promotes its last node unchanged. Nodes
//! are never duplicated. Proofs built under the duplicate convention do not
//! verify here, so this rule must not change.
//!
//! ```text
//!        root
//!       /    \
//!      P1     H3   (H3 promoted from level 0)
//!     /  \
//!    H1  H2
//! ```

use anchorage_core::{Digest, ProofStep};
use sha2::{Digest as _, Sha256};
use tracing::trace;

use crate::error::{MerkleError, Result};

/// RFC 6962 prefix for interior nodes.
const NODE_PREFIX: u8 = 0x01;

/// Hashes two children into their parent.
pub fn node_hash(left: &Digest, right: &Digest) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update([NODE_PREFIX]);
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    Digest::new(hasher.finalize().into())
}

/// Root and per-leaf proofs for one window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregation {
    root: Digest,
    proofs: Vec<Vec<ProofStep>>,
    depth: usize,
}

impl Aggregation {
    /// Merkle root.
    pub const fn root(&self) -> Digest {
        self.root
    }

    /// Number of leaves aggregated.
    pub fn leaf_count(&self) -> usize {
        self.proofs.len()
    }

    /// Number of levels above the leaves.
    pub const fn depth(&self) -> usize {
        self.depth
    }

    /// Proof path for the leaf at `index`, leaf level first.
    pub fn proof(&self, index: usize) -> Option<&[ProofStep]> {
        self.proofs.get(index).map(Vec::as_slice)
    }

    /// Consumes the aggregation, yielding proofs in leaf order.
    pub fn into_proofs(self) -> Vec<Vec<ProofStep>> {
        self.proofs
    }
}

/// Builds the tree over `leaves` in the given order.
///
/// Each node carries the indices of the leaves beneath it; pairing two
/// nodes appends the opposite sibling to every leaf under each, so all
/// proofs are complete when the root is reached.
///
/// # Errors
///
/// Returns `MerkleError::EmptyWindow` for zero leaves and
/// `MerkleError::TooManyLeaves` beyond `u32::MAX` leaves.
pub fn aggregate(leaves: &[Digest]) -> Result<Aggregation> {
    if leaves.is_empty() {
        return Err(MerkleError::EmptyWindow);
    }
    if u32::try_from(leaves.len()).is_err() {
        return Err(MerkleError::TooManyLeaves { count: leaves.len() });
    }

    let mut proofs: Vec<Vec<ProofStep>> = vec![Vec::new(); leaves.len()];
    let mut level: Vec<(Digest, Vec<usize>)> =
        leaves.iter().enumerate().map(|(index, hash)| (*hash, vec![index])).collect();
    let mut depth = 0;

    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        let mut nodes = level.into_iter();

        while let Some((left, mut members)) = nodes.next() {
            let Some((right, right_members)) = nodes.next() else {
                next.push((left, members));
                break;
            };

            for &index in &members {
                proofs[index].push(ProofStep::right(right));
            }
            for &index in &right_members {
                proofs[index].push(ProofStep::left(left));
            }

            members.extend(right_members);
            next.push((node_hash(&left, &right), members));
        }

        level = next;
        depth += 1;
    }

    let root = level.first().map(|(hash, _)| *hash).ok_or(MerkleError::EmptyWindow)?;
    trace!(leaf_count = leaves.len(), depth, root = %root, "aggregated window");

    Ok(Aggregation { root, proofs, depth })
}
