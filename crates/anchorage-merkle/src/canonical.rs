//! Canonical ordering of a window's leaves.
//!
//! Aggregation must not depend on arrival order: re-running a window after a
//! crash, or from a different consumer, has to reproduce the same leaf
//! sequence and therefore the same root. Leaves are ordered by event hash,
//! ties broken by event id, and equal hashes collapse to one leaf.

use anchorage_core::{Digest, EventId};

/// One leaf in canonical position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CanonicalLeaf {
    /// Event that contributed the hash.
    pub event_id: EventId,
    /// Leaf value.
    pub event_hash: Digest,
}

/// Distinct events that share one hash.
///
/// Only the lowest event id becomes a leaf; the others are reported so the
/// caller can decide whether the collision is acceptable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateHash {
    /// Shared hash.
    pub event_hash: Digest,
    /// Event kept as the leaf.
    pub kept: EventId,
    /// Events folded into the kept leaf.
    pub dropped: Vec<EventId>,
}

/// Result of canonicalizing a window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CanonicalLeaves {
    leaves: Vec<CanonicalLeaf>,
    duplicates: Vec<DuplicateHash>,
}

impl CanonicalLeaves {
    /// Leaves in canonical order.
    pub fn leaves(&self) -> &[CanonicalLeaf] {
        &self.leaves
    }

    /// Hash collisions between distinct events, in hash order.
    pub fn duplicates(&self) -> &[DuplicateHash] {
        &self.duplicates
    }

    /// Leaf hashes in canonical order, ready for aggregation.
    pub fn hashes(&self) -> Vec<Digest> {
        self.leaves.iter().map(|leaf| leaf.event_hash).collect()
    }

    /// Number of leaves.
    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    /// Whether the window produced no leaves.
    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }
}

/// Orders and deduplicates `(event_id, event_hash)` pairs.
///
/// Exact repeats of a pair are dropped silently since the event source
/// delivers at least once.
pub fn canonicalize(pairs: impl IntoIterator<Item = (EventId, Digest)>) -> CanonicalLeaves {
    let mut pairs: Vec<(Digest, EventId)> =
        pairs.into_iter().map(|(event_id, event_hash)| (event_hash, event_id)).collect();
    pairs.sort_unstable();
    pairs.dedup();

    let mut result = CanonicalLeaves::default();
    for (event_hash, event_id) in pairs {
        match result.leaves.last() {
            Some(last) if last.event_hash == event_hash => {
                let kept = last.event_id;
                match result.duplicates.last_mut() {
                    Some(duplicate) if duplicate.event_hash == event_hash => {
                        duplicate.dropped.push(event_id);
                    },
                    _ => result.duplicates.push(DuplicateHash {
                        event_hash,
                        kept,
                        dropped: vec![event_id],
                    }),
                }
            },
            _ => result.leaves.push(CanonicalLeaf { event_id, event_hash }),
        }
    }

    result
}
