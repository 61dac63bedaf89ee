//! Property-based tests for aggregation invariants.
//!
//! Roots must be independent of arrival order, every emitted proof must
//! reproduce the root, and any single-bit change must break verification.

use anchorage_core::{Digest, EventId};
use anchorage_merkle::{aggregate, canonicalize, compute_root, verify_path};
use proptest::prelude::*;
use uuid::Uuid;

/// Creates property test configuration based on environment.
///
/// Uses environment variables:
/// - `PROPTEST_CASES`: Number of test cases (default: 32 for dev, 256 for CI)
/// - `CI`: If set to "true", uses CI configuration
fn proptest_config() -> ProptestConfig {
    let is_ci = std::env::var("CI").unwrap_or_default() == "true";
    let default_cases = if is_ci { 256 } else { 32 };

    let cases =
        std::env::var("PROPTEST_CASES").ok().and_then(|s| s.parse().ok()).unwrap_or(default_cases);

    ProptestConfig::with_cases(cases)
}

fn digest_strategy() -> impl Strategy<Value = Digest> {
    any::<[u8; 32]>().prop_map(Digest::new)
}

fn pairs_strategy(max: usize) -> impl Strategy<Value = Vec<(EventId, Digest)>> {
    let event_id = any::<u128>().prop_map(|n| EventId(Uuid::from_u128(n)));
    prop::collection::vec((event_id, digest_strategy()), 1..max)
}

proptest! {
    #![proptest_config(proptest_config())]

    /// Shuffling the input never changes the canonical root.
    #[test]
    fn root_is_independent_of_arrival_order(
        (pairs, shuffled) in pairs_strategy(64).prop_flat_map(|pairs| {
            let shuffled = Just(pairs.clone()).prop_shuffle();
            (Just(pairs), shuffled)
        })
    ) {
        let first = aggregate(&canonicalize(pairs).hashes()).unwrap();
        let second = aggregate(&canonicalize(shuffled).hashes()).unwrap();

        prop_assert_eq!(first.root(), second.root());
        prop_assert_eq!(first.into_proofs(), second.into_proofs());
    }

    /// Every leaf's proof folds back to the root.
    #[test]
    fn every_proof_reproduces_the_root(leaves in prop::collection::vec(digest_strategy(), 1..130)) {
        let aggregation = aggregate(&leaves).unwrap();

        prop_assert_eq!(aggregation.leaf_count(), leaves.len());
        for (index, leaf) in leaves.iter().enumerate() {
            let path = aggregation.proof(index).unwrap();
            prop_assert!(verify_path(leaf, path, &aggregation.root()));
        }
    }

    /// Proof length never exceeds the tree depth.
    #[test]
    fn proof_length_is_bounded_by_depth(
        leaves in prop::collection::vec(digest_strategy(), 1..130),
    ) {
        let aggregation = aggregate(&leaves).unwrap();
        let levels = leaves.len().next_power_of_two().trailing_zeros();
        let expected_depth = usize::try_from(levels).unwrap();

        prop_assert_eq!(aggregation.depth(), expected_depth);
        for index in 0..leaves.len() {
            prop_assert!(aggregation.proof(index).unwrap().len() <= expected_depth);
        }
    }

    /// Flipping any bit of the leaf breaks verification.
    #[test]
    fn single_bit_flip_in_leaf_fails(
        leaves in prop::collection::vec(digest_strategy(), 2..40),
        pick in any::<prop::sample::Index>(),
        bit in 0usize..256,
    ) {
        let aggregation = aggregate(&leaves).unwrap();
        let index = pick.index(leaves.len());

        let mut bytes = *leaves[index].as_bytes();
        bytes[bit / 8] ^= 1 << (bit % 8);
        let tampered = Digest::new(bytes);

        let path = aggregation.proof(index).unwrap();
        prop_assert!(!verify_path(&tampered, path, &aggregation.root()));
    }

    /// Flipping any bit of any sibling breaks verification.
    #[test]
    fn single_bit_flip_in_path_fails(
        leaves in prop::collection::vec(digest_strategy(), 2..40),
        pick in any::<prop::sample::Index>(),
        step_pick in any::<prop::sample::Index>(),
        bit in 0usize..256,
    ) {
        let aggregation = aggregate(&leaves).unwrap();
        let index = pick.index(leaves.len());
        let mut path = aggregation.proof(index).unwrap().to_vec();
        prop_assume!(!path.is_empty());

        let step = step_pick.index(path.len());
        let mut bytes = *path[step].sibling.as_bytes();
        bytes[bit / 8] ^= 1 << (bit % 8);
        path[step].sibling = Digest::new(bytes);

        prop_assert_ne!(compute_root(&leaves[index], &path), aggregation.root());
    }
}
