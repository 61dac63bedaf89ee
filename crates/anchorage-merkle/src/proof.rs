//! Recomputing a root from a leaf and its sibling path.

use anchorage_core::{Digest, Proof, ProofStep, Side};

use crate::tree::node_hash;

/// Folds `path` over `leaf`, returning the implied root.
pub fn compute_root(leaf: &Digest, path: &[ProofStep]) -> Digest {
    path.iter().fold(*leaf, |running, step| match step.side {
        Side::Left => node_hash(&step.sibling, &running),
        Side::Right => node_hash(&running, &step.sibling),
    })
}

/// Whether `path` leads from `leaf` to `root`.
pub fn verify_path(leaf: &Digest, path: &[ProofStep], root: &Digest) -> bool {
    compute_root(leaf, path) == *root
}

/// Whether a stored proof is internally consistent.
///
/// This only checks the path against the proof's own root; callers compare
/// that root with the anchor digest and the ledger record separately.
pub fn verify_proof(proof: &Proof) -> bool {
    verify_path(&proof.event_hash, &proof.path, &proof.root)
}

#[cfg(test)]
mod tests {
    use anchorage_core::AnchorId;

    use super::*;
    use crate::tree::aggregate;

    fn hash(byte: u8) -> Digest {
        Digest::new([byte; 32])
    }

    #[test]
    fn every_leaf_of_an_odd_tree_verifies() {
        let leaves: Vec<Digest> = (1..=7).map(hash).collect();
        let aggregation = aggregate(&leaves).unwrap();

        for (index, leaf) in leaves.iter().enumerate() {
            let path = aggregation.proof(index).unwrap();
            assert!(verify_path(leaf, path, &aggregation.root()), "leaf {index}");
        }
    }

    #[test]
    fn wrong_leaf_does_not_verify() {
        let leaves = [hash(1), hash(2), hash(3)];
        let aggregation = aggregate(&leaves).unwrap();

        assert!(!verify_path(&hash(9), aggregation.proof(0).unwrap(), &aggregation.root()));
    }

    #[test]
    fn flipped_side_does_not_verify() {
        let leaves = [hash(1), hash(2)];
        let aggregation = aggregate(&leaves).unwrap();
        let flipped: Vec<ProofStep> = aggregation
            .proof(0)
            .unwrap()
            .iter()
            .map(|step| ProofStep::left(step.sibling))
            .collect();

        assert!(!verify_path(&leaves[0], &flipped, &aggregation.root()));
    }

    #[test]
    fn stored_proof_verifies_against_its_root() {
        let leaves = [hash(0xaa), hash(0xbb), hash(0xcc)];
        let aggregation = aggregate(&leaves).unwrap();
        let proof = Proof {
            anchor_id: AnchorId::new(),
            event_hash: leaves[2],
            leaf_index: 2,
            path: aggregation.proof(2).unwrap().to_vec(),
            root: aggregation.root(),
        };

        assert!(verify_proof(&proof));
        assert!(!verify_proof(&Proof { root: hash(0), ..proof }));
    }

    #[test]
    fn empty_path_requires_leaf_equal_root() {
        assert!(verify_path(&hash(4), &[], &hash(4)));
        assert!(!verify_path(&hash(4), &[], &hash(5)));
    }
}
