//! Inclusion verification of an event hash against a recorded anchor.
//!
//! The root is recomputed from the stored path and compared with the digest
//! on the anchor. A failing proof is an outcome, not an error; only
//! persistence failures surface as `Err`.

use std::sync::Arc;

use anchorage_core::{
    Anchor, AnchorId, AnchorStatus, AnchorStore, Digest, LedgerMessageId, Proof, ProofStep,
};
use anchorage_merkle::compute_root;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;

/// Why a proof did not verify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MismatchReason {
    /// The path reproduces the root but the anchor is not final yet.
    NotYetConfirmed,
    /// The path does not reproduce the anchored root.
    DigestMismatch,
}

/// Result of verifying one event hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "reason")]
pub enum VerificationOutcome {
    /// The path reproduces the root of a confirmed anchor.
    Verified,
    /// The event could not be verified.
    Mismatched(MismatchReason),
    /// The anchor does not exist or does not contain the hash.
    NotFound,
}

/// Full verification result returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    /// Anchor checked.
    pub anchor_id: AnchorId,
    /// Hash checked.
    pub event_hash: Digest,
    /// Overall outcome.
    pub outcome: VerificationOutcome,
    /// Whether the recomputed root equals the anchored digest.
    pub root_matches: bool,
    /// Status of the anchor, when it exists.
    pub anchor_status: Option<AnchorStatus>,
    /// Root recomputed from the stored path.
    pub computed_root: Option<Digest>,
    /// Digest recorded on the anchor.
    pub anchored_root: Option<Digest>,
    /// Leaf position of the hash.
    pub leaf_index: Option<u32>,
    /// Ledger message carrying the root, when published.
    pub ledger_message_id: Option<LedgerMessageId>,
}

impl VerificationReport {
    fn not_found(
        anchor_id: AnchorId,
        event_hash: Digest,
        anchor_status: Option<AnchorStatus>,
    ) -> Self {
        Self {
            anchor_id,
            event_hash,
            outcome: VerificationOutcome::NotFound,
            root_matches: false,
            anchor_status,
            computed_root: None,
            anchored_root: None,
            leaf_index: None,
            ledger_message_id: None,
        }
    }

    /// Whether the event is proven included in a confirmed anchor.
    pub fn is_verified(&self) -> bool {
        self.outcome == VerificationOutcome::Verified
    }
}

/// Verifies event hashes against stored anchors.
#[derive(Clone)]
pub struct Verifier {
    store: Arc<dyn AnchorStore>,
}

impl Verifier {
    /// Creates a verifier reading from `store`.
    pub fn new(store: Arc<dyn AnchorStore>) -> Self {
        Self { store }
    }

    /// Verifies that `event_hash` is included in anchor `anchor_id`.
    ///
    /// # Errors
    ///
    /// Returns `AnchorError::Persistence` when the store cannot be read.
    pub async fn verify(
        &self,
        event_hash: Digest,
        anchor_id: AnchorId,
    ) -> Result<VerificationReport> {
        let Some(anchor) = self.store.find_anchor(anchor_id).await? else {
            debug!(anchor_id = %anchor_id, "verification target anchor not found");
            return Ok(VerificationReport::not_found(anchor_id, event_hash, None));
        };

        let Some(proof) = self.store.find_proof(anchor_id, event_hash).await? else {
            debug!(anchor_id = %anchor_id, event_hash = %event_hash, "hash not in anchor");
            return Ok(VerificationReport::not_found(anchor_id, event_hash, Some(anchor.status)));
        };

        Ok(judge(&anchor, event_hash, proof.leaf_index, &proof.path))
    }

    /// Verifies a proof receipt held outside the store, e.g. one handed to
    /// an auditor.
    ///
    /// The receipt's own `root` is ignored; the path must reproduce the
    /// digest recorded on the anchor. A tampered hash or path therefore
    /// yields `Mismatched(DigestMismatch)` rather than `NotFound`.
    ///
    /// # Errors
    ///
    /// Returns `AnchorError::Persistence` when the store cannot be read.
    pub async fn verify_receipt(&self, receipt: &Proof) -> Result<VerificationReport> {
        let Some(anchor) = self.store.find_anchor(receipt.anchor_id).await? else {
            return Ok(VerificationReport::not_found(receipt.anchor_id, receipt.event_hash, None));
        };

        Ok(judge(&anchor, receipt.event_hash, receipt.leaf_index, &receipt.path))
    }
}

fn judge(
    anchor: &Anchor,
    event_hash: Digest,
    leaf_index: u32,
    path: &[ProofStep],
) -> VerificationReport {
    let computed = compute_root(&event_hash, path);
    let root_matches = computed == anchor.digest;
    let outcome = match (root_matches, anchor.status) {
        (true, AnchorStatus::Confirmed) => VerificationOutcome::Verified,
        (true, _) => VerificationOutcome::Mismatched(MismatchReason::NotYetConfirmed),
        (false, _) => VerificationOutcome::Mismatched(MismatchReason::DigestMismatch),
    };

    debug!(
        anchor_id = %anchor.id,
        event_hash = %event_hash,
        root_matches,
        status = %anchor.status,
        "checked inclusion proof"
    );

    VerificationReport {
        anchor_id: anchor.id,
        event_hash,
        outcome,
        root_matches,
        anchor_status: Some(anchor.status),
        computed_root: Some(computed),
        anchored_root: Some(anchor.digest),
        leaf_index: Some(leaf_index),
        ledger_message_id: anchor.ledger_message_id.clone(),
    }
}

impl std::fmt::Debug for Verifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Verifier").finish_non_exhaustive()
    }
}
