//! Window anchoring and the query surface over recorded anchors.

use std::sync::Arc;

use anchorage_core::{
    AggregationMethod, Anchor, AnchorEvent, AnchorFilter, AnchorId, AnchorItem, AnchorStatus,
    AnchorStore, Clock, Digest, EventHandler, IdempotencyKey, NewAnchor, NewAnchorItem,
    NoOpEventHandler, Proof, Window,
};
use anchorage_ledger::{LedgerError, Poster};
use anchorage_merkle::{aggregate, canonicalize, CanonicalLeaves, DuplicateHash};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    error::{AnchorError, Result},
    source::EventSource,
    verify::{VerificationReport, Verifier},
};

/// Treatment of distinct events that share one hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// Keep one leaf for the hash and log the collision.
    #[default]
    Allow,
    /// Refuse to anchor the window.
    Reject,
}

/// Configuration for [`AnchorService`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Aggregation method for new anchors.
    pub method: AggregationMethod,
    /// Treatment of shared hashes.
    pub duplicate_policy: DuplicatePolicy,
    /// Publish newly created anchors before returning from the trigger.
    pub publish_inline: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            method: AggregationMethod::MerkleSha256,
            duplicate_policy: DuplicatePolicy::Allow,
            publish_inline: true,
        }
    }
}

/// Result of anchoring a window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerOutcome {
    /// Anchor covering the window.
    pub anchor_id: AnchorId,
    /// Whether this call created the anchor.
    pub is_new: bool,
    /// Status after any inline publication.
    pub status: AnchorStatus,
    /// Number of leaves.
    pub leaf_count: u32,
    /// Root digest.
    pub digest: Digest,
    /// Hash collisions folded into single leaves.
    pub duplicates: Vec<DuplicateHash>,
}

/// Entry point for anchoring windows and querying the result.
pub struct AnchorService {
    store: Arc<dyn AnchorStore>,
    source: Arc<dyn EventSource>,
    poster: Option<Arc<Poster>>,
    verifier: Verifier,
    clock: Arc<dyn Clock>,
    config: ServiceConfig,
    event_handler: Arc<dyn EventHandler>,
}

impl AnchorService {
    /// Creates a service that records anchors without publishing them.
    pub fn new(
        store: Arc<dyn AnchorStore>,
        source: Arc<dyn EventSource>,
        clock: Arc<dyn Clock>,
        config: ServiceConfig,
    ) -> Self {
        Self {
            verifier: Verifier::new(store.clone()),
            store,
            source,
            poster: None,
            clock,
            config,
            event_handler: Arc::new(NoOpEventHandler),
        }
    }

    /// Publishes through `poster` when inline publication is enabled.
    #[must_use]
    pub fn with_poster(mut self, poster: Arc<Poster>) -> Self {
        self.poster = Some(poster);
        self
    }

    /// Sets the handler that receives lifecycle events.
    #[must_use]
    pub fn with_event_handler(mut self, event_handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = event_handler;
        self
    }

    /// Service configuration.
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Aggregates `window` into an anchor, publishing it inline when
    /// configured.
    ///
    /// Idempotent per window: a second call finds the existing anchor by its
    /// idempotency key and returns it with `is_new = false`. A failed inline
    /// publication does not fail the trigger; the anchor stays for the
    /// reconciler.
    ///
    /// # Errors
    ///
    /// - `EmptyWindow` when no event falls in the window; nothing is stored
    /// - `DuplicateEventHash` under [`DuplicatePolicy::Reject`]
    /// - `DigestMismatch` when the window was anchored with a different root
    /// - `Source` or `Persistence` for collaborator failures
    pub async fn trigger_anchor(&self, window: Window) -> Result<TriggerOutcome> {
        let span = info_span!("trigger_anchor", window = %window);
        self.trigger_inner(window).instrument(span).await
    }

    async fn trigger_inner(&self, window: Window) -> Result<TriggerOutcome> {
        let leaves = self.collect_leaves(&window).await?;
        let duplicates = leaves.duplicates().to_vec();

        let aggregation = aggregate(&leaves.hashes()).map_err(|e| match e {
            anchorage_merkle::MerkleError::EmptyWindow => {
                AnchorError::EmptyWindow { window: window.to_string() }
            },
            other => AnchorError::from(other),
        })?;
        let digest = aggregation.root();

        let items: Vec<NewAnchorItem> = leaves
            .leaves()
            .iter()
            .zip(aggregation.into_proofs())
            .zip(0u32..)
            .map(|((leaf, proof), leaf_index)| NewAnchorItem {
                event_id: leaf.event_id,
                event_hash: leaf.event_hash,
                leaf_index,
                proof,
            })
            .collect();

        let new = NewAnchor {
            idempotency_key: IdempotencyKey::derive(self.config.method, &window),
            digest,
            method: self.config.method,
            window,
            items,
            created_at: self.clock.now_utc(),
        };

        let (anchor, is_new) = self.store.create_or_get(new).await.map_err(|e| {
            if matches!(e, anchorage_core::CoreError::DigestMismatch { .. }) {
                error!(error = %e, "re-aggregation produced a different root");
            }
            AnchorError::from(e)
        })?;

        if is_new {
            info!(
                anchor_id = %anchor.id,
                digest = %anchor.digest,
                leaf_count = anchor.leaf_count,
                "anchor created"
            );
            self.event_handler
                .handle_event(AnchorEvent::Created {
                    anchor_id: anchor.id,
                    digest: anchor.digest,
                    leaf_count: anchor.leaf_count,
                    at: anchor.created_at,
                })
                .await;
        } else {
            debug!(anchor_id = %anchor.id, status = %anchor.status, "window already anchored");
        }

        let status = self.publish_inline(&anchor).await?;

        Ok(TriggerOutcome {
            anchor_id: anchor.id,
            is_new,
            status,
            leaf_count: anchor.leaf_count,
            digest: anchor.digest,
            duplicates,
        })
    }

    async fn collect_leaves(&self, window: &Window) -> Result<CanonicalLeaves> {
        let events = self.source.fetch_window(window).await?;
        let fetched = events.len();

        let in_window: Vec<_> = events
            .into_iter()
            .filter(|event| window.contains(event.observed_at))
            .map(|event| (event.event_id, event.event_hash))
            .collect();
        if in_window.len() < fetched {
            warn!(
                dropped = fetched - in_window.len(),
                "event source returned events outside the window"
            );
        }

        let leaves = canonicalize(in_window);
        if leaves.is_empty() {
            return Err(AnchorError::EmptyWindow { window: window.to_string() });
        }

        for duplicate in leaves.duplicates() {
            let events = duplicate.dropped.len() + 1;
            match self.config.duplicate_policy {
                DuplicatePolicy::Allow => warn!(
                    event_hash = %duplicate.event_hash,
                    kept = %duplicate.kept,
                    events,
                    "distinct events share a hash; anchoring one leaf"
                ),
                DuplicatePolicy::Reject => {
                    return Err(AnchorError::DuplicateEventHash {
                        event_hash: duplicate.event_hash,
                        events,
                    });
                },
            }
        }

        Ok(leaves)
    }

    async fn publish_inline(&self, anchor: &Anchor) -> Result<AnchorStatus> {
        let Some(poster) = self.poster.as_ref().filter(|_| self.config.publish_inline) else {
            return Ok(anchor.status);
        };
        if anchor.status != AnchorStatus::Pending {
            return Ok(anchor.status);
        }

        match poster.publish(anchor.id).await {
            Ok(receipt) => debug!(
                anchor_id = %anchor.id,
                message_id = %receipt.message_id,
                "inline publication succeeded"
            ),
            Err(LedgerError::LeaseConflict { .. }) => {
                debug!(anchor_id = %anchor.id, "inline publication raced another worker");
            },
            Err(e) => warn!(
                anchor_id = %anchor.id,
                error = %e,
                "inline publication failed; leaving anchor to the reconciler"
            ),
        }

        let current = self
            .store
            .find_anchor(anchor.id)
            .await?
            .ok_or(AnchorError::AnchorNotFound { anchor_id: anchor.id })?;
        Ok(current.status)
    }

    /// Returns an anchor with its items in leaf order.
    ///
    /// # Errors
    ///
    /// Returns `AnchorNotFound` for an unknown id.
    pub async fn get_anchor(&self, anchor_id: AnchorId) -> Result<(Anchor, Vec<AnchorItem>)> {
        let anchor = self
            .store
            .find_anchor(anchor_id)
            .await?
            .ok_or(AnchorError::AnchorNotFound { anchor_id })?;
        let items = self.store.find_items(anchor_id).await?;
        Ok((anchor, items))
    }

    /// Lists anchors matching `filter`.
    pub async fn list_anchors(&self, filter: AnchorFilter) -> Result<Vec<Anchor>> {
        Ok(self.store.list_anchors(filter).await?)
    }

    /// Every anchor that includes `event_hash`.
    pub async fn find_anchors_for_event(&self, event_hash: Digest) -> Result<Vec<Anchor>> {
        Ok(self.store.find_anchors_by_event_hash(event_hash).await?)
    }

    /// Verifies that `event_hash` is included in `anchor_id`.
    ///
    /// See [`Verifier::verify`].
    pub async fn verify(
        &self,
        event_hash: Digest,
        anchor_id: AnchorId,
    ) -> Result<VerificationReport> {
        self.verifier.verify(event_hash, anchor_id).await
    }

    /// Returns the inclusion proof of `event_hash` in `anchor_id`, suitable
    /// for handing to a third party.
    ///
    /// # Errors
    ///
    /// Returns `AnchorNotFound` when the anchor does not contain the hash.
    pub async fn proof(&self, anchor_id: AnchorId, event_hash: Digest) -> Result<Proof> {
        self.store
            .find_proof(anchor_id, event_hash)
            .await?
            .ok_or(AnchorError::AnchorNotFound { anchor_id })
    }

    /// Checks a previously issued proof against the recorded anchor.
    ///
    /// See [`Verifier::verify_receipt`].
    pub async fn verify_receipt(&self, receipt: &Proof) -> Result<VerificationReport> {
        self.verifier.verify_receipt(receipt).await
    }
}

impl std::fmt::Debug for AnchorService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnchorService")
            .field("source", &self.source)
            .field("poster", &self.poster)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_policy_parses_lowercase() {
        let policy: DuplicatePolicy = serde_json::from_str("\"reject\"").unwrap();
        assert_eq!(policy, DuplicatePolicy::Reject);
        assert_eq!(DuplicatePolicy::default(), DuplicatePolicy::Allow);
    }

    #[test]
    fn default_service_config_publishes_inline() {
        let config = ServiceConfig::default();
        assert_eq!(config.method, AggregationMethod::MerkleSha256);
        assert!(config.publish_inline);
    }
}
