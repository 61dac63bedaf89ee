//! Anchor store abstraction.
//!
//! [`AnchorStore`] is the seam between the pipeline and durable storage. It
//! offers atomic create-if-absent by idempotency key, compare-and-set status
//! transitions, and reads for anchors, items and proofs. The production
//! adapter composes the PostgreSQL repositories; [`memory`] provides an
//! in-process implementation with the same semantics for tests and local
//! runs.

use std::{future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::{
    error::{CoreError, Result},
    models::{
        Anchor, AnchorFilter, AnchorId, AnchorItem, AnchorStatus, Digest, Lease, NewAnchor, Proof,
        Transition,
    },
    storage::Storage,
};

/// Boxed future returned by store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Durable storage operations required by the anchoring pipeline.
pub trait AnchorStore: Send + Sync + 'static {
    /// Creates the anchor and its items atomically, or returns the existing
    /// anchor with the same idempotency key.
    ///
    /// The boolean is `true` only when this call created the anchor. An
    /// existing anchor whose digest differs from `new.digest` yields
    /// `CoreError::DigestMismatch`.
    fn create_or_get(&self, new: NewAnchor) -> StoreFuture<'_, (Anchor, bool)>;

    /// Applies `transition` only if the anchor is currently `expected`.
    ///
    /// Fails with `InvalidTransition` for edges outside the state machine,
    /// `LeaseConflict` when the anchor moved on, and `NotFound` when it does
    /// not exist. A failed call leaves the anchor untouched.
    fn transition(
        &self,
        id: AnchorId,
        expected: AnchorStatus,
        transition: Transition,
        at: DateTime<Utc>,
    ) -> StoreFuture<'_, Anchor>;

    /// Ends `lease` with `transition`, which must leave POSTING.
    ///
    /// Fenced on the lease itself, not only the status: after a reclaim and
    /// a new lease, the old holder gets `LeaseConflict` even though the
    /// anchor is POSTING again.
    fn release_lease(
        &self,
        lease: Lease,
        transition: Transition,
        at: DateTime<Utc>,
    ) -> StoreFuture<'_, Anchor>;

    /// Reads one anchor.
    fn find_anchor(&self, id: AnchorId) -> StoreFuture<'_, Option<Anchor>>;

    /// Reads an anchor's items in leaf order.
    fn find_items(&self, id: AnchorId) -> StoreFuture<'_, Vec<AnchorItem>>;

    /// Reads the stored proof of `event_hash` in anchor `id`.
    fn find_proof(&self, id: AnchorId, event_hash: Digest) -> StoreFuture<'_, Option<Proof>>;

    /// Lists anchors matching `filter`.
    fn list_anchors(&self, filter: AnchorFilter) -> StoreFuture<'_, Vec<Anchor>>;

    /// Lists every anchor that contains `event_hash`.
    fn find_anchors_by_event_hash(&self, event_hash: Digest) -> StoreFuture<'_, Vec<Anchor>>;
}

fn ensure_edge(id: AnchorId, expected: AnchorStatus, transition: &Transition) -> Result<()> {
    let to = transition.target();
    if expected.can_transition_to(to) {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition { anchor_id: id, from: expected, to })
    }
}

fn ensure_same_digest(existing: &Anchor, new: &NewAnchor) -> Result<()> {
    if existing.digest == new.digest {
        return Ok(());
    }
    warn!(
        anchor_id = %existing.id,
        idempotency_key = %existing.idempotency_key,
        stored = %existing.digest,
        computed = %new.digest,
        "re-aggregation produced a different digest"
    );
    Err(CoreError::DigestMismatch {
        idempotency_key: existing.idempotency_key.to_string(),
        stored: existing.digest,
        computed: new.digest,
    })
}

/// Production store backed by PostgreSQL.
#[derive(Debug, Clone)]
pub struct PostgresAnchorStore {
    storage: Arc<Storage>,
}

impl PostgresAnchorStore {
    /// Wraps the repositories.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    async fn insert_or_fetch(&self, new: NewAnchor) -> Result<(Anchor, bool)> {
        new.validate()?;
        let mut tx = self.storage.pool().begin().await?;
        let id = AnchorId::new();

        if let Some(anchor) = self.storage.anchors.insert_if_absent_in_tx(&mut tx, id, &new).await?
        {
            self.storage
                .anchor_items
                .insert_all_in_tx(&mut tx, id, &new.items, new.created_at)
                .await?;
            tx.commit().await?;
            debug!(anchor_id = %id, leaf_count = anchor.leaf_count, "anchor created");
            return Ok((anchor, true));
        }

        let existing = self
            .storage
            .anchors
            .find_by_key_in_tx(&mut tx, &new.idempotency_key)
            .await?
            .ok_or_else(|| {
                CoreError::Database(format!(
                    "anchor for {} conflicted but could not be read",
                    new.idempotency_key
                ))
            })?;
        tx.rollback().await?;

        ensure_same_digest(&existing, &new)?;
        Ok((existing, false))
    }

    async fn compare_and_set(
        &self,
        id: AnchorId,
        expected: AnchorStatus,
        transition: Transition,
        at: DateTime<Utc>,
        leased_at: Option<DateTime<Utc>>,
    ) -> Result<Anchor> {
        ensure_edge(id, expected, &transition)?;

        let updated =
            self.storage.anchors.transition(id, expected, &transition, at, leased_at).await?;
        if let Some(anchor) = updated {
            return Ok(anchor);
        }

        match self.storage.anchors.find_by_id(id).await? {
            Some(_) => Err(CoreError::LeaseConflict { anchor_id: id, expected }),
            None => Err(CoreError::not_found(format!("anchor {id}"))),
        }
    }

    async fn proof_for(&self, id: AnchorId, event_hash: Digest) -> Result<Option<Proof>> {
        let Some(anchor) = self.storage.anchors.find_by_id(id).await? else {
            return Ok(None);
        };
        let item = self.storage.anchor_items.find_by_anchor_and_hash(id, event_hash).await?;
        Ok(item.map(|item| Proof::from_item(&item, anchor.digest)))
    }
}

impl AnchorStore for PostgresAnchorStore {
    fn create_or_get(&self, new: NewAnchor) -> StoreFuture<'_, (Anchor, bool)> {
        Box::pin(self.insert_or_fetch(new))
    }

    fn transition(
        &self,
        id: AnchorId,
        expected: AnchorStatus,
        transition: Transition,
        at: DateTime<Utc>,
    ) -> StoreFuture<'_, Anchor> {
        Box::pin(self.compare_and_set(id, expected, transition, at, None))
    }

    fn release_lease(
        &self,
        lease: Lease,
        transition: Transition,
        at: DateTime<Utc>,
    ) -> StoreFuture<'_, Anchor> {
        Box::pin(self.compare_and_set(
            lease.anchor_id,
            AnchorStatus::Posting,
            transition,
            at,
            Some(lease.taken_at),
        ))
    }

    fn find_anchor(&self, id: AnchorId) -> StoreFuture<'_, Option<Anchor>> {
        Box::pin(self.storage.anchors.find_by_id(id))
    }

    fn find_items(&self, id: AnchorId) -> StoreFuture<'_, Vec<AnchorItem>> {
        Box::pin(self.storage.anchor_items.find_by_anchor(id))
    }

    fn find_proof(&self, id: AnchorId, event_hash: Digest) -> StoreFuture<'_, Option<Proof>> {
        Box::pin(self.proof_for(id, event_hash))
    }

    fn list_anchors(&self, filter: AnchorFilter) -> StoreFuture<'_, Vec<Anchor>> {
        Box::pin(async move { self.storage.anchors.list(&filter).await })
    }

    fn find_anchors_by_event_hash(&self, event_hash: Digest) -> StoreFuture<'_, Vec<Anchor>> {
        Box::pin(self.storage.anchors.find_by_event_hash(event_hash))
    }
}

pub mod memory {
    //! In-memory anchor store.
    //!
    //! Holds all state behind one lock so create-or-get and compare-and-set
    //! transitions are atomic, matching the PostgreSQL adapter. Supports
    //! one-shot failure injection for persistence error paths.

    use std::{collections::HashMap, sync::Arc};

    use chrono::{DateTime, Utc};
    use tokio::sync::RwLock;

    use super::{ensure_edge, ensure_same_digest, AnchorStore, StoreFuture};
    use crate::{
        error::{CoreError, Result},
        models::{
            Anchor, AnchorFilter, AnchorId, AnchorItem, AnchorOrder, AnchorStatus, Digest, Lease,
            NewAnchor, Proof, Transition,
        },
    };

    #[derive(Debug, Default)]
    struct State {
        anchors: HashMap<AnchorId, Anchor>,
        by_key: HashMap<String, AnchorId>,
        items: HashMap<AnchorId, Vec<AnchorItem>>,
        transition_failure: Option<(AnchorStatus, String)>,
    }

    /// Anchor store kept entirely in process memory.
    #[derive(Debug, Clone, Default)]
    pub struct InMemoryAnchorStore {
        state: Arc<RwLock<State>>,
    }

    impl InMemoryAnchorStore {
        /// Creates an empty store.
        pub fn new() -> Self {
            Self::default()
        }

        /// Makes the next transition into `target` fail with a database
        /// error, leaving the anchor unchanged.
        pub async fn inject_transition_failure(
            &self,
            target: AnchorStatus,
            message: impl Into<String>,
        ) {
            self.state.write().await.transition_failure = Some((target, message.into()));
        }

        /// Number of anchors held.
        pub async fn anchor_count(&self) -> usize {
            self.state.read().await.anchors.len()
        }

        /// Current status of an anchor, if present.
        pub async fn status_of(&self, id: AnchorId) -> Option<AnchorStatus> {
            self.state.read().await.anchors.get(&id).map(|anchor| anchor.status)
        }
    }

    impl InMemoryAnchorStore {
        async fn insert_or_fetch(&self, new: NewAnchor) -> Result<(Anchor, bool)> {
            new.validate()?;
            let mut state = self.state.write().await;

            if let Some(existing_id) = state.by_key.get(new.idempotency_key.as_str()) {
                let existing = state
                    .anchors
                    .get(existing_id)
                    .cloned()
                    .ok_or_else(|| CoreError::Database("dangling idempotency key".into()))?;
                ensure_same_digest(&existing, &new)?;
                return Ok((existing, false));
            }

            let anchor = Anchor::from_new(AnchorId::new(), &new);
            let items = new
                .items
                .iter()
                .map(|item| AnchorItem {
                    anchor_id: anchor.id,
                    event_id: item.event_id,
                    event_hash: item.event_hash,
                    leaf_index: item.leaf_index,
                    proof: item.proof.clone(),
                    created_at: new.created_at,
                })
                .collect();

            state.by_key.insert(new.idempotency_key.to_string(), anchor.id);
            state.items.insert(anchor.id, items);
            state.anchors.insert(anchor.id, anchor.clone());
            Ok((anchor, true))
        }

        async fn compare_and_set(
            &self,
            id: AnchorId,
            expected: AnchorStatus,
            transition: Transition,
            at: DateTime<Utc>,
            leased_at: Option<DateTime<Utc>>,
        ) -> Result<Anchor> {
            ensure_edge(id, expected, &transition)?;
            let mut state = self.state.write().await;

            if let Some((target, message)) = state.transition_failure.take() {
                if target == transition.target() {
                    return Err(CoreError::Database(message));
                }
                state.transition_failure = Some((target, message));
            }

            let anchor = state
                .anchors
                .get_mut(&id)
                .ok_or_else(|| CoreError::not_found(format!("anchor {id}")))?;
            let lease_moved = leased_at.is_some_and(|taken_at| anchor.updated_at != taken_at);
            if anchor.status != expected || lease_moved {
                return Err(CoreError::LeaseConflict { anchor_id: id, expected });
            }

            anchor.apply(&transition, at)?;
            Ok(anchor.clone())
        }

        async fn snapshot_anchor(&self, id: AnchorId) -> Result<Option<Anchor>> {
            Ok(self.state.read().await.anchors.get(&id).cloned())
        }

        async fn snapshot_items(&self, id: AnchorId) -> Result<Vec<AnchorItem>> {
            Ok(self.state.read().await.items.get(&id).cloned().unwrap_or_default())
        }

        async fn proof_for(&self, id: AnchorId, event_hash: Digest) -> Result<Option<Proof>> {
            let state = self.state.read().await;
            let Some(anchor) = state.anchors.get(&id) else {
                return Ok(None);
            };
            Ok(state.items.get(&id).and_then(|items| {
                items
                    .iter()
                    .find(|item| item.event_hash == event_hash)
                    .map(|item| Proof::from_item(item, anchor.digest))
            }))
        }

        async fn filtered(&self, filter: AnchorFilter) -> Result<Vec<Anchor>> {
            let state = self.state.read().await;
            let mut anchors: Vec<Anchor> =
                state.anchors.values().filter(|anchor| filter.matches(anchor)).cloned().collect();

            match filter.order {
                AnchorOrder::NewestCreated => anchors.sort_by(|a, b| {
                    b.created_at.cmp(&a.created_at).then_with(|| a.id.0.cmp(&b.id.0))
                }),
                AnchorOrder::OldestUpdated => anchors.sort_by(|a, b| {
                    a.updated_at.cmp(&b.updated_at).then_with(|| a.id.0.cmp(&b.id.0))
                }),
            }

            Ok(anchors.into_iter().skip(filter.offset).take(filter.limit).collect())
        }

        async fn containing(&self, event_hash: Digest) -> Result<Vec<Anchor>> {
            let state = self.state.read().await;
            let mut anchors: Vec<Anchor> = state
                .items
                .iter()
                .filter(|(_, items)| items.iter().any(|item| item.event_hash == event_hash))
                .filter_map(|(id, _)| state.anchors.get(id).cloned())
                .collect();
            anchors.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Ok(anchors)
        }
    }

    impl AnchorStore for InMemoryAnchorStore {
        fn create_or_get(&self, new: NewAnchor) -> StoreFuture<'_, (Anchor, bool)> {
            Box::pin(self.insert_or_fetch(new))
        }

        fn transition(
            &self,
            id: AnchorId,
            expected: AnchorStatus,
            transition: Transition,
            at: DateTime<Utc>,
        ) -> StoreFuture<'_, Anchor> {
            Box::pin(self.compare_and_set(id, expected, transition, at, None))
        }

        fn release_lease(
            &self,
            lease: Lease,
            transition: Transition,
            at: DateTime<Utc>,
        ) -> StoreFuture<'_, Anchor> {
            Box::pin(self.compare_and_set(
                lease.anchor_id,
                AnchorStatus::Posting,
                transition,
                at,
                Some(lease.taken_at),
            ))
        }

        fn find_anchor(&self, id: AnchorId) -> StoreFuture<'_, Option<Anchor>> {
            Box::pin(self.snapshot_anchor(id))
        }

        fn find_items(&self, id: AnchorId) -> StoreFuture<'_, Vec<AnchorItem>> {
            Box::pin(self.snapshot_items(id))
        }

        fn find_proof(&self, id: AnchorId, event_hash: Digest) -> StoreFuture<'_, Option<Proof>> {
            Box::pin(self.proof_for(id, event_hash))
        }

        fn list_anchors(&self, filter: AnchorFilter) -> StoreFuture<'_, Vec<Anchor>> {
            Box::pin(self.filtered(filter))
        }

        fn find_anchors_by_event_hash(&self, event_hash: Digest) -> StoreFuture<'_, Vec<Anchor>> {
            Box::pin(self.containing(event_hash))
        }
    }
}
