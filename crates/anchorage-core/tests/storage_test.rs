//! Integration tests for the PostgreSQL anchor store.
//!
//! Every test runs against its own freshly migrated database. Without
//! `DATABASE_URL` the tests return early.

#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

use anchorage_core::{
    AnchorFilter, AnchorId, AnchorOrder, AnchorStatus, AnchorStore, CoreError, Lease,
    LedgerMessageId, Transition,
};
use anchorage_testing::{
    fixtures::{day, digests, new_anchor, numbered_digest},
    TestDatabase,
};
use chrono::{DateTime, Duration, Utc};

fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_709_337_600 + secs, 0).unwrap()
}

async fn database() -> Option<TestDatabase> {
    TestDatabase::if_configured().await.unwrap()
}

fn posted(message_id: &str) -> Transition {
    Transition::Posted {
        message_id: LedgerMessageId::new(message_id),
        endpoint: "primary".to_string(),
        failed_tries: 0,
    }
}

fn failed(failed_tries: u32) -> Transition {
    Transition::Failed { failed_tries, error: "ledger unavailable".to_string() }
}

#[tokio::test]
async fn storage_health_check() {
    let Some(db) = database().await else { return };

    assert!(db.storage().health_check().await.is_ok());

    db.cleanup().await.unwrap();
}

#[tokio::test]
async fn create_or_get_creates_once_per_window() {
    let Some(db) = database().await else { return };
    let store = db.store();
    let window = day(2024, 3, 1);

    let (created, is_new) =
        store.create_or_get(new_anchor(window, digests(4), at(0)).unwrap()).await.unwrap();
    assert!(is_new);
    assert_eq!(created.status, AnchorStatus::Pending);
    assert_eq!(created.leaf_count, 4);
    assert_eq!(created.window, window);
    assert_eq!(created.created_at, at(0));

    let (existing, is_new) =
        store.create_or_get(new_anchor(window, digests(4), at(60)).unwrap()).await.unwrap();
    assert!(!is_new);
    assert_eq!(existing.id, created.id);
    assert_eq!(existing.created_at, at(0));

    assert_eq!(store.find_items(created.id).await.unwrap().len(), 4);
    assert_eq!(store.list_anchors(AnchorFilter::default()).await.unwrap().len(), 1);

    db.cleanup().await.unwrap();
}

#[tokio::test]
async fn create_or_get_rejects_a_different_digest_for_the_same_window() {
    let Some(db) = database().await else { return };
    let store = db.store();
    let window = day(2024, 3, 1);

    let (original, _) =
        store.create_or_get(new_anchor(window, digests(3), at(0)).unwrap()).await.unwrap();
    let result = store.create_or_get(new_anchor(window, digests(5), at(60)).unwrap()).await;

    match result {
        Err(CoreError::DigestMismatch { stored, computed, .. }) => {
            assert_eq!(stored, original.digest);
            assert_ne!(computed, original.digest);
        },
        other => panic!("expected DigestMismatch, got {other:?}"),
    }
    assert_eq!(store.find_items(original.id).await.unwrap().len(), 3);

    db.cleanup().await.unwrap();
}

#[tokio::test]
async fn transition_miss_distinguishes_conflict_from_absence() {
    let Some(db) = database().await else { return };
    let store = db.store();
    let (anchor, _) =
        store.create_or_get(new_anchor(day(2024, 3, 1), digests(2), at(0)).unwrap()).await.unwrap();

    let leased = store
        .transition(anchor.id, AnchorStatus::Pending, Transition::BeginPosting, at(10))
        .await
        .unwrap();
    assert_eq!(leased.status, AnchorStatus::Posting);
    assert_eq!(leased.updated_at, at(10));

    let stale = store
        .transition(anchor.id, AnchorStatus::Pending, Transition::BeginPosting, at(11))
        .await;
    assert!(matches!(stale, Err(CoreError::LeaseConflict { expected: AnchorStatus::Pending, .. })));

    let unknown = AnchorId::new();
    let absent =
        store.transition(unknown, AnchorStatus::Pending, Transition::BeginPosting, at(12)).await;
    assert!(matches!(absent, Err(CoreError::NotFound(_))));

    let illegal =
        store.transition(anchor.id, AnchorStatus::Posting, Transition::Confirmed, at(13)).await;
    assert!(matches!(illegal, Err(CoreError::InvalidTransition { .. })));

    let unchanged = store.find_anchor(anchor.id).await.unwrap().unwrap();
    assert_eq!(unchanged.status, AnchorStatus::Posting);
    assert_eq!(unchanged.updated_at, at(10));

    db.cleanup().await.unwrap();
}

#[tokio::test]
async fn reclaimed_lease_cannot_be_released_by_its_old_holder() {
    let Some(db) = database().await else { return };
    let store = db.store();
    let (anchor, _) =
        store.create_or_get(new_anchor(day(2024, 3, 1), digests(2), at(0)).unwrap()).await.unwrap();

    let first = store
        .transition(anchor.id, AnchorStatus::Pending, Transition::BeginPosting, at(10))
        .await
        .unwrap();
    let first_lease = Lease::of(&first).unwrap();

    store.release_lease(first_lease, failed(1), at(400)).await.unwrap();
    let second = store
        .transition(anchor.id, AnchorStatus::Failed, Transition::BeginPosting, at(500))
        .await
        .unwrap();
    let second_lease = Lease::of(&second).unwrap();
    assert_ne!(first_lease, second_lease);

    let late = store.release_lease(first_lease, posted("msg-late"), at(510)).await;
    assert!(matches!(late, Err(CoreError::LeaseConflict { .. })));

    let done = store.release_lease(second_lease, posted("msg-1"), at(520)).await.unwrap();
    assert_eq!(done.status, AnchorStatus::Posted);
    assert_eq!(done.ledger_message_id, Some(LedgerMessageId::new("msg-1")));
    assert_eq!(done.attempt_count, 1);
    assert_eq!(done.posted_at, Some(at(520)));

    db.cleanup().await.unwrap();
}

#[tokio::test]
async fn list_applies_every_filter() {
    let Some(db) = database().await else { return };
    let store = db.store();

    let mut ids = Vec::new();
    for (offset, date) in [(0, 1), (60, 2), (120, 3)] {
        let new = new_anchor(day(2024, 3, date), digests(2), at(offset)).unwrap();
        ids.push(store.create_or_get(new).await.unwrap().0.id);
    }
    let [first, second, third]: [AnchorId; 3] = ids.try_into().unwrap();

    let begin = Transition::BeginPosting;
    store.transition(second, AnchorStatus::Pending, begin.clone(), at(200)).await.unwrap();
    store.transition(second, AnchorStatus::Posting, failed(2), at(300)).await.unwrap();
    store.transition(third, AnchorStatus::Pending, begin, at(250)).await.unwrap();

    let listed = |filter: AnchorFilter| {
        let store = store.clone();
        async move {
            store
                .list_anchors(filter)
                .await
                .unwrap()
                .into_iter()
                .map(|anchor| anchor.id)
                .collect::<Vec<_>>()
        }
    };

    assert_eq!(listed(AnchorFilter::default()).await, vec![third, second, first]);
    assert_eq!(listed(AnchorFilter::with_status(AnchorStatus::Failed)).await, vec![second]);
    assert_eq!(listed(AnchorFilter::with_status(AnchorStatus::Confirmed)).await, vec![]);

    let march_2 = day(2024, 3, 2);
    let from_second = AnchorFilter::default().within(march_2.start(), day(2024, 3, 3).end());
    assert_eq!(listed(from_second).await, vec![third, second]);
    let only_second = AnchorFilter::default().within(march_2.start(), march_2.end());
    assert_eq!(listed(only_second).await, vec![second]);

    assert_eq!(listed(AnchorFilter::default().updated_before(at(250))).await, vec![first]);
    assert_eq!(listed(AnchorFilter::default().updated_before(at(251))).await, vec![third, first]);

    assert_eq!(listed(AnchorFilter::default().attempts_below(1)).await, vec![third, first]);
    assert_eq!(listed(AnchorFilter::default().attempts_at_least(2)).await, vec![second]);
    assert_eq!(listed(AnchorFilter::default().attempts_at_least(3)).await, vec![]);

    let oldest_updated = AnchorFilter::default().order(AnchorOrder::OldestUpdated);
    assert_eq!(listed(oldest_updated.clone()).await, vec![first, third, second]);
    assert_eq!(listed(oldest_updated.clone().page(1, 1)).await, vec![third]);
    assert_eq!(listed(oldest_updated.page(2, 2)).await, vec![second]);

    let counts = db.storage().anchors.count_by_status().await.unwrap();
    let count_of = |status: AnchorStatus| {
        counts.iter().find(|count| count.status == status).map_or(0, |count| count.count)
    };
    assert_eq!(count_of(AnchorStatus::Pending), 1);
    assert_eq!(count_of(AnchorStatus::Posting), 1);
    assert_eq!(count_of(AnchorStatus::Failed), 1);
    assert_eq!(count_of(AnchorStatus::Posted), 0);

    db.cleanup().await.unwrap();
}

#[tokio::test]
async fn event_hash_lookup_finds_every_containing_anchor() {
    let Some(db) = database().await else { return };
    let store = db.store();
    let shared = numbered_digest(1);

    let early = new_anchor(day(2024, 3, 1), [shared, numbered_digest(2)], at(0)).unwrap();
    let late = new_anchor(day(2024, 3, 2), [shared, numbered_digest(3)], at(60)).unwrap();
    let (early, _) = store.create_or_get(early).await.unwrap();
    let (late, _) = store.create_or_get(late).await.unwrap();

    let found = store.find_anchors_by_event_hash(shared).await.unwrap();
    assert_eq!(found.iter().map(|a| a.id).collect::<Vec<_>>(), vec![late.id, early.id]);

    let only_early = store.find_anchors_by_event_hash(numbered_digest(2)).await.unwrap();
    assert_eq!(only_early.len(), 1);
    assert_eq!(only_early[0], early);

    assert!(store.find_anchors_by_event_hash(numbered_digest(99)).await.unwrap().is_empty());

    db.cleanup().await.unwrap();
}

#[tokio::test]
async fn proofs_survive_the_jsonb_column() {
    let Some(db) = database().await else { return };
    let store = db.store();
    let new = new_anchor(day(2024, 3, 1), digests(5), at(0)).unwrap();
    let expected = new.items.clone();
    let (anchor, _) = store.create_or_get(new).await.unwrap();

    let items = store.find_items(anchor.id).await.unwrap();
    assert_eq!(items.len(), expected.len());
    for (item, want) in items.iter().zip(&expected) {
        assert_eq!(item.anchor_id, anchor.id);
        assert_eq!(item.event_id, want.event_id);
        assert_eq!(item.event_hash, want.event_hash);
        assert_eq!(item.leaf_index, want.leaf_index);
        assert_eq!(item.proof, want.proof);
        assert_eq!(item.created_at, at(0));
    }
    // An odd leaf count leaves one path shorter than the rest.
    assert!(expected.iter().any(|item| item.proof.len() != expected[0].proof.len()));

    let last = &expected[4];
    let proof = store.find_proof(anchor.id, last.event_hash).await.unwrap().unwrap();
    assert_eq!(proof.root, anchor.digest);
    assert_eq!(proof.leaf_index, 4);
    assert_eq!(proof.path, last.proof);

    assert!(store.find_proof(anchor.id, numbered_digest(99)).await.unwrap().is_none());
    let unknown = AnchorId::new();
    assert!(store.find_proof(unknown, last.event_hash).await.unwrap().is_none());

    db.cleanup().await.unwrap();
}

#[tokio::test]
async fn large_anchor_items_are_written_in_chunks() {
    let Some(db) = database().await else { return };
    let store = db.store();
    let window = day(2024, 3, 1);
    let new = new_anchor(window, digests(2_500), window.end() + Duration::minutes(5)).unwrap();

    let (anchor, _) = store.create_or_get(new).await.unwrap();
    let items = store.find_items(anchor.id).await.unwrap();

    assert_eq!(anchor.leaf_count, 2_500);
    assert_eq!(items.len(), 2_500);
    assert!(items.iter().zip(0u32..).all(|(item, index)| item.leaf_index == index));

    db.cleanup().await.unwrap();
}
