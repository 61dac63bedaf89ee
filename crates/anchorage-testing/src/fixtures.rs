//! Fixture builders for digests, windows, events and anchors.

use anchorage_core::{
    AggregationMethod, Digest, EventId, IdempotencyKey, NewAnchor, NewAnchorItem, Window,
};
use anchorage_merkle::{aggregate, canonicalize};
use anchorage_service::WindowEvent;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};

/// Digest with every byte set to `byte`.
pub fn digest(byte: u8) -> Digest {
    Digest::new([byte; 32])
}

/// Distinct digest for each `n`.
pub fn numbered_digest(n: u32) -> Digest {
    let mut bytes = [0x5a; 32];
    bytes[..4].copy_from_slice(&n.to_be_bytes());
    Digest::new(bytes)
}

/// `count` distinct digests.
pub fn digests(count: u32) -> Vec<Digest> {
    (0..count).map(numbered_digest).collect()
}

/// The UTC day `year-month-day` as a window.
///
/// # Panics
///
/// Panics on an invalid calendar date.
#[allow(clippy::expect_used)]
pub fn day(year: i32, month: u32, day: u32) -> Window {
    let date = NaiveDate::from_ymd_opt(year, month, day).expect("valid calendar date");
    Window::daily(date).expect("representable day")
}

/// One event with a fresh id.
pub fn event_at(event_hash: Digest, observed_at: DateTime<Utc>) -> WindowEvent {
    WindowEvent { event_id: EventId::new(), event_hash, observed_at }
}

/// Events for `hashes`, observed one minute apart from the window start.
///
/// Wraps around inside the window so every event stays in bounds.
pub fn events_in(window: &Window, hashes: impl IntoIterator<Item = Digest>) -> Vec<WindowEvent> {
    let minutes = window.duration().num_minutes().max(1);
    hashes
        .into_iter()
        .zip(0i64..)
        .map(|(hash, i)| event_at(hash, window.start() + Duration::minutes(i % minutes)))
        .collect()
}

/// A `NewAnchor` for `window` built the way the service builds one.
///
/// # Errors
///
/// Fails when `hashes` is empty.
pub fn new_anchor(
    window: Window,
    hashes: impl IntoIterator<Item = Digest>,
    created_at: DateTime<Utc>,
) -> Result<NewAnchor> {
    let leaves = canonicalize(hashes.into_iter().map(|hash| (EventId::new(), hash)));
    let aggregation = aggregate(&leaves.hashes()).context("aggregating fixture leaves")?;
    let digest = aggregation.root();

    let items = leaves
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

    Ok(NewAnchor {
        idempotency_key: IdempotencyKey::derive(AggregationMethod::MerkleSha256, &window),
        digest,
        method: AggregationMethod::MerkleSha256,
        window,
        items,
        created_at,
    })
}
