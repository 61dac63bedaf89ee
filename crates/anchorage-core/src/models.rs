//! Core domain models and strongly-typed identifiers.
//!
//! Defines anchors, anchor items, proofs, windows and the newtype wrappers
//! that keep identifiers and digests from being mixed up. Includes database
//! serialization traits and the anchor lifecycle state machine.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Days, NaiveDate, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::error::{CoreError, Result};

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    std::result::Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Width in bytes of every hash handled by the system.
pub const DIGEST_LEN: usize = 32;

/// Fixed-width SHA-256 output.
///
/// Used for event hashes, interior Merkle nodes and anchor roots. Ordering is
/// lexicographic over the raw bytes, which is the canonical leaf order.
/// Serializes as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; DIGEST_LEN]);

impl Digest {
    /// Wraps raw digest bytes.
    pub const fn new(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Lowercase hex encoding.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parses a 64-character hex string.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` if the input is not hex or does not
    /// decode to exactly 32 bytes.
    pub fn from_hex(input: &str) -> Result<Self> {
        let bytes = hex::decode(input)
            .map_err(|e| CoreError::invalid_input(format!("invalid digest hex: {e}")))?;
        Self::from_slice(&bytes)
    }

    /// Copies a 32-byte slice into a digest.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` on a length mismatch.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let array: [u8; DIGEST_LEN] = bytes.try_into().map_err(|_| {
            CoreError::invalid_input(format!(
                "digest must be {DIGEST_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(array))
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl From<[u8; DIGEST_LEN]> for Digest {
    fn from(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }
}

impl FromStr for Digest {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        Self::from_hex(&encoded).map_err(serde::de::Error::custom)
    }
}

impl sqlx::Type<PgDb> for Digest {
    fn type_info() -> PgTypeInfo {
        <Vec<u8> as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for Digest {
    fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
        let bytes = <&[u8] as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self::from_slice(bytes)?)
    }
}

impl sqlx::Encode<'_, PgDb> for Digest {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&[u8] as sqlx::Encode<PgDb>>::encode_by_ref(&self.0.as_slice(), buf)
    }
}

/// Strongly-typed anchor identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AnchorId(pub Uuid);

impl AnchorId {
    /// Creates a new random anchor ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AnchorId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AnchorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for AnchorId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for AnchorId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for AnchorId {
    fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
        Ok(Self(<Uuid as sqlx::Decode<PgDb>>::decode(value)?))
    }
}

impl sqlx::Encode<'_, PgDb> for AnchorId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Identifier of an upstream event whose hash is anchored.
///
/// Ordered so it can break ties between leaves with equal hashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
    /// Creates a new random event ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EventId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for EventId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for EventId {
    fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
        Ok(Self(<Uuid as sqlx::Decode<PgDb>>::decode(value)?))
    }
}

impl sqlx::Encode<'_, PgDb> for EventId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Identifier the ledger network assigned to a published message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LedgerMessageId(String);

impl LedgerMessageId {
    /// Wraps a ledger-issued identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrows the identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LedgerMessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Aggregation method recorded on every anchor.
///
/// The method is part of the idempotency key, so a future method can anchor
/// the same window without colliding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AggregationMethod {
    /// Binary SHA-256 Merkle tree, odd nodes promoted unchanged.
    #[default]
    #[serde(rename = "merkle-sha256")]
    MerkleSha256,
}

impl AggregationMethod {
    /// Stable external name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MerkleSha256 => "merkle-sha256",
        }
    }
}

impl fmt::Display for AggregationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AggregationMethod {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "merkle-sha256" => Ok(Self::MerkleSha256),
            other => Err(CoreError::invalid_input(format!("unknown aggregation method: {other}"))),
        }
    }
}

/// Publication lifecycle of an anchor.
///
/// ```text
///   PENDING ──▶ POSTING ──▶ POSTED ──▶ CONFIRMED
///                 │  ▲
///                 ▼  │ (retry while attempts remain)
///                FAILED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnchorStatus {
    /// Created, publication not yet attempted.
    Pending,

    /// A worker holds the lease and a publication attempt is in flight.
    Posting,

    /// Ledger accepted the message; finality not yet observed.
    Posted,

    /// Ledger finality observed. Terminal success.
    Confirmed,

    /// The last publication cycle exhausted every endpoint.
    ///
    /// Retryable until the anchor reaches the configured attempt ceiling,
    /// after which it waits for an operator.
    Failed,
}

impl AnchorStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [Self; 5] =
        [Self::Pending, Self::Posting, Self::Posted, Self::Confirmed, Self::Failed];

    /// Stable external name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Posting => "posting",
            Self::Posted => "posted",
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
        }
    }

    /// Returns whether `self -> next` is an edge of the state machine.
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Posting)
                | (Self::Failed, Self::Posting)
                | (Self::Posting, Self::Posted)
                | (Self::Posting, Self::Failed)
                | (Self::Posted, Self::Confirmed)
        )
    }

    /// Whether the ledger already holds the anchor's message.
    pub const fn is_published(self) -> bool {
        matches!(self, Self::Posted | Self::Confirmed)
    }
}

impl fmt::Display for AnchorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnchorStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| CoreError::invalid_input(format!("invalid anchor status: {s}")))
    }
}

impl sqlx::Type<PgDb> for AnchorStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for AnchorStatus {
    fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(s.parse()?)
    }
}

impl sqlx::Encode<'_, PgDb> for AnchorStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// Half-open time interval `[start, end)` whose events form one anchor.
///
/// Deserialization goes through [`Window::new`], so an empty or inverted
/// range is rejected there too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "WindowBounds")]
pub struct Window {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

#[derive(Deserialize)]
struct WindowBounds {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl TryFrom<WindowBounds> for Window {
    type Error = CoreError;

    fn try_from(bounds: WindowBounds) -> Result<Self> {
        Self::new(bounds.start, bounds.end)
    }
}

impl Window {
    /// Creates a window.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` unless `start < end`.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if start >= end {
            return Err(CoreError::invalid_input(format!(
                "window start {start} must precede end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    /// The UTC calendar day `[date 00:00, date+1 00:00)`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` for dates at the edge of the
    /// representable range.
    pub fn daily(date: NaiveDate) -> Result<Self> {
        let next = date
            .checked_add_days(Days::new(1))
            .ok_or_else(|| CoreError::invalid_input(format!("no day follows {date}")))?;
        Self::new(
            Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN)),
            Utc.from_utc_datetime(&next.and_time(chrono::NaiveTime::MIN)),
        )
    }

    /// The full UTC day preceding the day containing `now`.
    ///
    /// # Errors
    ///
    /// See [`Window::daily`].
    pub fn previous_day(now: DateTime<Utc>) -> Result<Self> {
        let today = now.date_naive();
        let yesterday = today
            .checked_sub_days(Days::new(1))
            .ok_or_else(|| CoreError::invalid_input(format!("no day precedes {today}")))?;
        Self::daily(yesterday)
    }

    /// Inclusive lower bound.
    pub const fn start(&self) -> DateTime<Utc> {
        self.start
    }

    /// Exclusive upper bound.
    pub const fn end(&self) -> DateTime<Utc> {
        self.end
    }

    /// Whether `at` falls inside the window.
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }

    /// Length of the window.
    pub fn duration(&self) -> chrono::Duration {
        self.end - self.start
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", rfc3339_millis(self.start), rfc3339_millis(self.end))
    }
}

fn rfc3339_millis(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Deterministic key allowing at most one anchor per (method, window).
///
/// Format: `{method}:{window_start}:{window_end}` with RFC 3339 millisecond
/// timestamps in UTC.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Derives the key for a window aggregated with `method`.
    pub fn derive(method: AggregationMethod, window: &Window) -> Self {
        Self(format!(
            "{}:{}:{}",
            method.as_str(),
            rfc3339_millis(window.start),
            rfc3339_millis(window.end)
        ))
    }

    /// Wraps a key read back from storage.
    pub fn from_stored(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Borrows the key.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Side on which a proof sibling sits relative to the running hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Sibling is the left child: `H(sibling || running)`.
    Left,
    /// Sibling is the right child: `H(running || sibling)`.
    Right,
}

/// One element of an inclusion proof.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProofStep {
    /// Hash of the sibling node.
    pub sibling: Digest,
    /// Which side the sibling is on.
    pub side: Side,
}

impl ProofStep {
    /// Sibling on the left.
    pub const fn left(sibling: Digest) -> Self {
        Self { sibling, side: Side::Left }
    }

    /// Sibling on the right.
    pub const fn right(sibling: Digest) -> Self {
        Self { sibling, side: Side::Right }
    }

    /// Compact `L:<hex>` / `R:<hex>` rendering for logs and exports.
    pub fn to_compact(&self) -> String {
        let prefix = match self.side {
            Side::Left => 'L',
            Side::Right => 'R',
        };
        format!("{prefix}:{}", self.sibling)
    }

    /// Parses the compact rendering.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` for an unknown side or bad hex.
    pub fn from_compact(input: &str) -> Result<Self> {
        let (side, hash) = input
            .split_once(':')
            .ok_or_else(|| CoreError::invalid_input(format!("malformed proof step: {input}")))?;
        let side = match side {
            "L" => Side::Left,
            "R" => Side::Right,
            other => {
                return Err(CoreError::invalid_input(format!("unknown proof side: {other}")))
            },
        };
        Ok(Self { sibling: Digest::from_hex(hash)?, side })
    }
}

/// Anchor record: one published or publication-attempted window summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anchor {
    /// Unique identifier.
    pub id: AnchorId,
    /// One anchor per key.
    pub idempotency_key: IdempotencyKey,
    /// Merkle root over the window's canonical leaves. Immutable.
    pub digest: Digest,
    /// How `digest` was computed.
    pub method: AggregationMethod,
    /// Anchored interval.
    pub window: Window,
    /// Number of leaves under `digest`.
    pub leaf_count: u32,
    /// Current lifecycle status.
    pub status: AnchorStatus,
    /// Cumulative failed ledger tries across all publish cycles.
    pub attempt_count: u32,
    /// Set once the ledger accepts the message.
    pub ledger_message_id: Option<LedgerMessageId>,
    /// Endpoint that accepted the message.
    pub ledger_endpoint: Option<String>,
    /// Most recent failure description.
    pub last_error: Option<String>,
    /// When the anchor was created.
    pub created_at: DateTime<Utc>,
    /// Last status change; drives liveness recovery of POSTING anchors.
    pub updated_at: DateTime<Utc>,
    /// When the ledger accepted the message.
    pub posted_at: Option<DateTime<Utc>>,
    /// When finality was observed.
    pub confirmed_at: Option<DateTime<Utc>>,
}

impl Anchor {
    /// Materializes a freshly created anchor in PENDING state.
    pub fn from_new(id: AnchorId, new: &NewAnchor) -> Self {
        Self {
            id,
            idempotency_key: new.idempotency_key.clone(),
            digest: new.digest,
            method: new.method,
            window: new.window,
            leaf_count: new.leaf_count(),
            status: AnchorStatus::Pending,
            attempt_count: 0,
            ledger_message_id: None,
            ledger_endpoint: None,
            last_error: None,
            created_at: new.created_at,
            updated_at: new.created_at,
            posted_at: None,
            confirmed_at: None,
        }
    }

    /// Applies a transition assuming the caller already won the
    /// compare-and-set on `self.status`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidTransition` if the edge is not part of the
    /// state machine.
    pub fn apply(&mut self, transition: &Transition, at: DateTime<Utc>) -> Result<()> {
        let target = transition.target();
        if !self.status.can_transition_to(target) {
            return Err(CoreError::InvalidTransition {
                anchor_id: self.id,
                from: self.status,
                to: target,
            });
        }

        match transition {
            Transition::BeginPosting => {},
            Transition::Posted { message_id, endpoint, failed_tries } => {
                self.ledger_message_id = Some(message_id.clone());
                self.ledger_endpoint = Some(endpoint.clone());
                self.attempt_count = self.attempt_count.saturating_add(*failed_tries);
                self.posted_at = Some(at);
            },
            Transition::Failed { failed_tries, error } => {
                self.attempt_count = self.attempt_count.saturating_add(*failed_tries);
                self.last_error = Some(error.clone());
            },
            Transition::Confirmed => self.confirmed_at = Some(at),
        }

        self.status = target;
        self.updated_at = at;
        Ok(())
    }
}

/// Membership of one event hash in an anchor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorItem {
    /// Owning anchor.
    pub anchor_id: AnchorId,
    /// Upstream event.
    pub event_id: EventId,
    /// Leaf value.
    pub event_hash: Digest,
    /// Position in the canonical leaf order, 0-based and contiguous.
    pub leaf_index: u32,
    /// Sibling path from this leaf to the anchor root.
    pub proof: Vec<ProofStep>,
    /// When the item was recorded.
    pub created_at: DateTime<Utc>,
}

/// Inclusion proof for one event hash in one anchor.
///
/// Derived from an [`AnchorItem`] and its anchor; only valid if recomputing
/// from `event_hash` along `path` yields `root`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    /// Anchor the proof belongs to.
    pub anchor_id: AnchorId,
    /// Leaf being proven.
    pub event_hash: Digest,
    /// Leaf position.
    pub leaf_index: u32,
    /// Ordered sibling path, leaf level first.
    pub path: Vec<ProofStep>,
    /// Anchor digest the path should reproduce.
    pub root: Digest,
}

impl Proof {
    /// Assembles a proof from an item and its anchor's digest.
    pub fn from_item(item: &AnchorItem, root: Digest) -> Self {
        Self {
            anchor_id: item.anchor_id,
            event_hash: item.event_hash,
            leaf_index: item.leaf_index,
            path: item.proof.clone(),
            root,
        }
    }
}

/// Leaf to persist together with a new anchor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAnchorItem {
    /// Upstream event.
    pub event_id: EventId,
    /// Leaf value.
    pub event_hash: Digest,
    /// Canonical position.
    pub leaf_index: u32,
    /// Sibling path.
    pub proof: Vec<ProofStep>,
}

/// Everything needed to create an anchor atomically with its items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAnchor {
    /// Key derived from method and window.
    pub idempotency_key: IdempotencyKey,
    /// Aggregated root.
    pub digest: Digest,
    /// Aggregation method.
    pub method: AggregationMethod,
    /// Anchored window.
    pub window: Window,
    /// Leaves with proofs, in canonical order.
    pub items: Vec<NewAnchorItem>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl NewAnchor {
    /// Number of leaves.
    pub fn leaf_count(&self) -> u32 {
        u32::try_from(self.items.len()).unwrap_or(u32::MAX)
    }

    /// Checks structural invariants before anything is written.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` when the item list is empty, leaf
    /// indices are not the contiguous sequence `0..n`, or the key does not
    /// match the method and window.
    pub fn validate(&self) -> Result<()> {
        if self.items.is_empty() {
            return Err(CoreError::invalid_input("anchor must contain at least one item"));
        }

        for (expected, item) in self.items.iter().enumerate() {
            if usize::try_from(item.leaf_index).ok() != Some(expected) {
                return Err(CoreError::invalid_input(format!(
                    "leaf index {} found at position {expected}",
                    item.leaf_index
                )));
            }
        }

        if self.idempotency_key != IdempotencyKey::derive(self.method, &self.window) {
            return Err(CoreError::invalid_input(format!(
                "idempotency key {} does not match {} over {}",
                self.idempotency_key, self.method, self.window
            )));
        }

        Ok(())
    }
}

/// Status change requested through a compare-and-set transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Take the publication lease: PENDING|FAILED -> POSTING.
    BeginPosting,

    /// Ledger accepted the message: POSTING -> POSTED.
    Posted {
        /// Ledger-issued id.
        message_id: LedgerMessageId,
        /// Endpoint that accepted the message.
        endpoint: String,
        /// Failed tries in this cycle before the success.
        failed_tries: u32,
    },

    /// Publication cycle gave up or the lease was abandoned: POSTING -> FAILED.
    Failed {
        /// Failed tries to add to `attempt_count`.
        failed_tries: u32,
        /// Description of the last failure.
        error: String,
    },

    /// Finality observed: POSTED -> CONFIRMED.
    Confirmed,
}

impl Transition {
    /// Status the anchor ends in.
    pub const fn target(&self) -> AnchorStatus {
        match self {
            Self::BeginPosting => AnchorStatus::Posting,
            Self::Posted { .. } => AnchorStatus::Posted,
            Self::Failed { .. } => AnchorStatus::Failed,
            Self::Confirmed => AnchorStatus::Confirmed,
        }
    }
}

/// A POSTING lease as it was taken or observed.
///
/// Taking the lease stamps `updated_at`, so the stamp identifies this lease
/// among every later one on the same anchor. Ending a lease is fenced on it:
/// once the lease is reclaimed, its holder can no longer record an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Lease {
    /// Leased anchor.
    pub anchor_id: AnchorId,
    /// `updated_at` written when the lease was taken.
    pub taken_at: DateTime<Utc>,
}

impl Lease {
    /// The lease `anchor` currently carries, if it is POSTING.
    pub fn of(anchor: &Anchor) -> Option<Self> {
        (anchor.status == AnchorStatus::Posting)
            .then_some(Self { anchor_id: anchor.id, taken_at: anchor.updated_at })
    }

    /// Whether `anchor` is still POSTING under this lease.
    pub fn is_held_on(&self, anchor: &Anchor) -> bool {
        Self::of(anchor).is_some_and(|current| current == *self)
    }
}

/// Ordering applied to anchor listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorOrder {
    /// Newest anchors first; the operator-facing default.
    #[default]
    NewestCreated,
    /// Least recently updated first; used for work scans.
    OldestUpdated,
}

/// Default page size for anchor listings.
pub const DEFAULT_LIST_LIMIT: usize = 100;

/// Filter for anchor listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorFilter {
    /// Only anchors in this status.
    pub status: Option<AnchorStatus>,
    /// Only windows starting at or after this instant.
    pub window_from: Option<DateTime<Utc>>,
    /// Only windows ending at or before this instant.
    pub window_to: Option<DateTime<Utc>>,
    /// Only anchors last updated strictly before this instant.
    pub updated_before: Option<DateTime<Utc>>,
    /// Only anchors with fewer failed tries than this.
    pub attempts_below: Option<u32>,
    /// Only anchors with at least this many failed tries.
    pub attempts_at_least: Option<u32>,
    /// Result ordering.
    pub order: AnchorOrder,
    /// Page size.
    pub limit: usize,
    /// Rows to skip.
    pub offset: usize,
}

impl Default for AnchorFilter {
    fn default() -> Self {
        Self {
            status: None,
            window_from: None,
            window_to: None,
            updated_before: None,
            attempts_below: None,
            attempts_at_least: None,
            order: AnchorOrder::default(),
            limit: DEFAULT_LIST_LIMIT,
            offset: 0,
        }
    }
}

impl AnchorFilter {
    /// Anchors in `status`.
    pub fn with_status(status: AnchorStatus) -> Self {
        Self { status: Some(status), ..Self::default() }
    }

    /// Restricts to windows inside `[from, to]`.
    #[must_use]
    pub fn within(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.window_from = Some(from);
        self.window_to = Some(to);
        self
    }

    /// Restricts to anchors not updated since `at`.
    #[must_use]
    pub fn updated_before(mut self, at: DateTime<Utc>) -> Self {
        self.updated_before = Some(at);
        self
    }

    /// Restricts to anchors with fewer than `max` failed tries.
    #[must_use]
    pub fn attempts_below(mut self, max: u32) -> Self {
        self.attempts_below = Some(max);
        self
    }

    /// Restricts to anchors with at least `min` failed tries.
    #[must_use]
    pub fn attempts_at_least(mut self, min: u32) -> Self {
        self.attempts_at_least = Some(min);
        self
    }

    /// Sets the ordering.
    #[must_use]
    pub fn order(mut self, order: AnchorOrder) -> Self {
        self.order = order;
        self
    }

    /// Sets the page size and offset.
    #[must_use]
    pub fn page(mut self, limit: usize, offset: usize) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }

    /// Whether `anchor` satisfies every predicate of the filter.
    pub fn matches(&self, anchor: &Anchor) -> bool {
        self.status.is_none_or(|status| anchor.status == status)
            && self.window_from.is_none_or(|from| anchor.window.start() >= from)
            && self.window_to.is_none_or(|to| anchor.window.end() <= to)
            && self.updated_before.is_none_or(|at| anchor.updated_at < at)
            && self.attempts_below.is_none_or(|max| anchor.attempt_count < max)
            && self.attempts_at_least.is_none_or(|min| anchor.attempt_count >= min)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn status_transitions_follow_state_machine() {
        use AnchorStatus::*;

        assert!(Pending.can_transition_to(Posting));
        assert!(Failed.can_transition_to(Posting));
        assert!(Posting.can_transition_to(Posted));
        assert!(Posting.can_transition_to(Failed));
        assert!(Posted.can_transition_to(Confirmed));

        assert!(!Pending.can_transition_to(Posted));
        assert!(!Posted.can_transition_to(Posting));
        assert!(!Confirmed.can_transition_to(Posting));
        assert!(!Confirmed.can_transition_to(Failed));
        assert!(!Posted.can_transition_to(Pending));
        for status in AnchorStatus::ALL {
            assert!(!status.can_transition_to(Pending));
        }
    }

    #[test]
    fn status_round_trips_through_external_names() {
        for status in AnchorStatus::ALL {
            assert_eq!(status.as_str().parse::<AnchorStatus>().unwrap(), status);
        }
        assert!("delivering".parse::<AnchorStatus>().is_err());
    }

    #[test]
    fn window_rejects_empty_and_inverted_ranges() {
        assert!(Window::new(at(10), at(10)).is_err());
        assert!(Window::new(at(20), at(10)).is_err());

        let window = Window::new(at(10), at(20)).unwrap();
        assert!(window.contains(at(10)));
        assert!(window.contains(at(19)));
        assert!(!window.contains(at(20)));
    }

    #[test]
    fn deserialized_window_is_validated() {
        let window = Window::new(at(10), at(20)).unwrap();
        let json = serde_json::to_string(&window).unwrap();
        assert_eq!(serde_json::from_str::<Window>(&json).unwrap(), window);

        let inverted = r#"{"start":"2024-03-02T00:00:00Z","end":"2024-03-01T00:00:00Z"}"#;
        let error = serde_json::from_str::<Window>(inverted).unwrap_err();
        assert!(error.to_string().contains("must precede"));
    }

    #[test]
    fn lease_is_identified_by_when_it_was_taken() {
        let window = Window::new(at(0), at(3_600)).unwrap();
        let new = NewAnchor {
            idempotency_key: IdempotencyKey::derive(AggregationMethod::MerkleSha256, &window),
            digest: Digest::new([1; 32]),
            method: AggregationMethod::MerkleSha256,
            window,
            items: vec![NewAnchorItem {
                event_id: EventId::new(),
                event_hash: Digest::new([1; 32]),
                leaf_index: 0,
                proof: Vec::new(),
            }],
            created_at: at(3_600),
        };
        let mut anchor = Anchor::from_new(AnchorId::new(), &new);
        assert_eq!(Lease::of(&anchor), None);

        anchor.apply(&Transition::BeginPosting, at(4_000)).unwrap();
        let first = Lease::of(&anchor).unwrap();
        assert_eq!(first.taken_at, at(4_000));

        let reclaim = Transition::Failed { failed_tries: 1, error: "gone".into() };
        anchor.apply(&reclaim, at(4_400)).unwrap();
        anchor.apply(&Transition::BeginPosting, at(4_400)).unwrap();

        assert!(!first.is_held_on(&anchor));
        assert!(Lease::of(&anchor).unwrap().is_held_on(&anchor));
    }

    #[test]
    fn daily_window_spans_one_utc_day() {
        let date = NaiveDate::from_ymd_opt(2024, 2, 28).unwrap();
        let window = Window::daily(date).unwrap();

        assert_eq!(window.duration(), chrono::Duration::days(1));
        assert_eq!(window.start().to_rfc3339(), "2024-02-28T00:00:00+00:00");
        assert_eq!(window.end().to_rfc3339(), "2024-02-29T00:00:00+00:00");

        let previous = Window::previous_day(window.end() + chrono::Duration::hours(5)).unwrap();
        assert_eq!(previous, window);
    }

    #[test]
    fn idempotency_key_depends_on_method_and_bounds() {
        let window = Window::new(at(0), at(3600)).unwrap();
        let key = IdempotencyKey::derive(AggregationMethod::MerkleSha256, &window);

        assert_eq!(key.as_str(), "merkle-sha256:1970-01-01T00:00:00.000Z:1970-01-01T01:00:00.000Z");

        let shifted = Window::new(at(1), at(3600)).unwrap();
        assert_ne!(key, IdempotencyKey::derive(AggregationMethod::MerkleSha256, &shifted));
    }

    #[test]
    fn digest_hex_parsing_enforces_width() {
        let digest = Digest::new([0xab; DIGEST_LEN]);
        assert_eq!(Digest::from_hex(&digest.to_hex()).unwrap(), digest);
        assert!(Digest::from_hex("abcd").is_err());
        assert!(Digest::from_hex("zz").is_err());

        let json = serde_json::to_string(&digest).unwrap();
        assert_eq!(json, format!("\"{}\"", "ab".repeat(32)));
    }

    #[test]
    fn compact_proof_steps_parse_back() {
        let step = ProofStep::left(Digest::new([7; DIGEST_LEN]));
        let compact = step.to_compact();

        assert!(compact.starts_with("L:07"));
        assert_eq!(ProofStep::from_compact(&compact).unwrap(), step);
        assert!(ProofStep::from_compact("X:00").is_err());
        assert!(ProofStep::from_compact("no-separator").is_err());
    }

    #[test]
    fn apply_records_publication_outcome() {
        let window = Window::new(at(0), at(60)).unwrap();
        let new = NewAnchor {
            idempotency_key: IdempotencyKey::derive(AggregationMethod::MerkleSha256, &window),
            digest: Digest::new([1; DIGEST_LEN]),
            method: AggregationMethod::MerkleSha256,
            window,
            items: vec![NewAnchorItem {
                event_id: EventId::new(),
                event_hash: Digest::new([1; DIGEST_LEN]),
                leaf_index: 0,
                proof: Vec::new(),
            }],
            created_at: at(60),
        };
        new.validate().unwrap();

        let mut anchor = Anchor::from_new(AnchorId::new(), &new);
        assert!(anchor.apply(&Transition::Confirmed, at(61)).is_err());

        anchor.apply(&Transition::BeginPosting, at(61)).unwrap();
        anchor
            .apply(
                &Transition::Posted {
                    message_id: LedgerMessageId::new("msg-1"),
                    endpoint: "primary".into(),
                    failed_tries: 2,
                },
                at(62),
            )
            .unwrap();

        assert_eq!(anchor.status, AnchorStatus::Posted);
        assert_eq!(anchor.attempt_count, 2);
        assert_eq!(anchor.posted_at, Some(at(62)));
        assert_eq!(anchor.updated_at, at(62));
    }

    #[test]
    fn new_anchor_rejects_gapped_leaf_indices() {
        let window = Window::new(at(0), at(60)).unwrap();
        let item = |leaf_index| NewAnchorItem {
            event_id: EventId::new(),
            event_hash: Digest::new([leaf_index as u8; DIGEST_LEN]),
            leaf_index,
            proof: Vec::new(),
        };
        let new = NewAnchor {
            idempotency_key: IdempotencyKey::derive(AggregationMethod::MerkleSha256, &window),
            digest: Digest::new([0; DIGEST_LEN]),
            method: AggregationMethod::MerkleSha256,
            window,
            items: vec![item(0), item(2)],
            created_at: at(60),
        };

        assert!(matches!(new.validate(), Err(CoreError::InvalidInput(_))));
    }
}
