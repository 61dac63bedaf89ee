//! Scripted ledger endpoint for deterministic publication tests.
//!
//! Each `post` consumes the next [`PostStep`]; once the script runs out the
//! ledger accepts everything with a generated message id. Confirmation
//! queries work the same way with a configurable fallback status.

use std::{
    collections::VecDeque,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use anchorage_core::LedgerMessageId;
use anchorage_ledger::{AnchorPayload, ConfirmationStatus, LedgerClient, LedgerError};
use async_trait::async_trait;
use tokio::sync::Mutex;

/// Scripted response to one `post` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostStep {
    /// Accept with the given message id.
    Accept(String),
    /// Fail with a retryable network error.
    Transient,
    /// Fail with a non-retryable rejection.
    Reject,
    /// Fail immediately with a client-side timeout.
    TimedOut,
    /// Never answer, so the caller's own timeout has to fire.
    Stall,
}

/// Scripted response to one `get_confirmation` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmStep {
    /// Answer with a status.
    Status(ConfirmationStatus),
    /// Fail with a retryable network error.
    Transient,
}

/// In-process [`LedgerClient`] driven by a script.
#[derive(Debug)]
pub struct ScriptedLedger {
    endpoint: String,
    posts: Mutex<VecDeque<PostStep>>,
    confirmations: Mutex<VecDeque<ConfirmStep>>,
    fallback_confirmation: ConfirmationStatus,
    posted: Mutex<Vec<AnchorPayload>>,
    post_calls: AtomicUsize,
    confirmation_calls: AtomicUsize,
}

impl ScriptedLedger {
    /// Creates a ledger that accepts every post and confirms every message.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            posts: Mutex::new(VecDeque::new()),
            confirmations: Mutex::new(VecDeque::new()),
            fallback_confirmation: ConfirmationStatus::Confirmed,
            posted: Mutex::new(Vec::new()),
            post_calls: AtomicUsize::new(0),
            confirmation_calls: AtomicUsize::new(0),
        }
    }

    /// Queues post responses ahead of the accept-all fallback.
    #[must_use]
    pub fn with_posts(mut self, steps: impl IntoIterator<Item = PostStep>) -> Self {
        self.posts.get_mut().extend(steps);
        self
    }

    /// Queues confirmation responses ahead of the fallback.
    #[must_use]
    pub fn with_confirmations(mut self, steps: impl IntoIterator<Item = ConfirmStep>) -> Self {
        self.confirmations.get_mut().extend(steps);
        self
    }

    /// Status returned once the confirmation script runs out.
    #[must_use]
    pub fn confirming_as(mut self, status: ConfirmationStatus) -> Self {
        self.fallback_confirmation = status;
        self
    }

    /// Appends post responses to a ledger already shared with a poster.
    pub async fn script_posts(&self, steps: impl IntoIterator<Item = PostStep>) {
        self.posts.lock().await.extend(steps);
    }

    /// Payloads this ledger accepted, in order.
    pub async fn posted_payloads(&self) -> Vec<AnchorPayload> {
        self.posted.lock().await.clone()
    }

    /// Number of `post` calls, successful or not.
    pub fn post_calls(&self) -> usize {
        self.post_calls.load(Ordering::SeqCst)
    }

    /// Number of `get_confirmation` calls.
    pub fn confirmation_calls(&self) -> usize {
        self.confirmation_calls.load(Ordering::SeqCst)
    }

    fn generated_id(&self, call: usize) -> String {
        let host = self.endpoint.rsplit('/').next().unwrap_or("ledger");
        format!("{host}-msg-{call}")
    }
}

#[async_trait]
impl LedgerClient for ScriptedLedger {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn post(&self, payload: &AnchorPayload) -> anchorage_ledger::Result<LedgerMessageId> {
        let call = self.post_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let step = self.posts.lock().await.pop_front();

        match step {
            None => {
                self.posted.lock().await.push(payload.clone());
                Ok(LedgerMessageId::new(self.generated_id(call)))
            },
            Some(PostStep::Accept(id)) => {
                self.posted.lock().await.push(payload.clone());
                Ok(LedgerMessageId::new(id))
            },
            Some(PostStep::Transient) => {
                Err(LedgerError::transient(&self.endpoint, "connection reset by peer"))
            },
            Some(PostStep::Reject) => {
                Err(LedgerError::rejected(&self.endpoint, "HTTP 400 Bad Request: invalid payload"))
            },
            Some(PostStep::TimedOut) => {
                Err(LedgerError::timeout(&self.endpoint, Duration::from_secs(30)))
            },
            Some(PostStep::Stall) => {
                std::future::pending::<()>().await;
                Err(LedgerError::transient(&self.endpoint, "stalled call resumed"))
            },
        }
    }

    async fn get_confirmation(
        &self,
        _message_id: &LedgerMessageId,
    ) -> anchorage_ledger::Result<ConfirmationStatus> {
        self.confirmation_calls.fetch_add(1, Ordering::SeqCst);

        match self.confirmations.lock().await.pop_front() {
            None => Ok(self.fallback_confirmation),
            Some(ConfirmStep::Status(status)) => Ok(status),
            Some(ConfirmStep::Transient) => {
                Err(LedgerError::transient(&self.endpoint, "gateway unavailable"))
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use anchorage_core::{
        AggregationMethod, Anchor, AnchorId, Digest, EventId, IdempotencyKey, NewAnchor,
        NewAnchorItem, Window,
    };
    use chrono::{TimeZone, Utc};

    use super::*;

    fn payload() -> AnchorPayload {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let window = Window::new(start, start + chrono::Duration::days(1)).unwrap();
        let new = NewAnchor {
            idempotency_key: IdempotencyKey::derive(AggregationMethod::MerkleSha256, &window),
            digest: Digest::new([7; 32]),
            method: AggregationMethod::MerkleSha256,
            window,
            items: vec![NewAnchorItem {
                event_id: EventId::new(),
                event_hash: Digest::new([7; 32]),
                leaf_index: 0,
                proof: Vec::new(),
            }],
            created_at: start,
        };
        AnchorPayload::for_anchor(&Anchor::from_new(AnchorId::new(), &new), "TAG", start)
    }

    #[tokio::test]
    async fn script_runs_before_fallback() {
        let ledger = ScriptedLedger::new("http://primary")
            .with_posts([PostStep::Transient, PostStep::Accept("0xfeed".into())]);

        assert!(ledger.post(&payload()).await.unwrap_err().is_retryable());
        assert_eq!(ledger.post(&payload()).await.unwrap().as_str(), "0xfeed");
        assert_eq!(ledger.post(&payload()).await.unwrap().as_str(), "primary-msg-3");
        assert_eq!(ledger.post_calls(), 3);
        assert_eq!(ledger.posted_payloads().await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_post_never_completes() {
        let ledger = ScriptedLedger::new("http://primary").with_posts([PostStep::Stall]);

        let result =
            tokio::time::timeout(Duration::from_secs(5), ledger.post(&payload())).await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn confirmation_falls_back_to_configured_status() {
        let ledger = ScriptedLedger::new("http://primary")
            .with_confirmations([ConfirmStep::Transient])
            .confirming_as(ConfirmationStatus::Pending);
        let id = LedgerMessageId::new("0x1");

        assert!(ledger.get_confirmation(&id).await.is_err());
        assert_eq!(ledger.get_confirmation(&id).await.unwrap(), ConfirmationStatus::Pending);
        assert_eq!(ledger.confirmation_calls(), 2);
    }
}
