//! Publication of anchor digests with per-endpoint retry and failover.
//!
//! A publish cycle takes the anchor's POSTING lease by compare-and-set,
//! walks the configured endpoints in priority order and records the outcome
//! with a second compare-and-set. Nothing is held between the two writes
//! except the lease itself, so a cycle interrupted mid-flight leaves the
//! anchor POSTING until the reconciler reclaims it.
//!
//! The lease is identified by the instant it was taken. The closing write
//! matches on it, and the cycle re-reads it before every retry, so a worker
//! whose lease was reclaimed stops posting instead of racing the new holder.
//! [`PosterConfig::validate`] keeps the reclaim threshold above the longest
//! cycle the configuration allows.

use std::{sync::Arc, time::Duration};

use anchorage_core::{
    Anchor, AnchorEvent, AnchorId, AnchorStatus, AnchorStore, Clock, CoreError, EventHandler,
    Lease, LedgerMessageId, NoOpEventHandler, Transition,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    client::{AnchorPayload, ConfirmationStatus, LedgerClient},
    error::{ErrorCategory, LedgerError, Result},
    retry::{RetryDecision, RetryPolicy},
};

/// Default tag written into every payload.
pub const DEFAULT_TAG: &str = "ANCHORAGE_ANCHOR_v1";

/// Configuration for the poster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PosterConfig {
    /// Upper bound on every ledger call.
    pub call_timeout: Duration,

    /// Retry policy applied to each endpoint.
    pub retry_policy: RetryPolicy,

    /// Cumulative failed tries after which an anchor is no longer retried.
    pub max_total_attempts: u32,

    /// Tag written into every payload.
    pub tag: String,

    /// Age after which the reconciler treats a POSTING lease as abandoned.
    pub posting_liveness: Duration,
}

impl Default for PosterConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(crate::DEFAULT_CALL_TIMEOUT_SECONDS),
            retry_policy: RetryPolicy::default(),
            max_total_attempts: 10,
            tag: DEFAULT_TAG.to_string(),
            posting_liveness: Duration::from_secs(crate::DEFAULT_POSTING_LIVENESS_SECONDS),
        }
    }
}

impl PosterConfig {
    /// Longest publish cycle over `endpoints` endpoints.
    pub fn worst_case_cycle(&self, endpoints: usize) -> Duration {
        let endpoints = u32::try_from(endpoints).unwrap_or(u32::MAX);
        self.retry_policy.endpoint_budget(self.call_timeout).saturating_mul(endpoints)
    }

    /// Checks the configuration for a poster over `endpoints` endpoints.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Configuration` when there is no endpoint, the
    /// retry policy allows no tries, the call timeout is zero, or a live
    /// cycle could outlast `posting_liveness` and be reclaimed.
    pub fn validate(&self, endpoints: usize) -> Result<()> {
        if endpoints == 0 {
            return Err(LedgerError::configuration("at least one ledger endpoint is required"));
        }
        if self.retry_policy.max_attempts == 0 {
            return Err(LedgerError::configuration("retry policy must allow at least one try"));
        }
        if self.call_timeout.is_zero() {
            return Err(LedgerError::configuration("call timeout must be positive"));
        }
        ensure_liveness_exceeds_cycle(self.posting_liveness, self.worst_case_cycle(endpoints))
    }
}

/// Rejects a liveness threshold a live publish cycle could reach.
///
/// # Errors
///
/// Returns `LedgerError::Configuration` when `liveness <= cycle`.
pub fn ensure_liveness_exceeds_cycle(liveness: Duration, cycle: Duration) -> Result<()> {
    if liveness > cycle {
        return Ok(());
    }
    Err(LedgerError::configuration(format!(
        "posting liveness of {}s must exceed the worst-case publish cycle of {:.1}s",
        liveness.as_secs(),
        cycle.as_secs_f64()
    )))
}

/// Successful publication of an anchor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    /// Ledger-issued message id.
    pub message_id: LedgerMessageId,
    /// Endpoint that accepted the message.
    pub endpoint: String,
    /// Failed tries in the cycle that succeeded; zero for a replayed receipt.
    pub failed_tries: u32,
}

struct Accepted {
    message_id: LedgerMessageId,
    endpoint: String,
    failed_tries: u32,
}

struct CycleFailure {
    failed_tries: u32,
    last_error: String,
}

enum CycleOutcome {
    Accepted(Accepted),
    Exhausted(CycleFailure),
    LeaseLost { failed_tries: u32 },
}

/// Publishes anchors to a prioritized list of ledger endpoints.
pub struct Poster {
    store: Arc<dyn AnchorStore>,
    ledgers: Vec<Arc<dyn LedgerClient>>,
    config: PosterConfig,
    clock: Arc<dyn Clock>,
    event_handler: Arc<dyn EventHandler>,
}

impl Poster {
    /// Creates a poster over `ledgers`, primary first.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Configuration` when [`PosterConfig::validate`]
    /// rejects the configuration for this many endpoints.
    pub fn new(
        store: Arc<dyn AnchorStore>,
        ledgers: Vec<Arc<dyn LedgerClient>>,
        config: PosterConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate(ledgers.len())?;

        Ok(Self { store, ledgers, config, clock, event_handler: Arc::new(NoOpEventHandler) })
    }

    /// Sets the handler that receives lifecycle events.
    #[must_use]
    pub fn with_event_handler(mut self, event_handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = event_handler;
        self
    }

    /// Poster configuration.
    pub fn config(&self) -> &PosterConfig {
        &self.config
    }

    /// Endpoints in priority order.
    pub fn endpoints(&self) -> impl Iterator<Item = &str> {
        self.ledgers.iter().map(|ledger| ledger.endpoint())
    }

    /// Longest publish cycle this poster can run.
    pub fn worst_case_cycle(&self) -> Duration {
        self.config.worst_case_cycle(self.ledgers.len())
    }

    /// Runs one publish cycle for `anchor_id`.
    ///
    /// An anchor that is already POSTED or CONFIRMED returns its recorded
    /// receipt without touching the network.
    ///
    /// # Errors
    ///
    /// - `LeaseConflict` when another cycle holds or just took the lease, or
    ///   the lease was reclaimed while this cycle was running
    /// - `AttemptsExhausted` for a FAILED anchor at the attempt ceiling
    /// - `Exhausted` when every endpoint failed; the anchor is then FAILED
    /// - `Store` when the anchor is missing or persistence fails
    pub async fn publish(&self, anchor_id: AnchorId) -> Result<PublishReceipt> {
        let anchor = self.load(anchor_id).await?;

        match anchor.status {
            AnchorStatus::Posted | AnchorStatus::Confirmed => return recorded_receipt(&anchor),
            AnchorStatus::Posting => return Err(LedgerError::LeaseConflict { anchor_id }),
            AnchorStatus::Failed if anchor.attempt_count >= self.config.max_total_attempts => {
                return Err(LedgerError::AttemptsExhausted {
                    anchor_id,
                    attempt_count: anchor.attempt_count,
                });
            },
            AnchorStatus::Pending | AnchorStatus::Failed => {},
        }

        let leased = self
            .store
            .transition(anchor_id, anchor.status, Transition::BeginPosting, self.clock.now_utc())
            .await?;
        let lease = Lease { anchor_id, taken_at: leased.updated_at };
        debug!(anchor_id = %anchor_id, from = %anchor.status, "took publication lease");

        let payload = AnchorPayload::for_anchor(&leased, &self.config.tag, self.clock.now_utc());

        match self.post_with_failover(lease, &payload).await? {
            CycleOutcome::Accepted(accepted) => self.record_success(lease, accepted).await,
            CycleOutcome::Exhausted(failure) => self.record_failure(lease, failure).await,
            CycleOutcome::LeaseLost { failed_tries } => {
                warn!(
                    anchor_id = %anchor_id,
                    failed_tries,
                    "publication lease was reclaimed; abandoning cycle"
                );
                Err(LedgerError::LeaseConflict { anchor_id })
            },
        }
    }

    /// Checks finality of a POSTED anchor and records confirmation.
    ///
    /// The endpoint that accepted the message is asked first, then the rest
    /// in priority order. The first `Confirmed` answer wins; otherwise
    /// `Pending` is returned if any endpoint knows the message.
    ///
    /// # Errors
    ///
    /// - `NotPublished` when the anchor is not POSTED or CONFIRMED
    /// - `LeaseConflict` when another worker confirmed it concurrently
    /// - the last ledger error when no endpoint answered
    pub async fn confirm(&self, anchor_id: AnchorId) -> Result<ConfirmationStatus> {
        let anchor = self.load(anchor_id).await?;

        match anchor.status {
            AnchorStatus::Confirmed => return Ok(ConfirmationStatus::Confirmed),
            AnchorStatus::Posted => {},
            status => return Err(LedgerError::NotPublished { anchor_id, status }),
        }

        let message_id = anchor.ledger_message_id.clone().ok_or_else(|| {
            LedgerError::Store(CoreError::ConstraintViolation(format!(
                "posted anchor {anchor_id} has no ledger message id"
            )))
        })?;

        let mut answered = None;
        let mut last_error = None;

        for ledger in self.confirmation_order(anchor.ledger_endpoint.as_deref()) {
            let endpoint = ledger.endpoint().to_string();
            let query = ledger.get_confirmation(&message_id);
            let outcome = match tokio::time::timeout(self.config.call_timeout, query).await {
                Ok(outcome) => outcome,
                Err(_) => Err(LedgerError::timeout(&endpoint, self.config.call_timeout)),
            };

            match outcome {
                Ok(ConfirmationStatus::Confirmed) => {
                    let at = self.clock.now_utc();
                    self.store
                        .transition(anchor_id, AnchorStatus::Posted, Transition::Confirmed, at)
                        .await?;
                    info!(
                        anchor_id = %anchor_id,
                        message_id = %message_id,
                        endpoint = %endpoint,
                        "anchor confirmed"
                    );
                    self.event_handler
                        .handle_event(AnchorEvent::Confirmed { anchor_id, message_id, at })
                        .await;
                    return Ok(ConfirmationStatus::Confirmed);
                },
                Ok(ConfirmationStatus::Pending) => {
                    answered = Some(ConfirmationStatus::Pending);
                },
                Ok(ConfirmationStatus::Unknown) => {
                    answered.get_or_insert(ConfirmationStatus::Unknown);
                },
                Err(error) => {
                    warn!(
                        anchor_id = %anchor_id,
                        endpoint = %endpoint,
                        error = %error,
                        "confirmation query failed"
                    );
                    last_error = Some(error);
                },
            }
        }

        match (answered, last_error) {
            (Some(status), _) => Ok(status),
            (None, Some(error)) => Err(error),
            (None, None) => Ok(ConfirmationStatus::Unknown),
        }
    }

    async fn load(&self, anchor_id: AnchorId) -> Result<Anchor> {
        self.store
            .find_anchor(anchor_id)
            .await?
            .ok_or_else(|| LedgerError::Store(CoreError::not_found(format!("anchor {anchor_id}"))))
    }

    fn confirmation_order(&self, accepted_by: Option<&str>) -> Vec<&Arc<dyn LedgerClient>> {
        let (mut first, rest): (Vec<_>, Vec<_>) =
            self.ledgers.iter().partition(|ledger| Some(ledger.endpoint()) == accepted_by);
        first.extend(rest);
        first
    }

    async fn still_holds(&self, lease: Lease) -> Result<bool> {
        Ok(lease.is_held_on(&self.load(lease.anchor_id).await?))
    }

    async fn post_with_failover(
        &self,
        lease: Lease,
        payload: &AnchorPayload,
    ) -> Result<CycleOutcome> {
        let anchor_id = lease.anchor_id;
        let mut failed_tries = 0_u32;
        let mut last_error = String::from("no endpoint attempted");

        for ledger in &self.ledgers {
            let endpoint = ledger.endpoint();
            let mut attempt = 0_u32;

            loop {
                if failed_tries > 0 && !self.still_holds(lease).await? {
                    return Ok(CycleOutcome::LeaseLost { failed_tries });
                }
                attempt += 1;
                let call = tokio::time::timeout(self.config.call_timeout, ledger.post(payload));
                let outcome = match call.await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(LedgerError::timeout(endpoint, self.config.call_timeout)),
                };

                let error = match outcome {
                    Ok(message_id) => {
                        return Ok(CycleOutcome::Accepted(Accepted {
                            message_id,
                            endpoint: endpoint.to_string(),
                            failed_tries,
                        }));
                    },
                    Err(error) => error,
                };

                failed_tries = failed_tries.saturating_add(1);
                warn!(
                    anchor_id = %anchor_id,
                    endpoint = %endpoint,
                    attempt,
                    category = %ErrorCategory::from(&error),
                    error = %error,
                    "ledger post failed"
                );
                let decision = self.config.retry_policy.decide(attempt, &error);
                last_error = error.to_string();

                match decision {
                    RetryDecision::Retry { delay } => self.clock.sleep(delay).await,
                    RetryDecision::Failover { reason } => {
                        debug!(
                            anchor_id = %anchor_id,
                            endpoint = %endpoint,
                            reason = %reason,
                            "failing over"
                        );
                        break;
                    },
                }
            }
        }

        Ok(CycleOutcome::Exhausted(CycleFailure { failed_tries, last_error }))
    }

    async fn record_success(&self, lease: Lease, accepted: Accepted) -> Result<PublishReceipt> {
        let anchor_id = lease.anchor_id;
        let at = self.clock.now_utc();
        let transition = Transition::Posted {
            message_id: accepted.message_id.clone(),
            endpoint: accepted.endpoint.clone(),
            failed_tries: accepted.failed_tries,
        };
        if let Err(error) = self.store.release_lease(lease, transition, at).await {
            warn!(
                anchor_id = %anchor_id,
                message_id = %accepted.message_id,
                endpoint = %accepted.endpoint,
                error = %error,
                "ledger accepted a message but the lease could not be released"
            );
            return Err(error.into());
        }

        info!(
            anchor_id = %anchor_id,
            message_id = %accepted.message_id,
            endpoint = %accepted.endpoint,
            failed_tries = accepted.failed_tries,
            "anchor posted"
        );
        self.event_handler
            .handle_event(AnchorEvent::Posted {
                anchor_id,
                message_id: accepted.message_id.clone(),
                endpoint: accepted.endpoint.clone(),
                failed_tries: accepted.failed_tries,
                at,
            })
            .await;

        Ok(PublishReceipt {
            message_id: accepted.message_id,
            endpoint: accepted.endpoint,
            failed_tries: accepted.failed_tries,
        })
    }

    async fn record_failure(&self, lease: Lease, failure: CycleFailure) -> Result<PublishReceipt> {
        let anchor_id = lease.anchor_id;
        let at = self.clock.now_utc();
        let transition = Transition::Failed {
            failed_tries: failure.failed_tries,
            error: failure.last_error.clone(),
        };
        let failed = self.store.release_lease(lease, transition, at).await?;
        let will_retry = failed.attempt_count < self.config.max_total_attempts;

        warn!(
            anchor_id = %anchor_id,
            failed_tries = failure.failed_tries,
            attempt_count = failed.attempt_count,
            will_retry,
            error = %failure.last_error,
            "publication exhausted every endpoint"
        );
        self.event_handler
            .handle_event(AnchorEvent::PublishFailed {
                anchor_id,
                attempt_count: failed.attempt_count,
                error: failure.last_error.clone(),
                will_retry,
                at,
            })
            .await;

        Err(LedgerError::Exhausted {
            failed_tries: failure.failed_tries,
            last_error: failure.last_error,
        })
    }
}

impl std::fmt::Debug for Poster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poster")
            .field("endpoints", &self.endpoints().collect::<Vec<_>>())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn recorded_receipt(anchor: &Anchor) -> Result<PublishReceipt> {
    match (&anchor.ledger_message_id, &anchor.ledger_endpoint) {
        (Some(message_id), Some(endpoint)) => Ok(PublishReceipt {
            message_id: message_id.clone(),
            endpoint: endpoint.clone(),
            failed_tries: 0,
        }),
        _ => Err(LedgerError::Store(CoreError::ConstraintViolation(format!(
            "{} anchor {} has no ledger reference",
            anchor.status, anchor.id
        )))),
    }
}
