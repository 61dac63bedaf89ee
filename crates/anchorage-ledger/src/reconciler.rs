//! Periodic repair of anchors that have not reached a terminal state.
//!
//! Each pass runs four bounded sweeps, oldest anchors first:
//!
//! 1. **Reclaim** POSTING anchors whose lease outlived the liveness
//!    threshold (the publishing process died or stalled).
//! 2. **Publish** PENDING anchors and FAILED anchors below the attempt
//!    ceiling whose retry delay has elapsed. The delay doubles with every
//!    failed try, from `retry_delay_base` up to `retry_delay_max`.
//! 3. **Report** FAILED anchors at the ceiling for manual reconciliation.
//! 4. **Confirm** POSTED anchors.
//!
//! Losing a compare-and-set race to another worker is counted as skipped,
//! never as an error.

use std::{sync::Arc, time::Duration};

use anchorage_core::{
    Anchor, AnchorEvent, AnchorFilter, AnchorOrder, AnchorStatus, AnchorStore, Clock,
    EventHandler, Lease, NoOpEventHandler, Transition,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    client::ConfirmationStatus,
    error::{LedgerError, Result},
    poster::{ensure_liveness_exceeds_cycle, Poster},
};

/// Error recorded on anchors whose lease was reclaimed.
pub const ABANDONED_ERROR: &str = "publication abandoned";

/// Configuration for the reconciler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Delay between passes.
    pub poll_interval: Duration,

    /// Maximum anchors handled per sweep.
    pub batch_size: usize,

    /// Age after which a POSTING lease is considered abandoned.
    pub posting_liveness: Duration,

    /// Cumulative failed tries after which automatic retries stop.
    pub max_total_attempts: u32,

    /// Wait after the first failed try before a FAILED anchor is retried.
    pub retry_delay_base: Duration,

    /// Upper bound on the wait between retries of a FAILED anchor.
    pub retry_delay_max: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            batch_size: 100,
            posting_liveness: Duration::from_secs(300),
            max_total_attempts: 10,
            retry_delay_base: Duration::from_secs(60),
            retry_delay_max: Duration::from_secs(3600),
        }
    }
}

impl ReconcilerConfig {
    /// How long a FAILED anchor with `attempt_count` failed tries waits,
    /// counted from its last update, before it is published again.
    ///
    /// `retry_delay_base * 2^(attempt_count-1)`, capped at `retry_delay_max`.
    pub fn retry_delay(&self, attempt_count: u32) -> Duration {
        let exponent = attempt_count.saturating_sub(1).min(20);
        let delay = self.retry_delay_base.saturating_mul(2_u32.saturating_pow(exponent));
        std::cmp::min(delay, self.retry_delay_max)
    }
}

/// Counters for one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Stale POSTING leases moved to FAILED.
    pub reclaimed: usize,
    /// Anchors the ledger accepted during this pass.
    pub published: usize,
    /// Publish cycles that exhausted every endpoint.
    pub failed: usize,
    /// Anchors at the attempt ceiling awaiting an operator.
    pub requires_attention: usize,
    /// Anchors whose finality was observed.
    pub confirmed: usize,
    /// Posted anchors not yet final.
    pub still_pending: usize,
    /// FAILED anchors still inside their retry delay.
    pub deferred: usize,
    /// Anchors another worker got to first.
    pub skipped: usize,
    /// Unexpected failures, logged individually.
    pub errors: usize,
}

impl ReconcileReport {
    /// Whether the pass changed or reported anything.
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

/// Drives non-terminal anchors toward CONFIRMED or permanent FAILED.
pub struct Reconciler {
    store: Arc<dyn AnchorStore>,
    poster: Arc<Poster>,
    clock: Arc<dyn Clock>,
    config: ReconcilerConfig,
    event_handler: Arc<dyn EventHandler>,
}

impl Reconciler {
    /// Creates a reconciler publishing through `poster`.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Configuration` when a cycle of `poster` could
    /// outlast `posting_liveness`, which would let a live lease be
    /// reclaimed and the anchor published twice.
    pub fn new(
        store: Arc<dyn AnchorStore>,
        poster: Arc<Poster>,
        clock: Arc<dyn Clock>,
        config: ReconcilerConfig,
    ) -> Result<Self> {
        ensure_liveness_exceeds_cycle(config.posting_liveness, poster.worst_case_cycle())?;
        if config.batch_size == 0 {
            return Err(LedgerError::configuration("reconcile batch size must be positive"));
        }

        Ok(Self { store, poster, clock, config, event_handler: Arc::new(NoOpEventHandler) })
    }

    /// Sets the handler that receives lifecycle events.
    #[must_use]
    pub fn with_event_handler(mut self, event_handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = event_handler;
        self
    }

    /// Reconciler configuration.
    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Runs passes every `poll_interval` until `cancellation_token` fires.
    ///
    /// A pass that fails to list anchors is logged and retried on the next
    /// tick; the loop itself never fails.
    pub async fn run(&self, cancellation_token: CancellationToken) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            batch_size = self.config.batch_size,
            "reconciler starting"
        );

        loop {
            if cancellation_token.is_cancelled() {
                break;
            }

            match self.reconcile_once().await {
                Ok(report) if report.is_idle() => debug!("reconcile pass found nothing to do"),
                Ok(report) => info!(
                    reclaimed = report.reclaimed,
                    published = report.published,
                    failed = report.failed,
                    requires_attention = report.requires_attention,
                    confirmed = report.confirmed,
                    still_pending = report.still_pending,
                    deferred = report.deferred,
                    skipped = report.skipped,
                    errors = report.errors,
                    "reconcile pass complete"
                ),
                Err(error) => error!(error = %error, "reconcile pass failed"),
            }

            tokio::select! {
                () = self.clock.sleep(self.config.poll_interval) => {}
                () = cancellation_token.cancelled() => break,
            }
        }

        info!("reconciler stopped");
    }

    /// Runs one pass of every sweep.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Store` only when a listing query fails. Failures
    /// on individual anchors are counted in the report.
    pub async fn reconcile_once(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        self.reclaim_stale_leases(&mut report).await?;
        self.publish_outstanding(&mut report).await?;
        self.report_exhausted(&mut report).await?;
        self.confirm_posted(&mut report).await?;

        Ok(report)
    }

    fn oldest_first(&self, status: AnchorStatus) -> AnchorFilter {
        AnchorFilter::with_status(status)
            .order(AnchorOrder::OldestUpdated)
            .page(self.config.batch_size, 0)
    }

    async fn reclaim_stale_leases(&self, report: &mut ReconcileReport) -> Result<()> {
        let liveness = chrono::Duration::from_std(self.config.posting_liveness)
            .map_err(|e| LedgerError::configuration(format!("liveness threshold: {e}")))?;
        let threshold = self.clock.now_utc() - liveness;
        let stale = self
            .store
            .list_anchors(self.oldest_first(AnchorStatus::Posting).updated_before(threshold))
            .await?;

        for anchor in stale {
            let at = self.clock.now_utc();
            let transition =
                Transition::Failed { failed_tries: 1, error: ABANDONED_ERROR.to_string() };

            let lease = Lease { anchor_id: anchor.id, taken_at: anchor.updated_at };

            match self.store.release_lease(lease, transition, at).await {
                Ok(failed) => {
                    report.reclaimed += 1;
                    let will_retry = failed.attempt_count < self.config.max_total_attempts;
                    warn!(
                        anchor_id = %anchor.id,
                        leased_since = %anchor.updated_at,
                        attempt_count = failed.attempt_count,
                        "reclaimed abandoned publication lease"
                    );
                    self.event_handler
                        .handle_event(AnchorEvent::PublishFailed {
                            anchor_id: anchor.id,
                            attempt_count: failed.attempt_count,
                            error: ABANDONED_ERROR.to_string(),
                            will_retry,
                            at,
                        })
                        .await;
                },
                Err(e) if e.is_lease_conflict() => report.skipped += 1,
                Err(e) => {
                    report.errors += 1;
                    error!(anchor_id = %anchor.id, error = %e, "failed to reclaim lease");
                },
            }
        }

        Ok(())
    }

    async fn publish_outstanding(&self, report: &mut ReconcileReport) -> Result<()> {
        let pending = self.oldest_first(AnchorStatus::Pending);
        let mut candidates = self.store.list_anchors(pending).await?;
        let remaining = self.config.batch_size.saturating_sub(candidates.len());
        if remaining > 0 {
            let retryable = AnchorFilter::with_status(AnchorStatus::Failed)
                .attempts_below(self.config.max_total_attempts)
                .order(AnchorOrder::OldestUpdated)
                .page(remaining, 0);
            candidates.extend(self.store.list_anchors(retryable).await?);
        }

        let now = self.clock.now_utc();
        for anchor in candidates {
            if let Some(due_at) = self.retry_due_at(&anchor).filter(|due_at| *due_at > now) {
                report.deferred += 1;
                debug!(
                    anchor_id = %anchor.id,
                    attempt_count = anchor.attempt_count,
                    due_at = %due_at,
                    "retry delay not yet elapsed"
                );
                continue;
            }

            match self.poster.publish(anchor.id).await {
                Ok(_) => report.published += 1,
                Err(LedgerError::Exhausted { .. }) => report.failed += 1,
                Err(LedgerError::LeaseConflict { .. }) => report.skipped += 1,
                Err(LedgerError::AttemptsExhausted { .. }) => report.requires_attention += 1,
                Err(e) => {
                    report.errors += 1;
                    error!(anchor_id = %anchor.id, error = %e, "publish failed unexpectedly");
                },
            }
        }

        Ok(())
    }

    fn retry_due_at(&self, anchor: &Anchor) -> Option<DateTime<Utc>> {
        if anchor.status != AnchorStatus::Failed {
            return None;
        }
        let delay = chrono::Duration::from_std(self.config.retry_delay(anchor.attempt_count)).ok();
        let due_at = delay.and_then(|delay| anchor.updated_at.checked_add_signed(delay));
        Some(due_at.unwrap_or(DateTime::<Utc>::MAX_UTC))
    }

    async fn report_exhausted(&self, report: &mut ReconcileReport) -> Result<()> {
        let filter = AnchorFilter::with_status(AnchorStatus::Failed)
            .attempts_at_least(self.config.max_total_attempts)
            .order(AnchorOrder::OldestUpdated)
            .page(self.config.batch_size, 0);

        for anchor in self.store.list_anchors(filter).await? {
            report.requires_attention += 1;
            self.flag_for_operator(&anchor).await;
        }

        Ok(())
    }

    async fn flag_for_operator(&self, anchor: &Anchor) {
        warn!(
            anchor_id = %anchor.id,
            idempotency_key = %anchor.idempotency_key,
            attempt_count = anchor.attempt_count,
            last_error = anchor.last_error.as_deref().unwrap_or("none"),
            "anchor requires manual reconciliation"
        );
        self.event_handler
            .handle_event(AnchorEvent::RequiresAttention {
                anchor_id: anchor.id,
                attempt_count: anchor.attempt_count,
                last_error: anchor.last_error.clone(),
            })
            .await;
    }

    async fn confirm_posted(&self, report: &mut ReconcileReport) -> Result<()> {
        let posted = self.store.list_anchors(self.oldest_first(AnchorStatus::Posted)).await?;

        for anchor in posted {
            match self.poster.confirm(anchor.id).await {
                Ok(ConfirmationStatus::Confirmed) => report.confirmed += 1,
                Ok(ConfirmationStatus::Pending | ConfirmationStatus::Unknown) => {
                    report.still_pending += 1;
                },
                Err(LedgerError::LeaseConflict { .. } | LedgerError::NotPublished { .. }) => {
                    report.skipped += 1;
                },
                Err(e) => {
                    report.errors += 1;
                    warn!(anchor_id = %anchor.id, error = %e, "confirmation check failed");
                },
            }
        }

        Ok(())
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("poster", &self.poster)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
