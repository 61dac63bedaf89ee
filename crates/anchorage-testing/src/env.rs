//! Assembled pipeline over in-memory collaborators.

use std::{sync::Arc, time::Duration};

use anchorage_core::{
    Anchor, AnchorId, AnchorStatus, AnchorStore, Clock, EventHandler, InMemoryAnchorStore,
    TestClock, Window,
};
use anchorage_ledger::{
    BackoffStrategy, LedgerClient, Poster, PosterConfig, Reconciler, ReconcilerConfig, RetryPolicy,
};
use anchorage_service::{AnchorService, DuplicatePolicy, ServiceConfig, TriggerOutcome};
use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};

use crate::{
    events::RecordingEventHandler, fixtures, ledger::ScriptedLedger, source::StaticEventSource,
};

/// Endpoint name of the primary scripted ledger.
pub const PRIMARY_ENDPOINT: &str = "http://primary.ledger";

/// Endpoint name of the failover scripted ledger.
pub const FAILOVER_ENDPOINT: &str = "http://failover.ledger";

/// Builder for [`TestEnv`].
#[derive(Debug)]
pub struct TestEnvBuilder {
    start: DateTime<Utc>,
    primary: ScriptedLedger,
    failover: Option<ScriptedLedger>,
    poster: PosterConfig,
    reconciler: ReconcilerConfig,
    service: ServiceConfig,
}

impl Default for TestEnvBuilder {
    fn default() -> Self {
        let retry_policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.0, // deterministic delays
            backoff_strategy: BackoffStrategy::Exponential,
        };

        Self {
            start: Utc.with_ymd_and_hms(2024, 3, 2, 0, 5, 0).single().unwrap_or_default(),
            primary: ScriptedLedger::new(PRIMARY_ENDPOINT),
            failover: Some(ScriptedLedger::new(FAILOVER_ENDPOINT)),
            poster: PosterConfig {
                call_timeout: Duration::from_secs(30),
                retry_policy,
                ..PosterConfig::default()
            },
            reconciler: ReconcilerConfig::default(),
            service: ServiceConfig { publish_inline: false, ..ServiceConfig::default() },
        }
    }
}

impl TestEnvBuilder {
    /// Creates a builder with deterministic defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the initial wall time (default: 2024-03-02T00:05:00Z).
    #[must_use]
    pub fn starting_at(mut self, start: DateTime<Utc>) -> Self {
        self.start = start;
        self
    }

    /// Replaces the primary ledger.
    #[must_use]
    pub fn primary(mut self, ledger: ScriptedLedger) -> Self {
        self.primary = ledger;
        self
    }

    /// Replaces the failover ledger.
    #[must_use]
    pub fn failover(mut self, ledger: ScriptedLedger) -> Self {
        self.failover = Some(ledger);
        self
    }

    /// Publishes to the primary only.
    #[must_use]
    pub fn without_failover(mut self) -> Self {
        self.failover = None;
        self
    }

    /// Sets the per-endpoint retry policy.
    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.poster.retry_policy = policy;
        self
    }

    /// Sets the per-call ledger timeout (default: 30s).
    #[must_use]
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.poster.call_timeout = timeout;
        self
    }

    /// Sets the attempt ceiling for both poster and reconciler.
    #[must_use]
    pub fn max_total_attempts(mut self, max: u32) -> Self {
        self.poster.max_total_attempts = max;
        self.reconciler.max_total_attempts = max;
        self
    }

    /// Sets the POSTING liveness threshold for both poster and reconciler
    /// (default: 300s).
    #[must_use]
    pub fn posting_liveness(mut self, liveness: Duration) -> Self {
        self.poster.posting_liveness = liveness;
        self.reconciler.posting_liveness = liveness;
        self
    }

    /// Sets the delay before a FAILED anchor is retried and its cap
    /// (default: 60s doubling up to 3600s).
    #[must_use]
    pub fn reconcile_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.reconciler.retry_delay_base = base;
        self.reconciler.retry_delay_max = max;
        self
    }

    /// Sets the reconciler batch size (default: 100).
    #[must_use]
    pub fn batch_size(mut self, size: usize) -> Self {
        self.reconciler.batch_size = size;
        self
    }

    /// Sets the duplicate hash policy (default: allow).
    #[must_use]
    pub fn duplicate_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.service.duplicate_policy = policy;
        self
    }

    /// Enables publication inside `trigger_anchor` (default: off).
    #[must_use]
    pub fn publish_inline(mut self, enabled: bool) -> Self {
        self.service.publish_inline = enabled;
        self
    }

    /// Wires every component together.
    pub fn build(self) -> Result<TestEnv> {
        let clock = TestClock::starting_at(self.start);
        let store = Arc::new(InMemoryAnchorStore::new());
        let source = Arc::new(StaticEventSource::default());
        let events = Arc::new(RecordingEventHandler::new());
        let primary = Arc::new(self.primary);
        let failover = self.failover.map(Arc::new);

        let dyn_store: Arc<dyn AnchorStore> = store.clone();
        let dyn_clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let handler: Arc<dyn EventHandler> = events.clone();

        let mut ledgers: Vec<Arc<dyn LedgerClient>> = vec![primary.clone()];
        if let Some(failover) = &failover {
            ledgers.push(failover.clone());
        }

        let poster = Arc::new(
            Poster::new(dyn_store.clone(), ledgers, self.poster, dyn_clock.clone())
                .context("building poster")?
                .with_event_handler(handler.clone()),
        );
        let reconciler =
            Reconciler::new(dyn_store.clone(), poster.clone(), dyn_clock.clone(), self.reconciler)
                .context("building reconciler")?
                .with_event_handler(handler.clone());
        let service = AnchorService::new(dyn_store, source.clone(), dyn_clock, self.service)
            .with_poster(poster.clone())
            .with_event_handler(handler);

        Ok(TestEnv { clock, store, source, events, primary, failover, poster, reconciler, service })
    }
}

/// Complete pipeline with scripted ledgers and virtual time.
#[derive(Debug)]
pub struct TestEnv {
    /// Virtual clock shared by every component.
    pub clock: TestClock,
    /// Backing store.
    pub store: Arc<InMemoryAnchorStore>,
    /// Events served to the service.
    pub source: Arc<StaticEventSource>,
    /// Every lifecycle event emitted.
    pub events: Arc<RecordingEventHandler>,
    /// Highest-priority ledger.
    pub primary: Arc<ScriptedLedger>,
    /// Second ledger, unless disabled.
    pub failover: Option<Arc<ScriptedLedger>>,
    /// Poster over both ledgers.
    pub poster: Arc<Poster>,
    /// Reconciler sharing the poster.
    pub reconciler: Reconciler,
    /// Service publishing through the poster when inline publication is on.
    pub service: AnchorService,
}

impl TestEnv {
    /// Environment with default settings.
    pub fn new() -> Result<Self> {
        TestEnvBuilder::new().build()
    }

    /// Builder for a customized environment.
    pub fn builder() -> TestEnvBuilder {
        TestEnvBuilder::new()
    }

    /// The day before the clock's current day.
    pub fn yesterday(&self) -> Result<Window> {
        Window::previous_day(self.clock.now_utc()).context("computing previous day")
    }

    /// Serves `count` distinct events inside `window`.
    pub fn seed_window(&self, window: &Window, count: u32) {
        self.source.set_events(fixtures::events_in(window, fixtures::digests(count)));
    }

    /// Seeds and anchors `count` events for `window`.
    pub async fn anchor_window(&self, window: Window, count: u32) -> Result<TriggerOutcome> {
        self.seed_window(&window, count);
        self.service.trigger_anchor(window).await.context("triggering anchor")
    }

    /// Loads an anchor that must exist.
    pub async fn anchor(&self, anchor_id: AnchorId) -> Result<Anchor> {
        self.store
            .find_anchor(anchor_id)
            .await
            .context("loading anchor")?
            .with_context(|| format!("anchor {anchor_id} not found"))
    }

    /// Current status of an anchor that must exist.
    pub async fn status(&self, anchor_id: AnchorId) -> Result<AnchorStatus> {
        self.store
            .status_of(anchor_id)
            .await
            .with_context(|| format!("anchor {anchor_id} not found"))
    }

    /// Moves virtual time forward.
    pub fn advance(&self, duration: Duration) {
        self.clock.advance(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn default_env_anchors_and_publishes() {
        let env = TestEnv::new().unwrap();
        let window = env.yesterday().unwrap();

        let outcome = env.anchor_window(window, 3).await.unwrap();
        assert_eq!(outcome.status, AnchorStatus::Pending);

        let receipt = env.poster.publish(outcome.anchor_id).await.unwrap();
        assert_eq!(receipt.endpoint, PRIMARY_ENDPOINT);
        assert_eq!(env.status(outcome.anchor_id).await.unwrap(), AnchorStatus::Posted);
    }

    #[test]
    fn liveness_shorter_than_a_publish_cycle_is_rejected() {
        let error = TestEnv::builder().call_timeout(Duration::from_secs(400)).build().unwrap_err();
        assert!(format!("{error:#}").contains("worst-case publish cycle"), "{error:#}");

        assert!(TestEnv::builder().posting_liveness(Duration::ZERO).build().is_err());
    }
}
