//! Clock abstraction so lifecycle timestamps and backoff waits are testable.
//!
//! Every timestamp written to an anchor comes from a `Clock`, which lets
//! tests age anchors past the liveness threshold without sleeping.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};

/// Source of time for the pipeline.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Monotonic instant for measuring elapsed time.
    fn now(&self) -> Instant;

    /// Wall-clock time used for anchor timestamps.
    fn now_utc(&self) -> DateTime<Utc>;

    /// Waits for `duration`.
    ///
    /// Backed by `tokio::time::sleep` in production; test clocks advance
    /// virtual time and return immediately.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Production clock using system time and tokio timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Manually driven clock for deterministic tests.
///
/// Clones share the same time, so a clock handed to a poster can be advanced
/// from the test body.
#[derive(Debug, Clone)]
pub struct TestClock {
    elapsed_ns: Arc<AtomicU64>,
    wall_ns: Arc<AtomicI64>,
    base_instant: Instant,
}

impl TestClock {
    /// Creates a clock starting at the current wall time.
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Creates a clock starting at `start`.
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            elapsed_ns: Arc::new(AtomicU64::new(0)),
            wall_ns: Arc::new(AtomicI64::new(start.timestamp_nanos_opt().unwrap_or(0))),
            base_instant: Instant::now(),
        }
    }

    /// Moves both monotonic and wall time forward.
    pub fn advance(&self, duration: Duration) {
        let ns = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.elapsed_ns.fetch_add(ns, Ordering::AcqRel);
        self.wall_ns.fetch_add(i64::try_from(ns).unwrap_or(i64::MAX), Ordering::AcqRel);
    }

    /// Sets wall time to `at`. Monotonic time only moves forward.
    pub fn jump_to(&self, at: DateTime<Utc>) {
        let target = at.timestamp_nanos_opt().unwrap_or(0);
        let previous = self.wall_ns.swap(target, Ordering::AcqRel);
        if let Ok(forward) = u64::try_from(target.saturating_sub(previous)) {
            self.elapsed_ns.fetch_add(forward, Ordering::AcqRel);
        }
    }

    /// Total virtual time elapsed since creation.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.elapsed_ns.load(Ordering::Acquire))
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.base_instant + self.elapsed()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(self.wall_ns.load(Ordering::Acquire))
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn epoch_plus(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn advance_moves_wall_and_monotonic_time() {
        let clock = TestClock::starting_at(epoch_plus(1_000));
        let start = clock.now();

        clock.advance(Duration::from_secs(90));

        assert_eq!(clock.now().duration_since(start), Duration::from_secs(90));
        assert_eq!(clock.now_utc(), epoch_plus(1_090));
    }

    #[test]
    fn jump_backwards_keeps_monotonic_time() {
        let clock = TestClock::starting_at(epoch_plus(5_000));
        clock.jump_to(epoch_plus(6_000));
        assert_eq!(clock.elapsed(), Duration::from_secs(1_000));

        clock.jump_to(epoch_plus(4_000));
        assert_eq!(clock.now_utc(), epoch_plus(4_000));
        assert_eq!(clock.elapsed(), Duration::from_secs(1_000));
    }

    #[tokio::test]
    async fn sleep_advances_virtual_time() {
        let clock = TestClock::starting_at(epoch_plus(0));

        clock.sleep(Duration::from_secs(5)).await;

        assert_eq!(clock.now_utc(), epoch_plus(5));
    }
}
