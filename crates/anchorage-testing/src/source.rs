//! In-memory event source.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Mutex,
};

use anchorage_core::Window;
use anchorage_service::{AnchorError, EventSource, WindowEvent};
use async_trait::async_trait;

/// Event source serving a fixed list of events.
///
/// Every fetch returns the whole list regardless of the requested window,
/// the way a sloppy upstream would.
#[derive(Debug, Default)]
pub struct StaticEventSource {
    events: Mutex<Vec<WindowEvent>>,
    unavailable: AtomicBool,
    fetches: AtomicUsize,
}

impl StaticEventSource {
    /// Creates a source serving `events`.
    pub fn new(events: Vec<WindowEvent>) -> Self {
        Self { events: Mutex::new(events), ..Self::default() }
    }

    /// Replaces the served events.
    pub fn set_events(&self, events: Vec<WindowEvent>) {
        *self.lock() = events;
    }

    /// Appends events, e.g. to simulate redelivery.
    pub fn extend(&self, events: impl IntoIterator<Item = WindowEvent>) {
        self.lock().extend(events);
    }

    /// Makes subsequent fetches fail until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of fetches served or refused.
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<WindowEvent>> {
        self.events.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl EventSource for StaticEventSource {
    async fn fetch_window(&self, _window: &Window) -> anchorage_service::Result<Vec<WindowEvent>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AnchorError::source("event store unavailable"));
        }
        Ok(self.lock().clone())
    }
}
