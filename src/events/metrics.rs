//! Lock-free counters for event bus health.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Metrics for event bus operations.
///
/// Counters use `SeqCst` so snapshot reads stay coherent across fields.
#[derive(Debug, Clone, Default)]
pub struct EventBusMetrics {
    events_published: Arc<AtomicU64>,
    events_dropped: Arc<AtomicU64>,
    active_subscribers: Arc<AtomicUsize>,
    peak_subscribers: Arc<AtomicUsize>,
}

impl EventBusMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(super) fn record_publish(&self, subscriber_count: usize) {
        self.events_published.fetch_add(1, Ordering::SeqCst);
        self.update_subscribers(subscriber_count);
        if subscriber_count == 0 {
            self.events_dropped.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub(super) fn update_subscribers(&self, count: usize) {
        self.active_subscribers.store(count, Ordering::SeqCst);
        let _ = self.peak_subscribers.fetch_max(count, Ordering::SeqCst);
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_published: self.events_published.load(Ordering::SeqCst),
            events_dropped: self.events_dropped.load(Ordering::SeqCst),
            active_subscribers: self.active_subscribers.load(Ordering::SeqCst),
            peak_subscribers: self.peak_subscribers.load(Ordering::SeqCst),
        }
    }
}

/// Coherent point-in-time view of the bus counters
#[derive(Debug, Clone, Copy)]
pub struct MetricsSnapshot {
    pub events_published: u64,
    pub events_dropped: u64,
    pub active_subscribers: usize,
    pub peak_subscribers: usize,
}

impl MetricsSnapshot {
    /// Fraction of publishes that reached at least one subscriber
    #[must_use]
    pub fn delivery_rate(&self) -> f64 {
        if self.events_published == 0 {
            return 1.0;
        }
        (self.events_published - self.events_dropped) as f64 / self.events_published as f64
    }
}
