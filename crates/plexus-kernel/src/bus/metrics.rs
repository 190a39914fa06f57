//! Lock-free metrics for the event bus.
//!
//! All counters use [`AtomicU64`] with [`Ordering::Relaxed`] — monotonic
//! counters have no causal dependencies, and relaxed ordering avoids
//! unnecessary memory fences on weak-memory architectures.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Ordering used for all metric updates.
const ORD: Ordering = Ordering::Relaxed;

/// Real-time, lock-free metrics for the [`EventBus`](super::EventBus).
///
/// Counters can be read from any thread without locking. For a serializable
/// point-in-time view, use [`snapshot()`](Self::snapshot).
#[derive(Debug, Default)]
pub struct BusMetrics {
    /// Events accepted into the buffer.
    published: AtomicU64,

    /// Subscriber deliveries that completed without error.
    delivered: AtomicU64,

    /// Events shed because the buffer was at (non-critical) capacity.
    dropped: AtomicU64,

    /// Handler invocations that returned an error.
    subscriber_errors: AtomicU64,

    /// Subscribers removed from dispatch after repeated errors.
    quarantined: AtomicU64,

    /// Flush cycles executed (periodic, high-water, or on demand).
    flushes: AtomicU64,
}

impl BusMetrics {
    /// Create a new zeroed metrics instance.
    pub fn new() -> Self {
        Self::default()
    }

    // -- Increment helpers (called by EventBus internals) ---------------------

    #[inline]
    pub(crate) fn record_publish(&self) {
        self.published.fetch_add(1, ORD);
    }

    #[inline]
    pub(crate) fn record_delivery(&self) {
        self.delivered.fetch_add(1, ORD);
    }

    #[inline]
    pub(crate) fn record_drop(&self) {
        self.dropped.fetch_add(1, ORD);
    }

    #[inline]
    pub(crate) fn record_subscriber_error(&self) {
        self.subscriber_errors.fetch_add(1, ORD);
    }

    #[inline]
    pub(crate) fn record_quarantine(&self) {
        self.quarantined.fetch_add(1, ORD);
    }

    #[inline]
    pub(crate) fn record_flush(&self) {
        self.flushes.fetch_add(1, ORD);
    }

    // -- Read accessors (public) ----------------------------------------------

    /// Events accepted into the buffer.
    #[inline]
    pub fn published(&self) -> u64 {
        self.published.load(ORD)
    }

    /// Successful subscriber deliveries.
    #[inline]
    pub fn delivered(&self) -> u64 {
        self.delivered.load(ORD)
    }

    /// Events dropped under backpressure.
    #[inline]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(ORD)
    }

    /// Handler errors observed.
    #[inline]
    pub fn subscriber_errors(&self) -> u64 {
        self.subscriber_errors.load(ORD)
    }

    /// Subscribers quarantined.
    #[inline]
    pub fn quarantined(&self) -> u64 {
        self.quarantined.load(ORD)
    }

    /// Flush cycles executed.
    #[inline]
    pub fn flushes(&self) -> u64 {
        self.flushes.load(ORD)
    }

    /// Take a point-in-time snapshot of all counters.
    ///
    /// Individual reads are atomic but the snapshot as a whole is not
    /// transactional; concurrent updates between reads may cause slight
    /// inconsistencies, which is acceptable for metrics.
    pub fn snapshot(&self) -> BusMetricsSnapshot {
        BusMetricsSnapshot {
            published: self.published(),
            delivered: self.delivered(),
            dropped: self.dropped(),
            subscriber_errors: self.subscriber_errors(),
            quarantined: self.quarantined(),
            flushes: self.flushes(),
        }
    }
}

/// A serializable point-in-time snapshot of bus metrics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusMetricsSnapshot {
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub subscriber_errors: u64,
    pub quarantined: u64,
    pub flushes: u64,
}

impl BusMetricsSnapshot {
    /// Fraction of published events shed under backpressure.
    ///
    /// Returns `0.0` if nothing has been published.
    pub fn drop_rate(&self) -> f64 {
        let offered = self.published + self.dropped;
        if offered == 0 {
            return 0.0;
        }
        self.dropped as f64 / offered as f64
    }
}
