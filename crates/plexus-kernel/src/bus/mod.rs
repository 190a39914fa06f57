//! In-process event bus with correlation, buffering, and backpressure.
//!
//! Publishers append [`BusEvent`]s to a bounded ring buffer; a single
//! dispatch loop drains the buffer (periodically, at a high-water mark, or
//! on demand) and fans events out to matching subscribers. Because the
//! buffer is FIFO and dispatch is sequential, events from one producer are
//! delivered in publish order.
//!
//! # Backpressure
//!
//! The buffer never blocks publishers. When occupancy reaches the
//! non-critical capacity (`buffer_size` minus the reserved critical
//! headroom), the oldest non-critical event is shed to make room; if
//! nothing can be shed, the incoming non-critical event is dropped and the
//! drop counter increments. Critical events may use the full buffer and are
//! only ever dropped when it is completely full of other critical events.
//!
//! # Subscriber isolation
//!
//! Handler errors are caught and counted per subscriber. A subscriber whose
//! consecutive error count reaches `error_threshold` is quarantined: it is
//! removed from dispatch and a critical `bus:subscriber.quarantined` alert
//! is published.

pub mod config;
pub mod error;
pub mod metrics;

pub use config::BusConfig;
pub use error::{BusError, SubscriberError};
pub use metrics::{BusMetrics, BusMetricsSnapshot};

use crate::event::{BusEvent, EventPriority};
use async_trait::async_trait;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tokio::sync::{Mutex, Notify, RwLock, mpsc};
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

/// Per-subscriber event filter.
///
/// Empty lists match everything. Type patterns ending in `*` are prefix
/// matches (`"step:*"`); all other entries are exact matches. Sources are
/// always exact.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    types: Vec<String>,
    sources: Vec<String>,
}

impl EventFilter {
    /// A filter matching every event.
    pub fn all() -> Self {
        Self::default()
    }

    /// Add a type pattern (exact, or prefix when ending in `*`).
    #[must_use]
    pub fn with_type(mut self, pattern: impl Into<String>) -> Self {
        self.types.push(pattern.into());
        self
    }

    /// Add a source component name.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.sources.push(source.into());
        self
    }

    /// Returns `true` if the event passes this filter.
    pub fn matches(&self, event: &BusEvent) -> bool {
        let type_ok = self.types.is_empty()
            || self.types.iter().any(|pattern| {
                match pattern.strip_suffix('*') {
                    Some(prefix) => event.event_type.starts_with(prefix),
                    None => event.event_type == *pattern,
                }
            });
        let source_ok = self.sources.is_empty() || self.sources.iter().any(|s| *s == event.source);
        type_ok && source_ok
    }
}

// ---------------------------------------------------------------------------
// Subscriber trait
// ---------------------------------------------------------------------------

/// A bus subscriber.
///
/// Handlers must be fast; slow handlers delay every later delivery in the
/// same flush cycle. Long work should be forwarded to an owned task (or use
/// [`EventBus::subscribe_channel`] which does exactly that).
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    /// Handle one event. Errors are counted against the subscriber and never
    /// reach the publisher.
    async fn handle(&self, event: &BusEvent) -> Result<(), SubscriberError>;

    /// Name used in logs and quarantine alerts.
    fn name(&self) -> &str {
        "subscriber"
    }
}

struct ChannelSubscriber {
    tx: mpsc::UnboundedSender<Arc<BusEvent>>,
}

#[async_trait]
impl EventSubscriber for ChannelSubscriber {
    async fn handle(&self, event: &BusEvent) -> Result<(), SubscriberError> {
        self.tx
            .send(Arc::new(event.clone()))
            .map_err(|_| "channel receiver dropped".into())
    }

    fn name(&self) -> &str {
        "channel"
    }
}

struct SubscriberEntry {
    subscriber: Arc<dyn EventSubscriber>,
    filter: EventFilter,
    consecutive_errors: AtomicU32,
    quarantined: AtomicBool,
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Core structure for the event bus. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct EventBus {
    config: Arc<BusConfig>,
    buffer: Arc<Mutex<VecDeque<BusEvent>>>,
    subscribers: Arc<RwLock<HashMap<String, Arc<SubscriberEntry>>>>,
    bus_metrics: Arc<BusMetrics>,
    flush_notify: Arc<Notify>,
    shut_down: Arc<AtomicBool>,
    next_subscription: Arc<AtomicU64>,
}

impl EventBus {
    /// Create a bus with default configuration.
    pub fn new() -> Self {
        Self::with_config(BusConfig::default())
    }

    /// Create a bus with the given configuration.
    pub fn with_config(config: BusConfig) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(VecDeque::with_capacity(config.buffer_size))),
            config: Arc::new(config),
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            bus_metrics: Arc::new(BusMetrics::new()),
            flush_notify: Arc::new(Notify::new()),
            shut_down: Arc::new(AtomicBool::new(false)),
            next_subscription: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Returns a reference to the live bus metrics.
    pub fn metrics(&self) -> &BusMetrics {
        &self.bus_metrics
    }

    /// Returns the bus configuration.
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Number of subscribers currently receiving events.
    pub async fn active_subscribers(&self) -> usize {
        self.subscribers
            .read()
            .await
            .values()
            .filter(|entry| !entry.quarantined.load(Ordering::Relaxed))
            .count()
    }

    /// Spawn the periodic flush loop. Call once after construction.
    ///
    /// The loop also wakes early when the buffer crosses the high-water mark
    /// and exits after [`shutdown`](Self::shutdown).
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let bus = self.clone();
        tokio::spawn(async move {
            let interval = std::time::Duration::from_millis(bus.config.flush_interval_ms);
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = bus.flush_notify.notified() => {}
                }
                if bus.shut_down.load(Ordering::SeqCst) {
                    bus.flush().await;
                    break;
                }
                bus.flush().await;
            }
        })
    }

    /// Stop accepting events and wake the flush loop for a final drain.
    pub async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        self.flush_notify.notify_one();
    }

    // -----------------------------------------------------------------------
    // Publishing
    // -----------------------------------------------------------------------

    /// Publish an event.
    ///
    /// Never blocks. Returns an error when the event itself was dropped
    /// (buffer at capacity with nothing older to shed) or the bus is shut
    /// down; shedding an *older* event to admit this one is reported via
    /// metrics only.
    pub async fn publish(&self, event: BusEvent) -> Result<(), BusError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(BusError::ShutDown);
        }

        let high_water = {
            let mut buffer = self.buffer.lock().await;
            let critical = event.priority == EventPriority::Critical;
            let cap = if critical {
                self.config.buffer_size
            } else {
                self.config.noncritical_capacity()
            };

            if buffer.len() >= cap {
                // Shed the oldest non-critical event to make room.
                let victim = buffer
                    .iter()
                    .position(|e| e.priority == EventPriority::Normal);
                match victim {
                    Some(pos) => {
                        buffer.remove(pos);
                        self.bus_metrics.record_drop();
                    }
                    None if critical => {
                        // Buffer entirely critical and full — nothing to shed.
                        self.bus_metrics.record_drop();
                        return Err(BusError::HeadroomExhausted {
                            event_type: event.event_type,
                        });
                    }
                    None => {
                        self.bus_metrics.record_drop();
                        return Err(BusError::BufferFull {
                            capacity: cap,
                            event_type: event.event_type,
                        });
                    }
                }
            }

            buffer.push_back(event);
            self.bus_metrics.record_publish();
            buffer.len() >= self.config.high_water_slots()
        };

        if high_water {
            self.flush_notify.notify_one();
        }
        Ok(())
    }

    /// Drain the buffer and dispatch every event to matching subscribers.
    ///
    /// Returns the number of events dispatched. Safe to call concurrently
    /// with publishes; events appended during dispatch wait for the next
    /// cycle.
    pub async fn flush(&self) -> usize {
        let batch: Vec<BusEvent> = {
            let mut buffer = self.buffer.lock().await;
            buffer.drain(..).collect()
        };
        if batch.is_empty() {
            return 0;
        }
        self.bus_metrics.record_flush();

        let entries: Vec<(String, Arc<SubscriberEntry>)> = {
            let subscribers = self.subscribers.read().await;
            subscribers
                .iter()
                .map(|(id, entry)| (id.clone(), entry.clone()))
                .collect()
        };

        let dispatched = batch.len();
        for event in batch {
            for (id, entry) in &entries {
                if entry.quarantined.load(Ordering::Relaxed) || !entry.filter.matches(&event) {
                    continue;
                }
                match entry.subscriber.handle(&event).await {
                    Ok(()) => {
                        entry.consecutive_errors.store(0, Ordering::Relaxed);
                        self.bus_metrics.record_delivery();
                    }
                    Err(err) => {
                        self.bus_metrics.record_subscriber_error();
                        let errors = entry.consecutive_errors.fetch_add(1, Ordering::Relaxed) + 1;
                        debug!(
                            subscriber = entry.subscriber.name(),
                            errors, "Subscriber handler failed: {err}"
                        );
                        if errors >= self.config.error_threshold {
                            self.quarantine(id, entry).await;
                        }
                    }
                }
            }
        }
        dispatched
    }

    async fn quarantine(&self, id: &str, entry: &SubscriberEntry) {
        if entry.quarantined.swap(true, Ordering::Relaxed) {
            return;
        }
        self.bus_metrics.record_quarantine();
        warn!(
            subscriber = entry.subscriber.name(),
            subscription = id,
            "Subscriber quarantined after repeated handler errors"
        );
        let alert = BusEvent::new("bus:subscriber.quarantined", "event-bus")
            .with_data(json!({
                "subscription_id": id,
                "subscriber": entry.subscriber.name(),
                "error_threshold": self.config.error_threshold,
            }))
            .critical();
        // Best effort: if the buffer is exhausted the alert is lost but the
        // quarantine itself still holds.
        let _ = self.publish(alert).await;
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    /// Register a subscriber. Returns the subscription ID used to unsubscribe.
    pub async fn subscribe(
        &self,
        filter: EventFilter,
        subscriber: Arc<dyn EventSubscriber>,
    ) -> String {
        let id = format!(
            "sub-{}",
            self.next_subscription.fetch_add(1, Ordering::Relaxed)
        );
        let entry = Arc::new(SubscriberEntry {
            subscriber,
            filter,
            consecutive_errors: AtomicU32::new(0),
            quarantined: AtomicBool::new(false),
        });
        self.subscribers.write().await.insert(id.clone(), entry);
        id
    }

    /// Register a channel-backed subscription and return its receiver.
    ///
    /// The channel is unbounded, so a slow consumer holds memory rather than
    /// stalling dispatch. Dropping the receiver eventually quarantines the
    /// internal forwarder, which removes the subscription from dispatch.
    pub async fn subscribe_channel(
        &self,
        filter: EventFilter,
    ) -> (String, mpsc::UnboundedReceiver<Arc<BusEvent>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self
            .subscribe(filter, Arc::new(ChannelSubscriber { tx }))
            .await;
        (id, rx)
    }

    /// Remove a subscription.
    pub async fn unsubscribe(&self, subscription_id: &str) -> Result<(), BusError> {
        self.subscribers
            .write()
            .await
            .remove(subscription_id)
            .map(|_| ())
            .ok_or_else(|| BusError::SubscriptionNotFound(subscription_id.to_string()))
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Global accessor
// ---------------------------------------------------------------------------

static GLOBAL_BUS: std::sync::RwLock<Option<Arc<EventBus>>> = std::sync::RwLock::new(None);

/// Install the process-wide bus. Intended to be called once at startup;
/// later calls atomically swap the instance.
pub fn set_global_bus(bus: Arc<EventBus>) {
    *GLOBAL_BUS.write().expect("global bus lock poisoned") = Some(bus);
}

/// Retrieve the process-wide bus, if one has been installed.
pub fn global_bus() -> Option<Arc<EventBus>> {
    GLOBAL_BUS.read().expect("global bus lock poisoned").clone()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingSubscriber {
        seen: AtomicUsize,
    }

    #[async_trait]
    impl EventSubscriber for CountingSubscriber {
        async fn handle(&self, _event: &BusEvent) -> Result<(), SubscriberError> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingSubscriber;

    #[async_trait]
    impl EventSubscriber for FailingSubscriber {
        async fn handle(&self, _event: &BusEvent) -> Result<(), SubscriberError> {
            Err("boom".into())
        }

        fn name(&self) -> &str {
            "always-fails"
        }
    }

    #[tokio::test]
    async fn publish_flush_deliver() {
        let bus = EventBus::new();
        let subscriber = Arc::new(CountingSubscriber {
            seen: AtomicUsize::new(0),
        });
        bus.subscribe(EventFilter::all(), subscriber.clone()).await;

        bus.publish(BusEvent::new("step:started", "scheduler"))
            .await
            .unwrap();
        bus.publish(BusEvent::new("step:completed", "scheduler"))
            .await
            .unwrap();

        let dispatched = bus.flush().await;
        assert_eq!(dispatched, 2);
        assert_eq!(subscriber.seen.load(Ordering::SeqCst), 2);
        assert_eq!(bus.metrics().delivered(), 2);
    }

    #[tokio::test]
    async fn filter_by_type_prefix_and_source() {
        let bus = EventBus::new();
        let step_only = Arc::new(CountingSubscriber {
            seen: AtomicUsize::new(0),
        });
        bus.subscribe(EventFilter::all().with_type("step:*"), step_only.clone())
            .await;
        let from_planner = Arc::new(CountingSubscriber {
            seen: AtomicUsize::new(0),
        });
        bus.subscribe(
            EventFilter::all().with_source("planner"),
            from_planner.clone(),
        )
        .await;

        bus.publish(BusEvent::new("step:started", "scheduler"))
            .await
            .unwrap();
        bus.publish(BusEvent::new("planner:plan.created", "planner"))
            .await
            .unwrap();
        bus.flush().await;

        assert_eq!(step_only.seen.load(Ordering::SeqCst), 1);
        assert_eq!(from_planner.seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn channel_subscription_preserves_order() {
        let bus = EventBus::new();
        let (_id, mut rx) = bus.subscribe_channel(EventFilter::all()).await;

        for i in 0..5 {
            bus.publish(
                BusEvent::new("step:started", "scheduler").with_data(serde_json::json!(i)),
            )
            .await
            .unwrap();
        }
        bus.flush().await;

        for expected in 0..5 {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.data, serde_json::json!(expected));
        }
    }

    #[tokio::test]
    async fn noncritical_dropped_at_capacity_critical_survives() {
        // Buffer of 10 with 10% headroom → non-critical capacity 9.
        let config = BusConfig::new(10).with_critical_headroom(0.1);
        let bus = EventBus::with_config(config);

        for _ in 0..9 {
            bus.publish(BusEvent::new("step:started", "s").critical())
                .await
                .unwrap();
        }

        // All slots up to the non-critical cap hold critical events, so a
        // normal event has nothing to shed and is itself dropped.
        let dropped_before = bus.metrics().dropped();
        let result = bus.publish(BusEvent::new("step:completed", "s")).await;
        assert!(matches!(result, Err(BusError::BufferFull { .. })));
        assert_eq!(bus.metrics().dropped(), dropped_before + 1);

        // A critical event still fits in the reserved headroom.
        bus.publish(BusEvent::new("plan:failed", "s").critical())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn full_buffer_sheds_oldest_noncritical() {
        let config = BusConfig::new(4).with_critical_headroom(0.0);
        let bus = EventBus::with_config(config);

        for i in 0..4 {
            bus.publish(BusEvent::new("step:started", "s").with_data(serde_json::json!(i)))
                .await
                .unwrap();
        }
        // Fifth publish evicts the oldest buffered event.
        bus.publish(BusEvent::new("step:started", "s").with_data(serde_json::json!(4)))
            .await
            .unwrap();
        assert_eq!(bus.metrics().dropped(), 1);

        let (_id, mut rx) = bus.subscribe_channel(EventFilter::all()).await;
        bus.flush().await;
        let first = rx.recv().await.unwrap();
        assert_eq!(first.data, serde_json::json!(1));
    }

    #[tokio::test]
    async fn failing_subscriber_is_quarantined_and_alert_published() {
        let config = BusConfig::default().with_error_threshold(3);
        let bus = EventBus::with_config(config);
        bus.subscribe(EventFilter::all().with_type("step:*"), Arc::new(FailingSubscriber))
            .await;
        let (_id, mut rx) = bus
            .subscribe_channel(EventFilter::all().with_type("bus:*"))
            .await;

        for _ in 0..3 {
            bus.publish(BusEvent::new("step:started", "s")).await.unwrap();
            bus.flush().await;
        }

        assert_eq!(bus.metrics().quarantined(), 1);
        assert_eq!(bus.metrics().subscriber_errors(), 3);
        assert_eq!(bus.active_subscribers().await, 1);

        bus.flush().await;
        let alert = rx.recv().await.unwrap();
        assert_eq!(alert.event_type, "bus:subscriber.quarantined");
        assert_eq!(alert.priority, EventPriority::Critical);
    }

    #[tokio::test]
    async fn unsubscribe_unknown_id_errors() {
        let bus = EventBus::new();
        let result = bus.unsubscribe("sub-404").await;
        assert!(matches!(result, Err(BusError::SubscriptionNotFound(_))));
    }

    #[tokio::test]
    async fn shutdown_rejects_publishes() {
        let bus = EventBus::new();
        bus.shutdown().await;
        let result = bus.publish(BusEvent::new("step:started", "s")).await;
        assert!(matches!(result, Err(BusError::ShutDown)));
    }

    #[tokio::test]
    async fn background_flush_loop_delivers() {
        let config = BusConfig::new(64).with_flush_interval_ms(10);
        let bus = EventBus::with_config(config);
        let handle = bus.start();
        let (_id, mut rx) = bus.subscribe_channel(EventFilter::all()).await;

        bus.publish(BusEvent::new("step:started", "s")).await.unwrap();

        let event = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .expect("flush loop did not deliver in time")
            .unwrap();
        assert_eq!(event.event_type, "step:started");

        bus.shutdown().await;
        let _ = handle.await;
    }
}
