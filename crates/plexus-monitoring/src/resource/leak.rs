//! Leak detector — periodic probes of memory and resource counters with
//! typed alerts.
//!
//! The probe samples process memory via `sysinfo`, reads the resource
//! manager's counters and the task tracker, compares everything against the
//! configured thresholds, and emits a `system:memory.leak.detected` event
//! (critical priority) plus an optional callback for each breach. Alerts
//! carry a per-type cooldown so a sustained condition does not flood the
//! bus. Critical alerts never stop the process — the detector observes,
//! the operator decides.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use plexus_kernel::bus::EventBus;
use plexus_kernel::config::LeakDetectorConfig;
use plexus_kernel::event::BusEvent;
use plexus_kernel::ids;

use super::{ResourceManager, TaskTracker};

// ---------------------------------------------------------------------------
// Alert model
// ---------------------------------------------------------------------------

/// Category of a detected leak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeakType {
    MemoryGrowth,
    ListenerLeak,
    TimerLeak,
    PromiseLeak,
    ResourceLeak,
    HeapOverflow,
}

/// Alert severity ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

/// Overall risk classification of one probe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeakRisk {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

/// Process memory sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MemorySample {
    /// Resident set size, bytes.
    pub rss_bytes: u64,
    /// Virtual memory, bytes.
    pub virtual_bytes: u64,
    /// System total memory, bytes.
    pub total_bytes: u64,
    /// RSS as a percentage of system memory.
    pub usage_percent: f64,
    /// RSS growth since the baseline probe, in megabytes.
    pub growth_mb: f64,
}

/// One emitted alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeakAlert {
    pub id: String,
    pub leak_type: LeakType,
    pub severity: AlertSeverity,
    pub message: String,
    pub source: String,
    pub recommended_action: String,
    pub timestamp: u64,
    pub memory: MemorySample,
    pub active_timers: usize,
    pub pending_tasks: usize,
    pub listeners: usize,
}

/// Full result of one probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeReport {
    pub timestamp: u64,
    pub memory: MemorySample,
    pub active_timers: usize,
    pub pending_tasks: usize,
    pub listeners: usize,
    pub bus_subscribers: usize,
    pub tracked_resources: usize,
    pub risk: LeakRisk,
    pub alerts: Vec<LeakAlert>,
}

/// Callback signature for direct alert delivery.
pub type AlertCallback = dyn Fn(&LeakAlert) + Send + Sync;

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

/// Periodic resource-leak monitor.
pub struct LeakDetector {
    config: LeakDetectorConfig,
    resources: Arc<ResourceManager>,
    tasks: Arc<TaskTracker>,
    bus: Option<Arc<EventBus>>,
    callback: std::sync::RwLock<Option<Arc<AlertCallback>>>,
    system: Mutex<System>,
    pid: Option<Pid>,
    baseline_rss: Mutex<Option<u64>>,
    cooldowns: Mutex<HashMap<LeakType, u64>>,
}

impl LeakDetector {
    pub fn new(
        config: LeakDetectorConfig,
        resources: Arc<ResourceManager>,
        tasks: Arc<TaskTracker>,
    ) -> Self {
        Self {
            config,
            resources,
            tasks,
            bus: None,
            callback: std::sync::RwLock::new(None),
            system: Mutex::new(System::new()),
            pid: sysinfo::get_current_pid().ok(),
            baseline_rss: Mutex::new(None),
            cooldowns: Mutex::new(HashMap::new()),
        }
    }

    /// Publish alerts onto this bus as critical events.
    #[must_use]
    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Register a direct alert callback (in addition to the bus).
    pub fn set_alert_callback(&self, callback: Arc<AlertCallback>) {
        *self.callback.write().expect("callback lock poisoned") = Some(callback);
    }

    /// Sample process memory and compute growth against the baseline set on
    /// the first call.
    pub async fn sample_memory(&self) -> MemorySample {
        let (rss, virtual_bytes, total) = {
            let mut system = self.system.lock().await;
            system.refresh_memory();
            if let Some(pid) = self.pid {
                system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
            }
            let (rss, virt) = self
                .pid
                .and_then(|pid| system.process(pid))
                .map(|p| (p.memory(), p.virtual_memory()))
                .unwrap_or((0, 0));
            (rss, virt, system.total_memory())
        };

        let mut baseline = self.baseline_rss.lock().await;
        let base = *baseline.get_or_insert(rss);
        MemorySample {
            rss_bytes: rss,
            virtual_bytes,
            total_bytes: total,
            usage_percent: if total > 0 {
                rss as f64 / total as f64 * 100.0
            } else {
                0.0
            },
            growth_mb: (rss as f64 - base as f64) / (1024.0 * 1024.0),
        }
    }

    /// Run one probe: sample, evaluate thresholds, emit alerts.
    pub async fn probe(&self) -> ProbeReport {
        let memory = self.sample_memory().await;
        let counts = self.resources.counts();
        let pending_tasks = self.tasks.pending();
        let bus_subscribers = match &self.bus {
            Some(bus) => bus.active_subscribers().await,
            None => 0,
        };
        let listeners = counts.listeners + bus_subscribers;
        let thresholds = &self.config.thresholds;

        let mut candidates: Vec<(LeakType, AlertSeverity, String, String)> = Vec::new();

        if memory.usage_percent > thresholds.max_heap_usage_percent {
            candidates.push((
                LeakType::HeapOverflow,
                AlertSeverity::Critical,
                format!(
                    "memory usage at {:.1}% of system memory (threshold {:.1}%)",
                    memory.usage_percent, thresholds.max_heap_usage_percent
                ),
                "Shed load or restart the worker before the allocator fails".into(),
            ));
        }
        if memory.growth_mb > thresholds.memory_growth_mb {
            candidates.push((
                LeakType::MemoryGrowth,
                AlertSeverity::Warning,
                format!(
                    "resident memory grew {:.1} MB since baseline (threshold {:.1} MB)",
                    memory.growth_mb, thresholds.memory_growth_mb
                ),
                "Inspect recent executions for unreleased buffers".into(),
            ));
        }
        if counts.timers > thresholds.max_active_timers {
            candidates.push((
                LeakType::TimerLeak,
                AlertSeverity::Warning,
                format!(
                    "{} active timers (threshold {})",
                    counts.timers, thresholds.max_active_timers
                ),
                "Audit retry/timeout timers for missing releases".into(),
            ));
        }
        if pending_tasks > thresholds.max_pending_tasks {
            candidates.push((
                LeakType::PromiseLeak,
                AlertSeverity::Warning,
                format!(
                    "{} unresolved tracked tasks (threshold {})",
                    pending_tasks, thresholds.max_pending_tasks
                ),
                "Check for futures awaited on abandoned channels".into(),
            ));
        }
        if listeners > thresholds.max_listeners_per_object {
            candidates.push((
                LeakType::ListenerLeak,
                AlertSeverity::Warning,
                format!(
                    "{} registered listeners (threshold {})",
                    listeners, thresholds.max_listeners_per_object
                ),
                "Unsubscribe bus listeners when their owner shuts down".into(),
            ));
        }
        let resource_bound = thresholds.max_active_timers + thresholds.max_pending_tasks;
        if counts.total() > resource_bound {
            candidates.push((
                LeakType::ResourceLeak,
                AlertSeverity::Warning,
                format!(
                    "{} tracked resources overall (bound {})",
                    counts.total(),
                    resource_bound
                ),
                "Run the auto-cleanup sweep or lower resource lifetimes".into(),
            ));
        }

        let risk = Self::risk_of(&candidates);
        let mut alerts = Vec::new();
        for (leak_type, severity, message, action) in candidates {
            if !self.cooldown_elapsed(leak_type).await {
                continue;
            }
            let alert = LeakAlert {
                id: ids::alert_id(),
                leak_type,
                severity,
                message,
                source: "leak-detector".into(),
                recommended_action: action,
                timestamp: ids::now_ms(),
                memory,
                active_timers: counts.timers,
                pending_tasks,
                listeners,
            };
            self.deliver(&alert).await;
            alerts.push(alert);
        }

        ProbeReport {
            timestamp: ids::now_ms(),
            memory,
            active_timers: counts.timers,
            pending_tasks,
            listeners,
            bus_subscribers,
            tracked_resources: counts.total(),
            risk,
            alerts,
        }
    }

    /// Spawn the monitoring loop: probe on every interval, then run the
    /// auto-cleanup sweep when enabled.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let detector = Arc::clone(self);
        let interval =
            std::time::Duration::from_millis(detector.config.monitoring_interval_ms.max(1));
        tokio::spawn(async move {
            if !detector.config.enabled {
                return;
            }
            loop {
                tokio::time::sleep(interval).await;
                let report = detector.probe().await;
                debug!(
                    risk = ?report.risk,
                    timers = report.active_timers,
                    tasks = report.pending_tasks,
                    "Leak probe completed"
                );
                if detector.config.auto_cleanup.enabled {
                    let released = detector
                        .resources
                        .cleanup_older_than(detector.config.auto_cleanup.max_resource_age_ms);
                    if released > 0 && detector.config.auto_cleanup.force_gc {
                        // No collector to hint in Rust; the sweep itself
                        // returned the memory.
                        debug!(released, "Auto-cleanup completed");
                    }
                }
            }
        })
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn risk_of(candidates: &[(LeakType, AlertSeverity, String, String)]) -> LeakRisk {
        let criticals = candidates
            .iter()
            .filter(|(_, s, _, _)| *s == AlertSeverity::Critical)
            .count();
        let warnings = candidates
            .iter()
            .filter(|(_, s, _, _)| *s == AlertSeverity::Warning)
            .count();
        if criticals > 0 {
            LeakRisk::Critical
        } else if warnings >= 2 {
            LeakRisk::High
        } else if warnings == 1 {
            LeakRisk::Medium
        } else {
            LeakRisk::Low
        }
    }

    async fn cooldown_elapsed(&self, leak_type: LeakType) -> bool {
        let cooldown_ms = self.config.monitoring_interval_ms.saturating_mul(2);
        let now = ids::now_ms();
        let mut cooldowns = self.cooldowns.lock().await;
        match cooldowns.get(&leak_type) {
            Some(last) if now.saturating_sub(*last) < cooldown_ms => false,
            _ => {
                cooldowns.insert(leak_type, now);
                true
            }
        }
    }

    async fn deliver(&self, alert: &LeakAlert) {
        warn!(
            leak_type = ?alert.leak_type,
            severity = ?alert.severity,
            "{}",
            alert.message
        );
        if let Some(bus) = &self.bus {
            let event = BusEvent::new("system:memory.leak.detected", "leak-detector")
                .with_data(serde_json::to_value(alert).unwrap_or_default())
                .critical();
            if let Err(e) = bus.publish(event).await {
                debug!("Leak alert dropped by bus: {e}");
            }
        }
        let callback = self.callback.read().expect("callback lock poisoned").clone();
        if let Some(callback) = callback {
            callback(alert);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::super::ResourceKind;
    use super::*;
    use plexus_kernel::bus::EventFilter;
    use plexus_kernel::config::LeakThresholds;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config_with(thresholds: LeakThresholds) -> LeakDetectorConfig {
        LeakDetectorConfig {
            thresholds,
            // Zero interval → zero cooldown, so repeated probes in tests
            // still alert.
            monitoring_interval_ms: 0,
            ..Default::default()
        }
    }

    fn detector(thresholds: LeakThresholds) -> (Arc<ResourceManager>, Arc<TaskTracker>, LeakDetector) {
        let resources = Arc::new(ResourceManager::new());
        let tasks = Arc::new(TaskTracker::new());
        let detector = LeakDetector::new(config_with(thresholds), resources.clone(), tasks.clone());
        (resources, tasks, detector)
    }

    #[tokio::test]
    async fn quiet_system_probes_low_risk() {
        let (_resources, _tasks, detector) = detector(LeakThresholds::default());
        let report = detector.probe().await;
        assert_eq!(report.risk, LeakRisk::Low);
        assert!(report.alerts.iter().all(|a| a.leak_type != LeakType::TimerLeak));
    }

    #[tokio::test]
    async fn timer_leak_alert_fires_over_threshold() {
        let thresholds = LeakThresholds {
            max_active_timers: 100,
            ..Default::default()
        };
        let (resources, _tasks, detector) = detector(thresholds);
        for i in 0..200 {
            resources.register(format!("timer-{i}"), ResourceKind::Timer, || Ok(()));
        }

        let report = detector.probe().await;
        let alert = report
            .alerts
            .iter()
            .find(|a| a.leak_type == LeakType::TimerLeak)
            .expect("timer leak alert");
        assert_eq!(alert.severity, AlertSeverity::Warning);
        assert_eq!(alert.active_timers, 200);
        assert!(report.risk >= LeakRisk::Medium);
    }

    #[tokio::test]
    async fn promise_leak_counts_tracked_tasks() {
        let thresholds = LeakThresholds {
            max_pending_tasks: 2,
            ..Default::default()
        };
        let (_resources, tasks, detector) = detector(thresholds);
        let _guards: Vec<_> = (0..5).map(|_| tasks.track()).collect();

        let report = detector.probe().await;
        assert!(
            report
                .alerts
                .iter()
                .any(|a| a.leak_type == LeakType::PromiseLeak)
        );
        assert_eq!(report.pending_tasks, 5);
    }

    #[tokio::test]
    async fn alerts_published_to_bus_and_callback() {
        let thresholds = LeakThresholds {
            max_active_timers: 0,
            ..Default::default()
        };
        let resources = Arc::new(ResourceManager::new());
        let tasks = Arc::new(TaskTracker::new());
        let bus = Arc::new(EventBus::new());
        let (_id, mut rx) = bus
            .subscribe_channel(EventFilter::all().with_type("system:*"))
            .await;

        let detector = LeakDetector::new(config_with(thresholds), resources.clone(), tasks)
            .with_bus(bus.clone());
        let hits = Arc::new(AtomicUsize::new(0));
        let callback_hits = Arc::clone(&hits);
        detector.set_alert_callback(Arc::new(move |_alert| {
            callback_hits.fetch_add(1, Ordering::SeqCst);
        }));

        resources.register("timer", ResourceKind::Timer, || Ok(()));
        let report = detector.probe().await;
        assert!(!report.alerts.is_empty());
        assert_eq!(hits.load(Ordering::SeqCst), report.alerts.len());

        bus.flush().await;
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, "system:memory.leak.detected");
        assert_eq!(event.priority, plexus_kernel::event::EventPriority::Critical);
    }

    #[tokio::test]
    async fn cooldown_suppresses_repeat_alerts() {
        let thresholds = LeakThresholds {
            max_active_timers: 0,
            ..Default::default()
        };
        let resources = Arc::new(ResourceManager::new());
        let tasks = Arc::new(TaskTracker::new());
        // Long interval → long cooldown.
        let config = LeakDetectorConfig {
            thresholds,
            monitoring_interval_ms: 60_000,
            ..Default::default()
        };
        let detector = LeakDetector::new(config, resources.clone(), tasks);
        resources.register("timer", ResourceKind::Timer, || Ok(()));

        let first = detector.probe().await;
        assert!(!first.alerts.is_empty());
        let second = detector.probe().await;
        assert!(second.alerts.is_empty(), "cooldown should suppress repeats");
    }

    #[tokio::test]
    async fn memory_sample_is_plausible() {
        let (_resources, _tasks, detector) = detector(LeakThresholds::default());
        let sample = detector.sample_memory().await;
        assert!(sample.total_bytes > 0);
        assert!(sample.usage_percent >= 0.0);
        // First sample is its own baseline.
        assert!(sample.growth_mb.abs() < 1.0);
    }
}
