//! Resource tracking — explicit registration of timers, listeners, tasks,
//! and streams against a disposal boundary.
//!
//! There is no runtime interception here: the scheduler, tool runners, and
//! bus adapters call [`ResourceManager::register`] explicitly when they
//! acquire something long-lived, and the returned ID releases it. On
//! [`dispose`](ResourceManager::dispose) everything still tracked is
//! released in reverse registration order with failures captured in the
//! log; double-dispose is a no-op.

pub mod leak;

pub use leak::{AlertSeverity, LeakAlert, LeakDetector, LeakRisk, LeakType, ProbeReport};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};

use plexus_kernel::ids::{Clock, SystemClock};

// ---------------------------------------------------------------------------
// Kinds and IDs
// ---------------------------------------------------------------------------

/// What kind of resource an entry tracks; drives leak-detector counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Timer,
    Listener,
    Task,
    Stream,
    Other,
}

/// Opaque handle for releasing a tracked resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId(u64);

/// Per-kind counts exposed to the leak detector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceCounts {
    pub timers: usize,
    pub listeners: usize,
    pub tasks: usize,
    pub streams: usize,
    pub other: usize,
}

impl ResourceCounts {
    pub fn total(&self) -> usize {
        self.timers + self.listeners + self.tasks + self.streams + self.other
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

type Disposer = Box<dyn FnOnce() -> Result<(), String> + Send>;

struct TrackedResource {
    id: u64,
    name: String,
    kind: ResourceKind,
    created_at: u64,
    disposer: Option<Disposer>,
}

struct ManagerInner {
    resources: Vec<TrackedResource>,
    next_id: u64,
    disposed: bool,
}

/// Scopes acquired resources to a disposal boundary.
///
/// Locking is a plain `std::sync::Mutex` held only for bookkeeping;
/// disposers run outside any await point, which keeps the manager usable
/// from `Drop` implementations.
pub struct ResourceManager {
    inner: std::sync::Mutex<ManagerInner>,
    clock: Arc<dyn Clock>,
}

impl ResourceManager {
    pub fn new() -> Self {
        Self {
            inner: std::sync::Mutex::new(ManagerInner {
                resources: Vec::new(),
                next_id: 1,
                disposed: false,
            }),
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock (tests).
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Track a resource. The disposer runs on release, sweep, or dispose.
    ///
    /// Registering against an already-disposed manager runs the disposer
    /// immediately: nothing may outlive the boundary.
    pub fn register(
        &self,
        name: impl Into<String>,
        kind: ResourceKind,
        disposer: impl FnOnce() -> Result<(), String> + Send + 'static,
    ) -> ResourceId {
        let name = name.into();
        let mut inner = self.inner.lock().expect("resource manager lock poisoned");
        let id = inner.next_id;
        inner.next_id += 1;
        if inner.disposed {
            drop(inner);
            if let Err(e) = disposer() {
                warn!(resource = %name, "Late-registered resource failed to dispose: {e}");
            }
            return ResourceId(id);
        }
        inner.resources.push(TrackedResource {
            id,
            name,
            kind,
            created_at: self.clock.now_millis(),
            disposer: Some(Box::new(disposer)),
        });
        ResourceId(id)
    }

    /// Release one resource, running its disposer. Returns `false` if the
    /// ID is unknown (already released or swept).
    pub fn release(&self, id: ResourceId) -> bool {
        let resource = {
            let mut inner = self.inner.lock().expect("resource manager lock poisoned");
            match inner.resources.iter().position(|r| r.id == id.0) {
                Some(index) => Some(inner.resources.remove(index)),
                None => None,
            }
        };
        match resource {
            Some(mut resource) => {
                if let Some(disposer) = resource.disposer.take() {
                    if let Err(e) = disposer() {
                        warn!(resource = %resource.name, "Resource disposer failed: {e}");
                    }
                }
                true
            }
            None => false,
        }
    }

    /// Count of tracked resources of one kind.
    pub fn count(&self, kind: ResourceKind) -> usize {
        self.inner
            .lock()
            .expect("resource manager lock poisoned")
            .resources
            .iter()
            .filter(|r| r.kind == kind)
            .count()
    }

    /// All per-kind counts.
    pub fn counts(&self) -> ResourceCounts {
        let inner = self.inner.lock().expect("resource manager lock poisoned");
        let mut counts = ResourceCounts::default();
        for resource in &inner.resources {
            match resource.kind {
                ResourceKind::Timer => counts.timers += 1,
                ResourceKind::Listener => counts.listeners += 1,
                ResourceKind::Task => counts.tasks += 1,
                ResourceKind::Stream => counts.streams += 1,
                ResourceKind::Other => counts.other += 1,
            }
        }
        counts
    }

    /// Dispose resources older than `max_age_ms`. Returns how many were
    /// released. This is the auto-cleanup sweep.
    pub fn cleanup_older_than(&self, max_age_ms: u64) -> usize {
        let cutoff = self.clock.now_millis().saturating_sub(max_age_ms);
        let stale: Vec<TrackedResource> = {
            let mut inner = self.inner.lock().expect("resource manager lock poisoned");
            let mut stale = Vec::new();
            let mut index = 0;
            while index < inner.resources.len() {
                if inner.resources[index].created_at <= cutoff {
                    stale.push(inner.resources.remove(index));
                } else {
                    index += 1;
                }
            }
            stale
        };
        let released = stale.len();
        for mut resource in stale {
            if let Some(disposer) = resource.disposer.take() {
                if let Err(e) = disposer() {
                    warn!(resource = %resource.name, "Stale resource failed to dispose: {e}");
                }
            }
        }
        if released > 0 {
            debug!(released, "Auto-cleanup released stale resources");
        }
        released
    }

    /// Release everything in reverse registration order. Idempotent: a
    /// second call is a no-op. Returns the number of disposer failures.
    pub fn dispose(&self) -> usize {
        let resources: Vec<TrackedResource> = {
            let mut inner = self.inner.lock().expect("resource manager lock poisoned");
            if inner.disposed {
                return 0;
            }
            inner.disposed = true;
            std::mem::take(&mut inner.resources)
        };
        let mut failures = 0;
        for mut resource in resources.into_iter().rev() {
            if let Some(disposer) = resource.disposer.take() {
                if let Err(e) = disposer() {
                    failures += 1;
                    warn!(resource = %resource.name, "Resource disposer failed: {e}");
                }
            }
        }
        failures
    }

    pub fn is_disposed(&self) -> bool {
        self.inner
            .lock()
            .expect("resource manager lock poisoned")
            .disposed
    }

    /// Total tracked resources.
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("resource manager lock poisoned")
            .resources
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Task tracker
// ---------------------------------------------------------------------------

/// Counts in-flight async work. Hosts wrap long-lived futures with
/// [`track`](TaskTracker::track); the guard decrements on drop, so the
/// count is exactly the number of unresolved tasks.
#[derive(Default)]
pub struct TaskTracker {
    pending: Arc<AtomicUsize>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark one task as in flight until the guard drops.
    pub fn track(&self) -> TaskGuard {
        self.pending.fetch_add(1, Ordering::Relaxed);
        TaskGuard {
            counter: Arc::clone(&self.pending),
        }
    }

    /// Number of unresolved tracked tasks.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }
}

/// RAII guard from [`TaskTracker::track`].
pub struct TaskGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, AtomicUsize};

    struct FakeClock(AtomicU64);

    impl Clock for FakeClock {
        fn now_millis(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn register_count_release() {
        let manager = ResourceManager::new();
        let id = manager.register("tick", ResourceKind::Timer, || Ok(()));
        manager.register("sub", ResourceKind::Listener, || Ok(()));

        assert_eq!(manager.count(ResourceKind::Timer), 1);
        assert_eq!(manager.counts().listeners, 1);
        assert_eq!(manager.counts().total(), 2);

        assert!(manager.release(id));
        assert!(!manager.release(id));
        assert_eq!(manager.count(ResourceKind::Timer), 0);
    }

    #[test]
    fn dispose_runs_in_reverse_order_and_is_idempotent() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let manager = ResourceManager::new();
        for i in 0..3 {
            let order = Arc::clone(&order);
            manager.register(format!("r{i}"), ResourceKind::Other, move || {
                order.lock().unwrap().push(i);
                Ok(())
            });
        }

        assert_eq!(manager.dispose(), 0);
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
        assert!(manager.is_disposed());
        assert!(manager.is_empty());

        // Second dispose is a no-op.
        assert_eq!(manager.dispose(), 0);
        assert_eq!(order.lock().unwrap().len(), 3);
    }

    #[test]
    fn dispose_captures_failures_without_stopping() {
        let ran = Arc::new(AtomicUsize::new(0));
        let manager = ResourceManager::new();
        manager.register("ok-1", ResourceKind::Other, {
            let ran = Arc::clone(&ran);
            move || {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        manager.register("bad", ResourceKind::Other, || Err("broken pipe".into()));
        manager.register("ok-2", ResourceKind::Other, {
            let ran = Arc::clone(&ran);
            move || {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        assert_eq!(manager.dispose(), 1);
        assert_eq!(ran.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn register_after_dispose_runs_disposer_immediately() {
        let ran = Arc::new(AtomicUsize::new(0));
        let manager = ResourceManager::new();
        manager.dispose();
        manager.register("late", ResourceKind::Timer, {
            let ran = Arc::clone(&ran);
            move || {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(manager.is_empty());
    }

    #[test]
    fn cleanup_releases_only_stale_resources() {
        let clock = Arc::new(FakeClock(AtomicU64::new(1_000)));
        let manager = ResourceManager::new().with_clock(clock.clone());
        manager.register("old", ResourceKind::Timer, || Ok(()));

        clock.0.store(10_000, Ordering::SeqCst);
        manager.register("fresh", ResourceKind::Timer, || Ok(()));

        // max age 5s: only the first timer is stale.
        assert_eq!(manager.cleanup_older_than(5_000), 1);
        assert_eq!(manager.count(ResourceKind::Timer), 1);
    }

    #[test]
    fn task_tracker_counts_guards() {
        let tracker = TaskTracker::new();
        assert_eq!(tracker.pending(), 0);
        let g1 = tracker.track();
        let g2 = tracker.track();
        assert_eq!(tracker.pending(), 2);
        drop(g1);
        assert_eq!(tracker.pending(), 1);
        drop(g2);
        assert_eq!(tracker.pending(), 0);
    }
}
