//! Timeline manager — a deterministic state-machine log per execution.
//!
//! Every execution owns a [`Timeline`]: an ordered list of entries, each
//! mapping an observed event to one of seven phases. The transition table
//! is fixed; by default an invalid transition is logged, flagged as an
//! anomaly, and still appended (the timeline never loses data), while
//! `strict` mode upgrades it to an error.
//!
//! ```text
//! initialized ─▶ thinking ─▶ acting ─▶ observing ─▶ thinking …
//!                   │           │          │
//!                   ▼           ▼          ▼
//!               completed / failed / paused (paused resumes anywhere)
//! ```

pub mod analysis;
pub mod render;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::warn;

use crate::bus::{EventBus, EventFilter, EventSubscriber, SubscriberError};
use crate::event::BusEvent;
use crate::ids::{self, Clock, SystemClock};

// ---------------------------------------------------------------------------
// Phases
// ---------------------------------------------------------------------------

/// Execution phase tracked by the timeline state machine.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TimelinePhase {
    #[default]
    Initialized,
    Thinking,
    Acting,
    Observing,
    Completed,
    Failed,
    Paused,
}

impl TimelinePhase {
    /// Phases reachable from this one. Self-loops are allowed by policy and
    /// not listed.
    pub fn allowed_transitions(&self) -> &'static [TimelinePhase] {
        use TimelinePhase::*;
        match self {
            Initialized => &[Thinking, Failed],
            Thinking => &[Acting, Completed, Failed, Paused],
            Acting => &[Observing, Completed, Failed, Paused],
            Observing => &[Thinking, Completed, Failed, Paused],
            Paused => &[Thinking, Acting, Observing, Failed],
            Completed | Failed => &[],
        }
    }

    /// Returns `true` when `next` is a legal successor (self-loops count).
    pub fn can_transition_to(&self, next: TimelinePhase) -> bool {
        *self == next || self.allowed_transitions().contains(&next)
    }

    /// Terminal phases absorb: nothing leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TimelinePhase::Completed | TimelinePhase::Failed)
    }
}

impl std::fmt::Display for TimelinePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TimelinePhase::Initialized => "initialized",
            TimelinePhase::Thinking => "thinking",
            TimelinePhase::Acting => "acting",
            TimelinePhase::Observing => "observing",
            TimelinePhase::Completed => "completed",
            TimelinePhase::Failed => "failed",
            TimelinePhase::Paused => "paused",
        };
        write!(f, "{s}")
    }
}

/// Map an event type onto a phase. Unknown event types observe.
pub fn phase_for_event(event_type: &str) -> TimelinePhase {
    match event_type {
        "agent:started" | "plan:started" => TimelinePhase::Initialized,
        "agent:thinking" | "scheduler:tick" => TimelinePhase::Thinking,
        "tool:called" | "tool:call" | "step:started" => TimelinePhase::Acting,
        "tool:result" | "agent:thought" | "step:completed" => TimelinePhase::Observing,
        "agent:completed" | "workflow:completed" | "plan:completed" => TimelinePhase::Completed,
        "agent:failed" | "tool:error" | "plan:failed" | "plan:cancelled" => TimelinePhase::Failed,
        "agent:paused" | "plan:paused" => TimelinePhase::Paused,
        _ => TimelinePhase::Observing,
    }
}

// ---------------------------------------------------------------------------
// Entries and transitions
// ---------------------------------------------------------------------------

/// One appended timeline record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub id: String,
    /// Epoch milliseconds when the entry was recorded.
    pub timestamp: u64,
    pub state: TimelinePhase,
    pub event_type: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub event_data: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Milliseconds since the previous entry, absent on the first.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    /// Set when the entry was appended despite an invalid transition.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub anomaly: bool,
}

/// A recorded state transition, including invalid ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineTransition {
    pub from: TimelinePhase,
    pub to: TimelinePhase,
    pub timestamp: u64,
    pub valid: bool,
}

/// The per-execution state-machine log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timeline {
    pub execution_id: String,
    pub current_state: TimelinePhase,
    pub entries: Vec<TimelineEntry>,
    pub transitions: Vec<TimelineTransition>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Timeline {
    fn new(execution_id: impl Into<String>, now: u64) -> Self {
        Self {
            execution_id: execution_id.into(),
            current_state: TimelinePhase::Initialized,
            entries: Vec::new(),
            transitions: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Number of entries appended despite an invalid transition.
    pub fn anomaly_count(&self) -> usize {
        self.entries.iter().filter(|e| e.anomaly).count()
    }
}

// ---------------------------------------------------------------------------
// Errors and config
// ---------------------------------------------------------------------------

/// Timeline errors; only raised in strict mode.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TimelineError {
    #[error("Invalid timeline transition {from} → {to} for execution '{execution_id}'")]
    InvalidTransition {
        execution_id: String,
        from: TimelinePhase,
        to: TimelinePhase,
    },
}

/// Configuration for the [`TimelineManager`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TimelineConfig {
    /// Disable to make every record call a no-op.
    pub enabled: bool,
    /// Retention of idle timelines, in milliseconds.
    pub max_age_ms: u64,
    /// Interval of the background sweep, in milliseconds.
    pub cleanup_interval_ms: u64,
    /// Reject invalid transitions instead of appending them.
    pub strict: bool,
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_age_ms: 3_600_000,
            cleanup_interval_ms: 60_000,
            strict: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Owns all timelines, keyed by execution ID.
pub struct TimelineManager {
    timelines: RwLock<HashMap<String, Timeline>>,
    config: TimelineConfig,
    clock: Arc<dyn Clock>,
}

impl TimelineManager {
    pub fn new(config: TimelineConfig) -> Self {
        Self {
            timelines: RwLock::new(HashMap::new()),
            config,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock (tests).
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Record an event against an execution's timeline.
    ///
    /// Creates the timeline on first use. Returns the phase entered. In
    /// non-strict mode an invalid transition is appended with
    /// `anomaly = true`; in strict mode it is rejected.
    pub async fn record(
        &self,
        execution_id: &str,
        event_type: &str,
        event_data: serde_json::Value,
        correlation_id: Option<String>,
    ) -> Result<TimelinePhase, TimelineError> {
        if !self.config.enabled {
            return Ok(TimelinePhase::Initialized);
        }
        let now = self.clock.now_millis();
        let next = phase_for_event(event_type);

        let mut timelines = self.timelines.write().await;
        let timeline = timelines
            .entry(execution_id.to_string())
            .or_insert_with(|| Timeline::new(execution_id, now));

        let current = timeline.current_state;
        let valid = current.can_transition_to(next);
        if !valid {
            if self.config.strict {
                return Err(TimelineError::InvalidTransition {
                    execution_id: execution_id.to_string(),
                    from: current,
                    to: next,
                });
            }
            warn!(
                execution_id,
                from = %current,
                to = %next,
                event_type,
                "Invalid timeline transition appended"
            );
        }

        let duration_ms = timeline.entries.last().map(|e| now.saturating_sub(e.timestamp));
        timeline.entries.push(TimelineEntry {
            id: ids::event_id(),
            timestamp: now,
            state: next,
            event_type: event_type.to_string(),
            event_data,
            correlation_id,
            duration_ms,
            metadata: BTreeMap::new(),
            anomaly: !valid,
        });
        if next != current {
            timeline.transitions.push(TimelineTransition {
                from: current,
                to: next,
                timestamp: now,
                valid,
            });
        }
        timeline.current_state = next;
        timeline.updated_at = now;
        Ok(next)
    }

    /// Fetch a clone of an execution's timeline.
    pub async fn timeline(&self, execution_id: &str) -> Option<Timeline> {
        self.timelines.read().await.get(execution_id).cloned()
    }

    /// Execution IDs with a live timeline.
    pub async fn execution_ids(&self) -> Vec<String> {
        self.timelines.read().await.keys().cloned().collect()
    }

    /// Drop timelines idle for longer than `max_age_ms`. Returns the number
    /// removed. Runs on demand and from the background sweeper.
    pub async fn sweep(&self) -> usize {
        let cutoff = self.clock.now_millis().saturating_sub(self.config.max_age_ms);
        let mut timelines = self.timelines.write().await;
        let before = timelines.len();
        timelines.retain(|_, t| t.updated_at > cutoff);
        before - timelines.len()
    }

    /// Spawn the periodic retention sweeper.
    pub fn start_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        let interval = std::time::Duration::from_millis(manager.config.cleanup_interval_ms.max(1));
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                manager.sweep().await;
            }
        })
    }

    /// Subscribe this manager to a bus so every event carrying an
    /// `execution_id` advances its timeline.
    pub async fn attach_to_bus(self: &Arc<Self>, bus: &EventBus) -> String {
        bus.subscribe(EventFilter::all(), Arc::clone(self) as Arc<dyn EventSubscriber>)
            .await
    }
}

#[async_trait::async_trait]
impl EventSubscriber for TimelineManager {
    async fn handle(&self, event: &BusEvent) -> Result<(), SubscriberError> {
        let Some(execution_id) = event.metadata.execution_id.clone() else {
            return Ok(());
        };
        // Non-strict recording never fails; strict-mode rejections stay
        // local to the timeline rather than counting against the bus.
        let _ = self
            .record(
                &execution_id,
                &event.event_type,
                event.data.clone(),
                event.metadata.correlation_id.clone(),
            )
            .await;
        Ok(())
    }

    fn name(&self) -> &str {
        "timeline-manager"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, Ordering};

    pub(crate) struct FakeClock(pub AtomicU64);

    impl Clock for FakeClock {
        fn now_millis(&self) -> u64 {
            self.0.fetch_add(10, Ordering::SeqCst)
        }
    }

    fn manager() -> TimelineManager {
        TimelineManager::new(TimelineConfig::default())
            .with_clock(Arc::new(FakeClock(AtomicU64::new(1_000))))
    }

    #[test]
    fn transition_table_matches_policy() {
        use TimelinePhase::*;
        assert!(Initialized.can_transition_to(Thinking));
        assert!(Initialized.can_transition_to(Failed));
        assert!(!Initialized.can_transition_to(Acting));
        assert!(Thinking.can_transition_to(Acting));
        assert!(Acting.can_transition_to(Observing));
        assert!(Observing.can_transition_to(Thinking));
        assert!(Paused.can_transition_to(Acting));
        assert!(!Completed.can_transition_to(Thinking));
        assert!(!Failed.can_transition_to(Thinking));
        // Self-loops are always allowed.
        assert!(Acting.can_transition_to(Acting));
        assert!(Completed.can_transition_to(Completed));
    }

    #[test]
    fn event_mapping() {
        assert_eq!(phase_for_event("agent:started"), TimelinePhase::Initialized);
        assert_eq!(phase_for_event("agent:thinking"), TimelinePhase::Thinking);
        assert_eq!(phase_for_event("tool:called"), TimelinePhase::Acting);
        assert_eq!(phase_for_event("tool:result"), TimelinePhase::Observing);
        assert_eq!(phase_for_event("agent:completed"), TimelinePhase::Completed);
        assert_eq!(phase_for_event("tool:error"), TimelinePhase::Failed);
        assert_eq!(phase_for_event("something:else"), TimelinePhase::Observing);
    }

    #[tokio::test]
    async fn happy_path_sequence() {
        let manager = manager();
        for event in [
            "agent:started",
            "agent:thinking",
            "tool:called",
            "tool:result",
            "agent:completed",
        ] {
            manager
                .record("exec-1", event, json!(null), None)
                .await
                .unwrap();
        }

        let timeline = manager.timeline("exec-1").await.unwrap();
        assert_eq!(timeline.current_state, TimelinePhase::Completed);
        assert_eq!(timeline.entries.len(), 5);
        assert_eq!(timeline.anomaly_count(), 0);
        assert_eq!(
            timeline.entries.last().unwrap().state,
            timeline.current_state
        );
        // Timestamps are monotone and durations recorded from the second
        // entry on.
        for pair in timeline.entries.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
            assert!(pair[1].duration_ms.is_some());
        }
        assert!(timeline.entries[0].duration_ms.is_none());
    }

    #[tokio::test]
    async fn invalid_transition_appended_with_anomaly() {
        let manager = manager();
        manager
            .record("exec-1", "agent:started", json!(null), None)
            .await
            .unwrap();
        // initialized → acting is not in the table.
        let phase = manager
            .record("exec-1", "tool:called", json!(null), None)
            .await
            .unwrap();
        assert_eq!(phase, TimelinePhase::Acting);

        let timeline = manager.timeline("exec-1").await.unwrap();
        assert_eq!(timeline.current_state, TimelinePhase::Acting);
        assert_eq!(timeline.anomaly_count(), 1);
        assert!(!timeline.transitions.last().unwrap().valid);
    }

    #[tokio::test]
    async fn strict_mode_rejects_invalid_transition() {
        let config = TimelineConfig {
            strict: true,
            ..Default::default()
        };
        let manager = TimelineManager::new(config)
            .with_clock(Arc::new(FakeClock(AtomicU64::new(1_000))));
        manager
            .record("exec-1", "agent:started", json!(null), None)
            .await
            .unwrap();
        let result = manager.record("exec-1", "tool:called", json!(null), None).await;
        assert!(matches!(
            result,
            Err(TimelineError::InvalidTransition { .. })
        ));
        // Nothing was appended.
        assert_eq!(manager.timeline("exec-1").await.unwrap().entries.len(), 1);
    }

    #[tokio::test]
    async fn sweep_drops_idle_timelines() {
        let clock = Arc::new(FakeClock(AtomicU64::new(1_000)));
        let config = TimelineConfig {
            max_age_ms: 50,
            ..Default::default()
        };
        let manager = TimelineManager::new(config).with_clock(clock.clone());
        manager
            .record("exec-old", "agent:started", json!(null), None)
            .await
            .unwrap();

        // Advance well past the retention window.
        clock.0.store(5_000, Ordering::SeqCst);
        assert_eq!(manager.sweep().await, 1);
        assert!(manager.timeline("exec-old").await.is_none());
    }

    #[tokio::test]
    async fn bus_subscriber_routes_by_execution_id() {
        let manager = Arc::new(manager());
        let bus = EventBus::new();
        manager.attach_to_bus(&bus).await;

        bus.publish(
            BusEvent::new("agent:started", "scheduler").with_execution_id("exec-7"),
        )
        .await
        .unwrap();
        // No execution_id → ignored.
        bus.publish(BusEvent::new("agent:started", "scheduler"))
            .await
            .unwrap();
        bus.flush().await;

        assert_eq!(manager.execution_ids().await, vec!["exec-7".to_string()]);
    }

    #[tokio::test]
    async fn disabled_manager_records_nothing() {
        let config = TimelineConfig {
            enabled: false,
            ..Default::default()
        };
        let manager = TimelineManager::new(config);
        manager
            .record("exec-1", "agent:started", json!(null), None)
            .await
            .unwrap();
        assert!(manager.timeline("exec-1").await.is_none());
    }
}
