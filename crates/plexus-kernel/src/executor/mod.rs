//! Step executor / scheduler — runs plan DAGs with dependency-aware
//! admission, retries, timeouts, and cancellation.
//!
//! # Concurrency model
//!
//! One driver task owns all bookkeeping for an execution. Step runners are
//! spawned tasks that report a single [`StepOutcome`] back over an mpsc
//! channel; the driver is the only writer of step state, so no step ever
//! transitions into a terminal state twice. Cancellation is a
//! [`CancellationToken`](tokio_util::sync::CancellationToken) threaded into
//! every runner; `pause` merely stops new admissions.

pub mod analytics;
pub mod scheduler;

pub use analytics::{ExecutionAnalytics, FailureAnalysis};
pub use scheduler::{ReplanOptions, StepExecutor};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::plan::{PlanError, PlanStep, StepStatus};
use crate::planner::PlannerError;
use crate::runtime::{ToolContext, ToolError, ToolOutput};

// ---------------------------------------------------------------------------
// Execution status
// ---------------------------------------------------------------------------

/// Lifecycle status of one execution. Terminal statuses are absorbing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    #[default]
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Timeout
        )
    }
}

// ---------------------------------------------------------------------------
// Step records
// ---------------------------------------------------------------------------

/// Why a step ended unsuccessfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepErrorKind {
    Failure,
    Timeout,
    Cancelled,
    DependencyFailed,
}

/// Error details attached to a failed step record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepError {
    pub kind: StepErrorKind,
    pub message: String,
    pub correlation_id: String,
}

/// Per-step runtime record: status, attempts, timing, and result or error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_id: String,
    pub status: StepStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<ToolOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
}

impl StepRecord {
    pub(crate) fn new(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Pending,
            attempts: 0,
            started_at: None,
            ended_at: None,
            duration_ms: None,
            output: None,
            error: None,
        }
    }
}

/// Point-in-time report of an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub execution_id: String,
    pub plan_id: String,
    pub correlation_id: String,
    pub status: ExecutionStatus,
    pub started_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step_id: Option<String>,
    pub records: HashMap<String, StepRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<StepError>,
}

/// Aggregate progress view backing `get_progress`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionProgress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub running: usize,
    pub pending: usize,
    /// Completion percentage over terminal steps, in `[0, 100]`.
    pub percent: f64,
}

/// Handle returned by `start_execution`; all further interaction goes
/// through the executor by ID.
#[derive(Debug, Clone)]
pub struct ExecutionHandle {
    pub execution_id: String,
    pub plan_id: String,
    pub correlation_id: String,
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Per-category resource caps for resource-aware admission. Units are the
/// summed [`ResourceLevel`] weights of running steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ResourceCaps {
    pub memory: u32,
    pub cpu: u32,
    pub network: u32,
}

impl Default for ResourceCaps {
    fn default() -> Self {
        Self {
            memory: 8,
            cpu: 8,
            network: 8,
        }
    }
}

impl ResourceCaps {
    /// Returns `true` if a step's demands fit on top of current usage.
    pub fn admits(&self, usage: &ResourceUsage, step: &PlanStep) -> bool {
        let r = &step.resource_requirements;
        usage.memory + r.memory.weight() <= self.memory
            && usage.cpu + r.cpu.weight() <= self.cpu
            && usage.network + r.network.weight() <= self.network
    }
}

/// Summed resource weights of currently running steps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceUsage {
    pub memory: u32,
    pub cpu: u32,
    pub network: u32,
}

impl ResourceUsage {
    pub(crate) fn add(&mut self, step: &PlanStep) {
        let r = &step.resource_requirements;
        self.memory += r.memory.weight();
        self.cpu += r.cpu.weight();
        self.network += r.network.weight();
    }

    pub(crate) fn remove(&mut self, step: &PlanStep) {
        let r = &step.resource_requirements;
        self.memory = self.memory.saturating_sub(r.memory.weight());
        self.cpu = self.cpu.saturating_sub(r.cpu.weight());
        self.network = self.network.saturating_sub(r.network.weight());
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ExecutorConfig {
    /// Steps allowed to run concurrently.
    pub max_parallel_steps: usize,
    /// Per-step timeout unless the step declares one, in milliseconds.
    pub default_timeout_ms: u64,
    /// Retry budget for steps with `retry_limit == 0` left at default.
    pub default_retry_limit: u32,
    /// Base retry backoff; doubles per attempt, capped at 30 s.
    pub retry_delay_ms: u64,
    /// Enforce [`ResourceCaps`] during admission.
    pub resource_aware: bool,
    pub resource_caps: ResourceCaps,
    /// Whole-execution deadline, in milliseconds (0 = none).
    pub execution_timeout_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_parallel_steps: 4,
            default_timeout_ms: 30_000,
            default_retry_limit: 0,
            retry_delay_ms: 500,
            resource_aware: false,
            resource_caps: ResourceCaps::default(),
            execution_timeout_ms: 0,
        }
    }
}

/// Backoff cap mandated for retry delays.
pub const MAX_RETRY_DELAY_MS: u64 = 30_000;

/// Exponential backoff: `base × 2^(attempt-1)`, capped at 30 s.
pub fn retry_backoff_ms(base_ms: u64, attempt: u32) -> u64 {
    let shift = attempt.saturating_sub(1).min(16);
    base_ms
        .saturating_mul(1u64 << shift)
        .min(MAX_RETRY_DELAY_MS)
}

// ---------------------------------------------------------------------------
// Observer
// ---------------------------------------------------------------------------

/// Observability hooks around each step attempt.
///
/// The monitoring crate implements this to open a `tool.execute` span per
/// step. Observer panics and latencies are the observer's problem; the
/// scheduler awaits the hooks but ignores their behavior otherwise.
#[async_trait]
pub trait StepObserver: Send + Sync {
    async fn on_step_start(&self, _step: &PlanStep, _ctx: &ToolContext) {}

    async fn on_step_end(
        &self,
        _step: &PlanStep,
        _ctx: &ToolContext,
        _result: &Result<ToolOutput, ToolError>,
        _duration_ms: u64,
    ) {
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced by [`StepExecutor`] operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExecutorError {
    /// The plan failed structural validation.
    #[error("Cannot execute invalid plan: {0}")]
    InvalidPlan(#[from] PlanError),

    /// A management call referenced an unknown execution.
    #[error("Execution '{0}' not found")]
    ExecutionNotFound(String),

    /// A replan was requested but no planner is attached.
    #[error("No planner attached; replan unavailable")]
    ReplanUnavailable,

    /// The planner failed to produce a successor plan.
    #[error(transparent)]
    Planner(#[from] PlannerError),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{ResourceLevel, ResourceRequirements};

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(retry_backoff_ms(10, 1), 10);
        assert_eq!(retry_backoff_ms(10, 2), 20);
        assert_eq!(retry_backoff_ms(10, 3), 40);
        assert_eq!(retry_backoff_ms(10_000, 4), MAX_RETRY_DELAY_MS);
        // Huge attempt counts stay capped rather than overflowing.
        assert_eq!(retry_backoff_ms(1_000, 60), MAX_RETRY_DELAY_MS);
    }

    #[test]
    fn resource_caps_admission() {
        let caps = ResourceCaps {
            memory: 4,
            cpu: 4,
            network: 4,
        };
        let mut usage = ResourceUsage::default();
        let hungry = PlanStep::new("h", "heavy step").with_resources(ResourceRequirements {
            memory: ResourceLevel::High,
            cpu: ResourceLevel::Low,
            network: ResourceLevel::Low,
        });

        assert!(caps.admits(&usage, &hungry));
        usage.add(&hungry);
        // A second copy would exceed the memory cap (4 + 4 > 4).
        assert!(!caps.admits(&usage, &hungry));
        usage.remove(&hungry);
        assert!(caps.admits(&usage, &hungry));
        assert_eq!(usage, ResourceUsage::default());
    }

    #[test]
    fn execution_status_terminality() {
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Timeout.is_terminal());
        assert!(!ExecutionStatus::Paused.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
    }

    #[test]
    fn executor_config_unknown_keys_rejected() {
        let json = r#"{"max_parallel_steps": 2, "turbo": true}"#;
        assert!(serde_json::from_str::<ExecutorConfig>(json).is_err());
    }
}
