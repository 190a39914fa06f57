//! Plan data model — goals, steps, dependency DAG validation.
//!
//! A [`Plan`] is an identified graph of [`PlanStep`]s whose `dependencies`
//! fields describe a DAG. Strategies produce plans; the scheduler consumes
//! them. Once a plan leaves [`PlanStatus::Created`] its step list is fixed
//! in shape — only per-step runtime fields (`status`, `attempts`) mutate.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

use crate::ids;

// ---------------------------------------------------------------------------
// Goal
// ---------------------------------------------------------------------------

/// The immutable input to planning: a free-form goal or an ordered list of
/// sub-goals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Goal {
    /// A single natural-language goal.
    Text(String),
    /// An ordered list of sub-goals, each becoming at least one step.
    Composite(Vec<String>),
}

impl Goal {
    /// Returns `true` when there is nothing to plan.
    pub fn is_empty(&self) -> bool {
        match self {
            Goal::Text(text) => text.trim().is_empty(),
            Goal::Composite(parts) => parts.iter().all(|p| p.trim().is_empty()),
        }
    }

    /// A flattened, human-readable rendering of the goal.
    pub fn summary(&self) -> String {
        match self {
            Goal::Text(text) => text.clone(),
            Goal::Composite(parts) => parts.join("; "),
        }
    }

    /// The sub-goals of a composite goal, or a single-element view of a text
    /// goal.
    pub fn parts(&self) -> Vec<&str> {
        match self {
            Goal::Text(text) => vec![text.as_str()],
            Goal::Composite(parts) => parts.iter().map(String::as_str).collect(),
        }
    }
}

impl From<&str> for Goal {
    fn from(text: &str) -> Self {
        Goal::Text(text.to_string())
    }
}

impl From<String> for Goal {
    fn from(text: String) -> Self {
        Goal::Text(text)
    }
}

impl From<Vec<String>> for Goal {
    fn from(parts: Vec<String>) -> Self {
        Goal::Composite(parts)
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Which strategy family produced a plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    /// Sequential chain of steps.
    #[default]
    Linear,
    /// Root → beam exploration → synthesis.
    Tree,
    /// Fixed cross-edged topology.
    Graph,
    /// Meta-strategy delegating per call.
    Multi,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StrategyKind::Linear => "linear",
            StrategyKind::Tree => "tree",
            StrategyKind::Graph => "graph",
            StrategyKind::Multi => "multi",
        };
        write!(f, "{s}")
    }
}

/// Lifecycle status of a plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanStatus {
    #[default]
    Created,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl PlanStatus {
    /// Returns `true` for statuses a plan can never leave.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Runtime status of a single step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepStatus {
    /// Waiting on dependencies or admission.
    #[default]
    Pending,
    /// Currently executing.
    Running,
    /// Finished successfully.
    Done,
    /// Finished with an error but execution continued past it.
    DoneFailed,
    /// Never started because a dependency failed.
    Skipped,
    /// Aborted by cancellation.
    Cancelled,
}

impl StepStatus {
    /// Returns `true` once the step can no longer change state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Done | Self::DoneFailed | Self::Skipped | Self::Cancelled
        )
    }

    /// Returns `true` if the step completed successfully.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Done)
    }
}

/// Coarse complexity estimate of a step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    #[default]
    Medium,
    High,
}

impl Complexity {
    /// Nominal duration used by complexity estimation when a step does not
    /// declare its own.
    pub fn nominal_duration_ms(&self) -> u64 {
        match self {
            Complexity::Low => 1_000,
            Complexity::Medium => 3_000,
            Complexity::High => 8_000,
        }
    }
}

/// Per-category resource demand level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceLevel {
    #[default]
    Low,
    Medium,
    High,
}

impl ResourceLevel {
    /// Admission weight summed by the resource-aware scheduler.
    pub fn weight(&self) -> u32 {
        match self {
            ResourceLevel::Low => 1,
            ResourceLevel::Medium => 2,
            ResourceLevel::High => 4,
        }
    }
}

/// Advisory resource demands of a step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    pub memory: ResourceLevel,
    pub cpu: ResourceLevel,
    pub network: ResourceLevel,
}

impl ResourceRequirements {
    /// Total admission weight across all categories.
    pub fn total_weight(&self) -> u32 {
        self.memory.weight() + self.cpu.weight() + self.network.weight()
    }
}

/// Strategy advice the scheduler may use when admitting a step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionHint {
    /// No preference; the scheduler decides.
    #[default]
    Auto,
    /// Prefer running alongside other steps.
    Parallel,
    /// Prefer exclusive execution.
    Sequential,
}

// ---------------------------------------------------------------------------
// PlanStep
// ---------------------------------------------------------------------------

/// A single executable step within a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    /// Unique identifier within the plan.
    pub id: String,

    /// Human-readable description of what this step accomplishes.
    pub description: String,

    /// Tool bound to this step, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_id: Option<String>,

    /// Agent delegated to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,

    /// Arguments passed to the tool/agent.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub params: serde_json::Map<String, serde_json::Value>,

    /// IDs of steps that must reach a terminal state before this one starts.
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Estimated duration in milliseconds (0 = unknown).
    #[serde(default)]
    pub estimated_duration_ms: u64,

    /// Per-step timeout; the scheduler default applies when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// Coarse complexity class.
    #[serde(default)]
    pub complexity: Complexity,

    /// Whether a failure of this step should fail the whole execution.
    #[serde(default)]
    pub critical: bool,

    /// Maximum retry attempts on transient failure.
    #[serde(default)]
    pub retry_limit: u32,

    /// Scheduling advice.
    #[serde(default)]
    pub execution_hint: ExecutionHint,

    /// Whether this step may share a scheduling tick with others.
    #[serde(default = "default_true")]
    pub can_run_in_parallel: bool,

    /// Advisory resource demands.
    #[serde(default)]
    pub resource_requirements: ResourceRequirements,

    /// Current runtime status.
    #[serde(default)]
    pub status: StepStatus,

    /// Attempts made so far.
    #[serde(default)]
    pub attempts: u32,
}

fn default_true() -> bool {
    true
}

impl PlanStep {
    /// Create a new step with the given ID and description.
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            tool_id: None,
            agent_id: None,
            params: serde_json::Map::new(),
            dependencies: Vec::new(),
            estimated_duration_ms: 0,
            timeout_ms: None,
            complexity: Complexity::default(),
            critical: false,
            retry_limit: 0,
            execution_hint: ExecutionHint::default(),
            can_run_in_parallel: true,
            resource_requirements: ResourceRequirements::default(),
            status: StepStatus::Pending,
            attempts: 0,
        }
    }

    /// Bind a tool.
    #[must_use]
    pub fn with_tool(mut self, tool_id: impl Into<String>) -> Self {
        self.tool_id = Some(tool_id.into());
        self
    }

    /// Delegate to an agent.
    #[must_use]
    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    /// Add a parameter.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    /// Add a dependency on another step.
    #[must_use]
    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.dependencies.push(step_id.into());
        self
    }

    /// Set the estimated duration.
    #[must_use]
    pub fn with_estimated_duration_ms(mut self, ms: u64) -> Self {
        self.estimated_duration_ms = ms;
        self
    }

    /// Set a per-step timeout.
    #[must_use]
    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    /// Set the complexity class.
    #[must_use]
    pub fn with_complexity(mut self, complexity: Complexity) -> Self {
        self.complexity = complexity;
        self
    }

    /// Mark the step critical.
    #[must_use]
    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    /// Set the retry limit.
    #[must_use]
    pub fn with_retry_limit(mut self, limit: u32) -> Self {
        self.retry_limit = limit;
        self
    }

    /// Set the execution hint.
    #[must_use]
    pub fn with_execution_hint(mut self, hint: ExecutionHint) -> Self {
        self.execution_hint = hint;
        self
    }

    /// Forbid sharing a scheduling tick.
    #[must_use]
    pub fn sequential_only(mut self) -> Self {
        self.can_run_in_parallel = false;
        self
    }

    /// Set resource requirements.
    #[must_use]
    pub fn with_resources(mut self, requirements: ResourceRequirements) -> Self {
        self.resource_requirements = requirements;
        self
    }

    /// Effective duration estimate: the declared estimate, or the nominal
    /// duration of the complexity class when unknown.
    pub fn effective_duration_ms(&self) -> u64 {
        if self.estimated_duration_ms > 0 {
            self.estimated_duration_ms
        } else {
            self.complexity.nominal_duration_ms()
        }
    }

    /// Returns `true` if all listed dependencies appear in `satisfied`.
    pub fn dependencies_met(&self, satisfied: &HashSet<String>) -> bool {
        self.dependencies.iter().all(|dep| satisfied.contains(dep))
    }
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// An identified DAG of steps produced by a strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    /// Globally unique plan ID.
    pub id: String,

    /// The goal this plan decomposes.
    pub goal: Goal,

    /// Strategy family that produced the plan.
    pub strategy: StrategyKind,

    /// Steps in insertion order; the dependency DAG is authoritative.
    pub steps: Vec<PlanStep>,

    /// Lifecycle status.
    #[serde(default)]
    pub status: PlanStatus,

    /// Epoch-milliseconds creation timestamp.
    pub created_at: u64,

    /// Free-form metadata attached by strategies or callers.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Plan {
    /// Create an empty plan for the given goal.
    pub fn new(goal: impl Into<Goal>, strategy: StrategyKind) -> Self {
        Self {
            id: ids::plan_id(),
            goal: goal.into(),
            strategy,
            steps: Vec::new(),
            status: PlanStatus::Created,
            created_at: ids::now_ms(),
            metadata: HashMap::new(),
        }
    }

    /// Append a step (builder pattern).
    #[must_use]
    pub fn add_step(mut self, step: PlanStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Attach a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Look up a step by ID.
    pub fn step(&self, id: &str) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Look up a step mutably by ID.
    pub fn step_mut(&mut self, id: &str) -> Option<&mut PlanStep> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    /// IDs of steps whose direct dependencies include `id`.
    pub fn dependents_of(&self, id: &str) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| s.dependencies.iter().any(|d| d == id))
            .map(|s| s.id.as_str())
            .collect()
    }

    /// Return the IDs of steps ready to execute: pending, with every
    /// dependency in `satisfied`.
    pub fn ready_steps(&self, satisfied: &HashSet<String>) -> Vec<String> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Pending && s.dependencies_met(satisfied))
            .map(|s| s.id.clone())
            .collect()
    }

    /// Returns `true` when every step has reached a terminal state.
    pub fn is_complete(&self) -> bool {
        self.steps.iter().all(|s| s.status.is_terminal())
    }

    // -----------------------------------------------------------------------
    // DAG validation
    // -----------------------------------------------------------------------

    /// Validate the plan's dependency DAG.
    ///
    /// Checks for empty/duplicate step IDs, references to non-existent
    /// steps, and cycles.
    pub fn validate(&self) -> Result<(), PlanError> {
        let ids: HashSet<&str> = self.steps.iter().map(|s| s.id.as_str()).collect();

        if self.steps.iter().any(|s| s.id.trim().is_empty()) {
            return Err(PlanError::EmptyStepId);
        }
        if ids.len() != self.steps.len() {
            let mut seen = HashSet::new();
            let duplicate = self
                .steps
                .iter()
                .find(|s| !seen.insert(s.id.as_str()))
                .map(|s| s.id.clone())
                .unwrap_or_default();
            return Err(PlanError::DuplicateStepId(duplicate));
        }

        for step in &self.steps {
            for dep in &step.dependencies {
                if !ids.contains(dep.as_str()) {
                    return Err(PlanError::UnknownDependency {
                        step: step.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        self.topological_order().map(|_| ())
    }

    /// Produce a deterministic topological ordering of step IDs via Kahn's
    /// algorithm, or [`PlanError::CycleDetected`] if the graph has a cycle.
    pub fn topological_order(&self) -> Result<Vec<String>, PlanError> {
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();

        for step in &self.steps {
            in_degree.entry(step.id.as_str()).or_insert(0);
            adjacency.entry(step.id.as_str()).or_default();
            for dep in &step.dependencies {
                adjacency
                    .entry(dep.as_str())
                    .or_default()
                    .push(step.id.as_str());
                *in_degree.entry(step.id.as_str()).or_insert(0) += 1;
            }
        }

        let mut queue: Vec<&str> = in_degree
            .iter()
            .filter(|&(_, &deg)| deg == 0)
            .map(|(&id, _)| id)
            .collect();
        queue.sort_unstable();

        let mut order = Vec::with_capacity(self.steps.len());
        while let Some(node) = queue.pop() {
            order.push(node.to_string());
            if let Some(children) = adjacency.get(node) {
                for &child in children {
                    let deg = in_degree.get_mut(child).expect("child tracked above");
                    *deg -= 1;
                    if *deg == 0 {
                        let pos = queue.binary_search(&child).unwrap_or_else(|p| p);
                        queue.insert(pos, child);
                    }
                }
            }
        }

        if order.len() != self.steps.len() {
            let stuck: Vec<String> = self
                .steps
                .iter()
                .filter(|s| !order.contains(&s.id))
                .map(|s| s.id.clone())
                .collect();
            return Err(PlanError::CycleDetected { involving: stuck });
        }
        Ok(order)
    }

    /// Total estimated duration of the critical (longest) dependency path,
    /// in milliseconds.
    pub fn critical_path_ms(&self) -> u64 {
        let mut longest: HashMap<&str, u64> = HashMap::new();
        let Ok(order) = self.topological_order() else {
            return 0;
        };
        for id in &order {
            let step = self.step(id).expect("ordered id exists");
            let deps_max = step
                .dependencies
                .iter()
                .filter_map(|d| longest.get(d.as_str()))
                .copied()
                .max()
                .unwrap_or(0);
            longest.insert(step.id.as_str(), deps_max + step.effective_duration_ms());
        }
        longest.values().copied().max().unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Structural errors in a plan's shape.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PlanError {
    /// A step has an empty or whitespace-only ID.
    #[error("Plan contains a step with an empty ID")]
    EmptyStepId,

    /// Two steps share the same ID.
    #[error("Plan contains duplicate step ID '{0}'")]
    DuplicateStepId(String),

    /// A step depends on an ID not present in the plan.
    #[error("Step '{step}' depends on non-existent step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    /// The dependency graph contains a cycle.
    #[error("Plan dependency graph contains a cycle involving {involving:?}")]
    CycleDetected { involving: Vec<String> },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
