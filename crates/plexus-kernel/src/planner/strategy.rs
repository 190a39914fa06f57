//! Strategy contract — the capability set every planning strategy provides.
//!
//! Strategies decide *how* a goal becomes a step DAG. They are polymorphic
//! over a small capability set: plan creation plus three analysis
//! operations, each with a topology-driven default shared via
//! [`analysis`](super::analysis).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::plan::{Goal, Plan, StrategyKind};
use crate::runtime::LlmError;

use super::analysis;

// ---------------------------------------------------------------------------
// Planning inputs
// ---------------------------------------------------------------------------

/// Caller-supplied context influencing planning and estimation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanningContext {
    /// Agent requesting the plan; used for per-agent strategy selection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Session to enrich from, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Tenant the plan runs under.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    /// Whether past executions of similar goals exist; raises confidence.
    #[serde(default)]
    pub has_historical_data: bool,
    /// Environment multiplier applied to duration estimates (1.0 = neutral).
    #[serde(default = "default_multiplier")]
    pub time_multiplier: f64,
    /// Free-form context fields.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

fn default_multiplier() -> f64 {
    1.0
}

/// Per-call planning options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PlanOptions {
    /// Strategy to use, overriding agent mapping and the default.
    pub strategy: Option<String>,
    /// Upper bound on steps for decomposing a text goal (linear).
    pub max_steps: usize,
    /// Exploration branches per level (tree).
    pub beam_width: usize,
    /// Exploration depth (tree).
    pub depth: usize,
    /// Retry budget stamped on generated steps.
    pub default_retry_limit: u32,
    /// Validate the produced plan against the step schema (multi);
    /// failures log a warning and never fail plan creation.
    pub validate_schema: bool,
    /// Correlation ID to stamp into plan metadata; generated when absent.
    pub correlation_id: Option<String>,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            strategy: None,
            max_steps: 5,
            beam_width: 3,
            depth: 1,
            default_retry_limit: 1,
            validate_schema: false,
            correlation_id: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Analysis outputs
// ---------------------------------------------------------------------------

/// Partition of a plan into parallel groups and a sequential tail.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParallelismAnalysis {
    /// Groups of step IDs that may run concurrently with one another.
    pub parallelizable: Vec<Vec<String>>,
    /// Step IDs that must run alone (ordering, hints, or write-like tools).
    pub sequential: Vec<String>,
}

impl ParallelismAnalysis {
    /// Fraction of steps that landed in a parallel group.
    pub fn parallel_fraction(&self, total_steps: usize) -> f64 {
        if total_steps == 0 {
            return 0.0;
        }
        let parallel: usize = self.parallelizable.iter().map(Vec::len).sum();
        parallel as f64 / total_steps as f64
    }
}

/// Coarse risk classification of a plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

/// Time/risk/confidence estimate for a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplexityEstimate {
    /// Sum of per-step nominal durations, scaled by the context multiplier.
    pub estimated_duration_ms: u64,
    /// Duration of the longest dependency chain under the same scaling.
    pub critical_path_ms: u64,
    /// Risk derived from critical flags and average step complexity.
    pub risk: RiskLevel,
    /// Confidence in the estimate, in `[0.1, 1.0]`.
    pub confidence: f64,
    /// Number of steps considered.
    pub step_count: usize,
}

/// Category of an optimization opportunity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizationKind {
    /// Independent steps could share a scheduling tick.
    Parallelize,
    /// Steps with identical descriptions could be merged.
    Merge,
    /// A long-running step's result could be cached.
    Cache,
    /// A large plan could be executed in batches.
    Batch,
}

/// A single optimization opportunity with its cost/benefit framing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationSuggestion {
    pub kind: OptimizationKind,
    pub description: String,
    pub affected_steps: Vec<String>,
    /// Fraction of total estimated duration this could save.
    pub potential_savings: f64,
    pub tradeoffs: String,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors a strategy may raise while producing a plan.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StrategyError {
    /// The goal cannot be planned (malformed rather than empty — an empty
    /// goal produces an empty plan, not an error).
    #[error("Invalid goal: {0}")]
    InvalidGoal(String),

    /// A delegated LLM decomposition failed.
    #[error(transparent)]
    Llm(#[from] LlmError),

    /// Anything else the strategy could not recover from.
    #[error("Strategy failed: {0}")]
    Internal(String),
}

// ---------------------------------------------------------------------------
// Strategy trait
// ---------------------------------------------------------------------------

/// A planning strategy.
///
/// `create_plan` shapes the DAG; the analysis methods default to the shared
/// topology-driven implementations and may be overridden where a strategy
/// knows better.
#[async_trait]
pub trait PlanStrategy: Send + Sync {
    /// Registry name of the strategy.
    fn name(&self) -> &str;

    /// Which strategy family this belongs to.
    fn kind(&self) -> StrategyKind;

    /// Decompose a goal into a plan. Must produce a structurally valid DAG;
    /// the planner re-validates and rejects cycles.
    async fn create_plan(
        &self,
        goal: &Goal,
        ctx: &PlanningContext,
        options: &PlanOptions,
    ) -> Result<Plan, StrategyError>;

    /// Partition steps into parallel groups and a sequential tail.
    fn analyze_parallelism(&self, plan: &Plan) -> ParallelismAnalysis {
        analysis::analyze_parallelism(plan)
    }

    /// Estimate duration, risk, and confidence.
    fn estimate_complexity(&self, plan: &Plan, ctx: &PlanningContext) -> ComplexityEstimate {
        analysis::estimate_complexity(plan, ctx)
    }

    /// Report optimization opportunities.
    fn suggest_optimizations(&self, plan: &Plan) -> Vec<OptimizationSuggestion> {
        analysis::suggest_optimizations(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_options_defaults() {
        let options = PlanOptions::default();
        assert_eq!(options.max_steps, 5);
        assert_eq!(options.beam_width, 3);
        assert_eq!(options.depth, 1);
        assert!(!options.validate_schema);
    }

    #[test]
    fn plan_options_unknown_keys_rejected() {
        let json = r#"{"max_steps": 3, "surprise": 1}"#;
        assert!(serde_json::from_str::<PlanOptions>(json).is_err());
    }

    #[test]
    fn planning_context_default_multiplier() {
        let ctx: PlanningContext = serde_json::from_str("{}").unwrap();
        assert!((ctx.time_multiplier - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn parallel_fraction() {
        let analysis = ParallelismAnalysis {
            parallelizable: vec![vec!["a".into(), "b".into()]],
            sequential: vec!["c".into(), "d".into()],
        };
        assert!((analysis.parallel_fraction(4) - 0.5).abs() < f64::EPSILON);
        assert_eq!(analysis.parallel_fraction(0), 0.0);
    }

    #[test]
    fn risk_ordering() {
        assert!(RiskLevel::Low < RiskLevel::Medium);
        assert!(RiskLevel::Medium < RiskLevel::High);
    }
}
