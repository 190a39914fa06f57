//! Multi strategy — a meta-strategy selecting linear, tree, or graph per call.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

use crate::plan::{Goal, Plan, StrategyKind};

use super::graph::GraphStrategy;
use super::linear::LinearStrategy;
use super::strategy::{PlanOptions, PlanStrategy, PlanningContext, StrategyError};
use super::tree::TreeStrategy;

/// Signature of a custom selection function.
pub type StrategyDecider =
    dyn Fn(&Goal, &PlanningContext) -> StrategyKind + Send + Sync + 'static;

/// Goal keywords that favor tree-shaped exploration.
const TREE_KEYWORDS: &[&str] = &[
    "explore", "compare", "alternatives", "options", "brainstorm", "evaluate",
];

/// Goal keywords that favor the cross-edged graph topology.
const GRAPH_KEYWORDS: &[&str] = &[
    "connect",
    "relate",
    "integrate",
    "dependencies",
    "relationship",
    "interaction",
    "graph",
];

/// Goal length beyond which tree exploration is assumed worthwhile.
const LONG_GOAL_CHARS: usize = 120;

/// Delegates each `create_plan` call to one of the concrete strategies,
/// chosen by a caller-supplied decider or by keyword heuristics.
///
/// With `options.validate_schema`, the produced plan is additionally checked
/// against the step schema; a failure logs a warning but never fails plan
/// creation.
pub struct MultiStrategy {
    linear: LinearStrategy,
    tree: TreeStrategy,
    graph: GraphStrategy,
    decider: Option<Arc<StrategyDecider>>,
}

impl MultiStrategy {
    pub fn new() -> Self {
        Self {
            linear: LinearStrategy,
            tree: TreeStrategy,
            graph: GraphStrategy,
            decider: None,
        }
    }

    /// Install a custom selection function.
    #[must_use]
    pub fn with_decider(
        mut self,
        decider: impl Fn(&Goal, &PlanningContext) -> StrategyKind + Send + Sync + 'static,
    ) -> Self {
        self.decider = Some(Arc::new(decider));
        self
    }

    /// Pick a strategy for this goal.
    pub fn decide(&self, goal: &Goal, ctx: &PlanningContext) -> StrategyKind {
        if let Some(decider) = &self.decider {
            let kind = decider(goal, ctx);
            // The decider may only pick a concrete strategy.
            if kind != StrategyKind::Multi {
                return kind;
            }
        }
        heuristic_choice(goal)
    }

    /// Warn-only shape check of a produced plan.
    fn check_schema(plan: &Plan) {
        let mut problems = Vec::new();
        for step in &plan.steps {
            if step.description.trim().is_empty() {
                problems.push(format!("step '{}' has an empty description", step.id));
            }
        }
        if let Err(err) = plan.validate() {
            problems.push(err.to_string());
        }
        if !problems.is_empty() {
            warn!(
                plan_id = %plan.id,
                "Plan schema validation reported issues: {}",
                problems.join("; ")
            );
        }
    }
}

impl Default for MultiStrategy {
    fn default() -> Self {
        Self::new()
    }
}

/// Keyword/length heuristic: interconnection keywords → graph, long or
/// exploration-flavored goals → tree, otherwise linear.
fn heuristic_choice(goal: &Goal) -> StrategyKind {
    let summary = goal.summary().to_ascii_lowercase();
    if GRAPH_KEYWORDS.iter().any(|k| summary.contains(k)) {
        return StrategyKind::Graph;
    }
    if summary.len() > LONG_GOAL_CHARS || TREE_KEYWORDS.iter().any(|k| summary.contains(k)) {
        return StrategyKind::Tree;
    }
    StrategyKind::Linear
}

#[async_trait]
impl PlanStrategy for MultiStrategy {
    fn name(&self) -> &str {
        "multi"
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::Multi
    }

    async fn create_plan(
        &self,
        goal: &Goal,
        ctx: &PlanningContext,
        options: &PlanOptions,
    ) -> Result<Plan, StrategyError> {
        let choice = self.decide(goal, ctx);
        let mut plan = match choice {
            StrategyKind::Tree => self.tree.create_plan(goal, ctx, options).await?,
            StrategyKind::Graph => self.graph.create_plan(goal, ctx, options).await?,
            _ => self.linear.create_plan(goal, ctx, options).await?,
        };
        plan.metadata.insert(
            "selected_strategy".into(),
            serde_json::json!(choice.to_string()),
        );

        if options.validate_schema {
            Self::check_schema(&plan);
        }
        Ok(plan)
    }
}
