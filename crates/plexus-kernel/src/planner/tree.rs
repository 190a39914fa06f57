//! Tree strategy — root analysis, beam exploration, synthesis.

use async_trait::async_trait;

use crate::plan::{Complexity, Goal, Plan, PlanStep, StrategyKind};

use super::strategy::{PlanOptions, PlanStrategy, PlanningContext, StrategyError};

/// Produces a root analysis step, `beam_width × depth` exploration steps,
/// and a synthesis step depending on every leaf.
///
/// A composite goal pins the beam to its sub-goals (one branch per part);
/// otherwise `options.beam_width` generic branches are generated. Leaves and
/// the synthesis step are marked critical.
#[derive(Debug, Default, Clone, Copy)]
pub struct TreeStrategy;

#[async_trait]
impl PlanStrategy for TreeStrategy {
    fn name(&self) -> &str {
        "tree"
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::Tree
    }

    async fn create_plan(
        &self,
        goal: &Goal,
        _ctx: &PlanningContext,
        options: &PlanOptions,
    ) -> Result<Plan, StrategyError> {
        let mut plan = Plan::new(goal.clone(), StrategyKind::Tree);
        if goal.is_empty() {
            return Ok(plan);
        }

        let branches: Vec<String> = match goal {
            Goal::Composite(parts) => parts
                .iter()
                .filter(|p| !p.trim().is_empty())
                .map(|p| p.trim().to_string())
                .collect(),
            Goal::Text(text) => (0..options.beam_width.max(1))
                .map(|b| format!("approach {} to {text}", b + 1))
                .collect(),
        };
        let depth = options.depth.max(1);

        plan = plan.add_step(
            PlanStep::new("root", format!("Analyze branches of: {}", goal.summary()))
                .with_complexity(Complexity::Medium),
        );

        let mut leaves: Vec<String> = Vec::with_capacity(branches.len());
        for (b, branch) in branches.iter().enumerate() {
            let mut parent = "root".to_string();
            for d in 0..depth {
                let id = format!("branch-{}-{}", b + 1, d + 1);
                let is_leaf = d == depth - 1;
                let mut step = PlanStep::new(&id, format!("Explore {branch}"))
                    .depends_on(&parent)
                    .with_complexity(Complexity::Medium)
                    .with_retry_limit(options.default_retry_limit);
                if is_leaf {
                    step = step.critical();
                    leaves.push(id.clone());
                }
                plan = plan.add_step(step);
                parent = id;
            }
        }

        let mut synthesis = PlanStep::new(
            "synthesis",
            format!("Synthesize findings for: {}", goal.summary()),
        )
        .with_complexity(Complexity::High)
        .critical()
        .sequential_only();
        for leaf in &leaves {
            synthesis = synthesis.depends_on(leaf);
        }
        plan = plan.add_step(synthesis);

        plan = plan.with_metadata("beam_width", serde_json::json!(branches.len()));
        plan = plan.with_metadata("depth", serde_json::json!(depth));
        Ok(plan)
    }
}
