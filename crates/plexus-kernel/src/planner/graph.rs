//! Graph strategy — fixed cross-edged topology for interconnected goals.

use async_trait::async_trait;

use crate::plan::{Complexity, Goal, Plan, PlanStep, StrategyKind};

use super::strategy::{PlanOptions, PlanStrategy, PlanningContext, StrategyError};

/// Produces a fixed eight-node topology with cross-edges for a text goal:
///
/// ```text
/// analyze ──┬─▶ decompose ──▶ explore-a ──┐
/// context ──┘        │                    ├─▶ connect ─▶ synthesize ─▶ validate
///     │              └─────▶ explore-b ───┘       ▲                        ▲
///     └───────────────────────────────────────────┘      analyze ─────────┘
/// ```
///
/// A composite goal instead gets one node per sub-goal plus a `connections`
/// aggregation node depending on all of them.
#[derive(Debug, Default, Clone, Copy)]
pub struct GraphStrategy;

#[async_trait]
impl PlanStrategy for GraphStrategy {
    fn name(&self) -> &str {
        "graph"
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::Graph
    }

    async fn create_plan(
        &self,
        goal: &Goal,
        _ctx: &PlanningContext,
        options: &PlanOptions,
    ) -> Result<Plan, StrategyError> {
        let mut plan = Plan::new(goal.clone(), StrategyKind::Graph);
        if goal.is_empty() {
            return Ok(plan);
        }

        match goal {
            Goal::Composite(parts) => {
                let mut node_ids = Vec::new();
                for (i, part) in parts.iter().filter(|p| !p.trim().is_empty()).enumerate() {
                    let id = format!("goal-{}", i + 1);
                    plan = plan.add_step(
                        PlanStep::new(&id, part.trim().to_string())
                            .with_retry_limit(options.default_retry_limit),
                    );
                    node_ids.push(id);
                }
                let mut connections = PlanStep::new(
                    "connections",
                    "Analyze connections between the goal results",
                )
                .with_complexity(Complexity::High)
                .critical()
                .sequential_only();
                for id in &node_ids {
                    connections = connections.depends_on(id);
                }
                plan = plan.add_step(connections);
            }
            Goal::Text(text) => {
                let summary = text.trim();
                plan = plan
                    .add_step(PlanStep::new("analyze", format!("Analyze the goal: {summary}")))
                    .add_step(PlanStep::new(
                        "context",
                        format!("Gather context relevant to: {summary}"),
                    ))
                    .add_step(
                        PlanStep::new("decompose", "Decompose the goal into aspects")
                            .depends_on("analyze")
                            .depends_on("context"),
                    )
                    .add_step(
                        PlanStep::new("explore-a", "Explore the primary aspect")
                            .depends_on("decompose")
                            .with_retry_limit(options.default_retry_limit),
                    )
                    .add_step(
                        PlanStep::new("explore-b", "Explore the secondary aspect")
                            .depends_on("decompose")
                            .with_retry_limit(options.default_retry_limit),
                    )
                    .add_step(
                        PlanStep::new("connect", "Connect findings across aspects")
                            .depends_on("explore-a")
                            .depends_on("explore-b")
                            .depends_on("context"),
                    )
                    .add_step(
                        PlanStep::new("synthesize", format!("Synthesize an answer for: {summary}"))
                            .depends_on("connect")
                            .with_complexity(Complexity::High)
                            .critical(),
                    )
                    .add_step(
                        PlanStep::new("validate", "Validate the synthesized answer")
                            .depends_on("synthesize")
                            .depends_on("analyze")
                            .critical(),
                    );
            }
        }

        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn text_goal_uses_fixed_topology() {
        let plan = GraphStrategy
            .create_plan(
                &Goal::from("map the service dependencies"),
                &PlanningContext::default(),
                &PlanOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(plan.steps.len(), 8);
        let connect = plan.step("connect").unwrap();
        assert_eq!(connect.dependencies.len(), 3);
        assert!(connect.dependencies.contains(&"context".to_string()));
        let validate = plan.step("validate").unwrap();
        assert!(validate.dependencies.contains(&"analyze".to_string()));
        assert!(plan.validate().is_ok());
    }

    #[tokio::test]
    async fn composite_goal_gets_aggregation_node() {
        let goal = Goal::Composite(vec!["inventory".into(), "billing".into()]);
        let plan = GraphStrategy
            .create_plan(&goal, &PlanningContext::default(), &PlanOptions::default())
            .await
            .unwrap();

        assert_eq!(plan.steps.len(), 3);
        let connections = plan.step("connections").unwrap();
        assert_eq!(connections.dependencies.len(), 2);
        assert!(connections.critical);
        assert!(plan.validate().is_ok());
    }

    #[tokio::test]
    async fn empty_goal_yields_empty_plan() {
        let plan = GraphStrategy
            .create_plan(
                &Goal::Composite(vec![]),
                &PlanningContext::default(),
                &PlanOptions::default(),
            )
            .await
            .unwrap();
        assert!(plan.steps.is_empty());
    }
}
