//! Linear strategy — a sequential chain of steps.

use async_trait::async_trait;

use crate::plan::{Complexity, Goal, Plan, PlanStep, StrategyKind};

use super::strategy::{PlanOptions, PlanStrategy, PlanningContext, StrategyError};

/// Heuristic phases used to decompose a free-text goal.
const PHASES: &[(&str, &str)] = &[
    ("analyze", "Analyze requirements for"),
    ("identify", "Identify actions needed for"),
    ("execute", "Execute the core work of"),
    ("verify", "Verify the outcome of"),
    ("summarize", "Summarize the results of"),
];

/// Produces a chain where each step depends on the previous one.
///
/// A composite goal becomes one step per sub-goal; a text goal is decomposed
/// into at most `max_steps` heuristic phases (analyze → identify → execute →
/// verify → summarize). An empty goal yields a plan with zero steps.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinearStrategy;

#[async_trait]
impl PlanStrategy for LinearStrategy {
    fn name(&self) -> &str {
        "linear"
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::Linear
    }

    async fn create_plan(
        &self,
        goal: &Goal,
        _ctx: &PlanningContext,
        options: &PlanOptions,
    ) -> Result<Plan, StrategyError> {
        let mut plan = Plan::new(goal.clone(), StrategyKind::Linear);
        if goal.is_empty() {
            return Ok(plan);
        }

        let descriptions: Vec<String> = match goal {
            Goal::Composite(parts) => parts
                .iter()
                .filter(|p| !p.trim().is_empty())
                .map(|p| p.trim().to_string())
                .collect(),
            Goal::Text(text) => {
                let budget = options.max_steps.max(1).min(PHASES.len());
                PHASES[..budget]
                    .iter()
                    .map(|(_, prefix)| format!("{prefix}: {text}"))
                    .collect()
            }
        };

        let mut previous: Option<String> = None;
        for (index, description) in descriptions.into_iter().enumerate() {
            let id = format!("s{}", index + 1);
            let mut step = PlanStep::new(&id, description)
                .with_complexity(Complexity::Medium)
                .with_retry_limit(options.default_retry_limit)
                .sequential_only();
            if let Some(prev) = previous.take() {
                step = step.depends_on(prev);
            }
            plan = plan.add_step(step);
            previous = Some(id);
        }

        Ok(plan)
    }
}
