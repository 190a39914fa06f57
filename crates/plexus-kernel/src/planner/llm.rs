//! LLM-backed strategy — delegates decomposition to a model host.
//!
//! The model is asked for a JSON array of steps; the reply is parsed
//! leniently (code fences and prose around the array are tolerated) and
//! mapped onto the plan model. A reply that cannot be parsed fails the
//! strategy — the planner reports it through `on_plan_error` and nothing is
//! registered.
//!
//! Not registered by default: construction needs a live
//! [`LlmClient`], so hosts register it under a name of their choosing.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

use crate::plan::{Complexity, Goal, Plan, PlanStep, StrategyKind};
use crate::runtime::{GenerateOptions, LlmClient, LlmError};

use super::strategy::{PlanOptions, PlanStrategy, PlanningContext, StrategyError};

/// Step shape the model is asked to produce.
#[derive(Debug, Deserialize)]
struct LlmPlanStep {
    id: String,
    description: String,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default)]
    tool: Option<String>,
    #[serde(default)]
    critical: bool,
    #[serde(default)]
    complexity: Option<Complexity>,
}

/// Decomposes goals by prompting an [`LlmClient`] for a step list.
pub struct LlmStrategy {
    client: Arc<dyn LlmClient>,
    generate_options: GenerateOptions,
}

impl LlmStrategy {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self {
            client,
            generate_options: GenerateOptions::default(),
        }
    }

    /// Override the generation options (model, temperature, token budget).
    #[must_use]
    pub fn with_generate_options(mut self, options: GenerateOptions) -> Self {
        self.generate_options = options;
        self
    }

    fn prompt(goal: &Goal, options: &PlanOptions) -> String {
        format!(
            "Decompose the following goal into at most {} executable steps.\n\
             Goal: {}\n\
             Respond with only a JSON array; each element must have the shape\n\
             {{\"id\": string, \"description\": string, \"depends_on\": [string],\n\
              \"tool\": string|null, \"critical\": bool, \"complexity\": \"low\"|\"medium\"|\"high\"}}.\n\
             Dependencies must reference step ids from the same array and must not form cycles.",
            options.max_steps.max(1),
            goal.summary(),
        )
    }
}

/// Pull the first top-level JSON array out of a model reply, tolerating
/// code fences and surrounding prose.
fn extract_json_array(reply: &str) -> Option<&str> {
    let start = reply.find('[')?;
    let end = reply.rfind(']')?;
    (end > start).then(|| &reply[start..=end])
}

#[async_trait]
impl PlanStrategy for LlmStrategy {
    fn name(&self) -> &str {
        "llm"
    }

    fn kind(&self) -> StrategyKind {
        // The model may produce any DAG shape.
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

        let prompt = Self::prompt(goal, options);
        let response = self.client.generate(&prompt, &self.generate_options).await?;

        let json = extract_json_array(&response.output).ok_or_else(|| {
            StrategyError::Llm(LlmError::Malformed(
                "reply contains no JSON array".to_string(),
            ))
        })?;
        let raw_steps: Vec<LlmPlanStep> = serde_json::from_str(json)
            .map_err(|e| StrategyError::Llm(LlmError::Malformed(e.to_string())))?;

        for raw in raw_steps.into_iter().take(options.max_steps.max(1)) {
            let mut step = PlanStep::new(raw.id, raw.description)
                .with_complexity(raw.complexity.unwrap_or_default())
                .with_retry_limit(options.default_retry_limit);
            if let Some(tool) = raw.tool {
                step = step.with_tool(tool);
            }
            if raw.critical {
                step = step.critical();
            }
            for dep in raw.depends_on {
                step = step.depends_on(dep);
            }
            plan = plan.add_step(step);
        }

        plan = plan.with_metadata("model", serde_json::json!(response.model));
        plan = plan.with_metadata(
            "usage",
            serde_json::json!({
                "input_tokens": response.usage.input_tokens,
                "output_tokens": response.usage.output_tokens,
            }),
        );
        Ok(plan)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
