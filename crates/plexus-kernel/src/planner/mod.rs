//! Planner — goal decomposition under pluggable strategies, plan registry,
//! and replanning.
//!
//! The [`Planner`] owns the strategy table, per-agent strategy mappings, the
//! [`PlanRegistry`], and lifecycle hooks. Strategies shape DAGs; the planner
//! validates them, runs hooks in a fixed order (`on_plan_start` →
//! `on_plan_step`× → `on_plan_complete`), registers the result, and emits
//! `planner:*` events. Hook failures surface as planner errors and never
//! corrupt the registry — a plan is registered only after every hook has
//! accepted it.

pub mod analysis;
pub mod graph;
pub mod linear;
pub mod llm;
pub mod multi;
pub mod registry;
pub mod strategy;
pub mod tree;

pub use graph::GraphStrategy;
pub use linear::LinearStrategy;
pub use llm::LlmStrategy;
pub use multi::MultiStrategy;
pub use registry::PlanRegistry;
pub use strategy::{
    ComplexityEstimate, OptimizationKind, OptimizationSuggestion, ParallelismAnalysis,
    PlanOptions, PlanStrategy, PlanningContext, RiskLevel, StrategyError,
};
pub use tree::TreeStrategy;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::bus::EventBus;
use crate::event::BusEvent;
use crate::ids;
use crate::plan::{Goal, Plan, PlanError, PlanStatus, PlanStep, StrategyKind};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced by [`Planner`] operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PlannerError {
    /// No strategy registered under the requested name.
    #[error("Strategy '{0}' not found")]
    StrategyNotFound(String),

    /// The strategy produced a structurally invalid plan.
    #[error("Invalid plan: {0}")]
    InvalidPlan(#[from] PlanError),

    /// The strategy failed to produce a plan at all.
    #[error(transparent)]
    Strategy(#[from] StrategyError),

    /// A replan referenced an unknown plan.
    #[error("Plan '{0}' not found")]
    PlanNotFound(String),

    /// A lifecycle hook rejected the plan.
    #[error("Planner hook failed: {0}")]
    Hook(String),
}

/// Result of a hook invocation. An `Err` aborts plan creation.
pub type HookResult = Result<(), String>;

// ---------------------------------------------------------------------------
// Hooks
// ---------------------------------------------------------------------------

/// Plan lifecycle callbacks, fired in order: `on_plan_start`, one
/// `on_plan_step` per step, `on_plan_complete` — or `on_plan_error` on any
/// failure. `on_replan` fires before a successor plan is produced.
///
/// All methods default to no-ops so implementors override only what they
/// observe.
#[async_trait]
pub trait PlannerHooks: Send + Sync {
    async fn on_plan_start(
        &self,
        _goal: &Goal,
        _ctx: &PlanningContext,
        _strategy: &str,
    ) -> HookResult {
        Ok(())
    }

    async fn on_plan_step(&self, _step: &PlanStep, _index: usize, _plan: &Plan) -> HookResult {
        Ok(())
    }

    async fn on_plan_complete(&self, _plan: &Plan) -> HookResult {
        Ok(())
    }

    async fn on_plan_error(&self, _error: &PlannerError, _plan: Option<&Plan>) {}

    async fn on_replan(&self, _plan: &Plan, _reason: &str) -> HookResult {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Replan context
// ---------------------------------------------------------------------------

/// Record of one replanning decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplanContext {
    pub replan_id: String,
    pub timestamp: u64,
    pub reason: String,
    /// Timeline phase active when the replan was requested, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_phase: Option<String>,
    pub original_plan_id: String,
    pub successor_plan_id: String,
    pub strategy: StrategyKind,
    pub context_at_replan: PlanningContext,
}

// ---------------------------------------------------------------------------
// Planner
// ---------------------------------------------------------------------------

/// The planning façade: strategy table, agent mappings, registry, hooks.
pub struct Planner {
    strategies: RwLock<HashMap<String, Arc<dyn PlanStrategy>>>,
    agent_strategies: RwLock<HashMap<String, String>>,
    default_strategy: RwLock<String>,
    registry: Arc<PlanRegistry>,
    hooks: RwLock<Vec<Arc<dyn PlannerHooks>>>,
    replans: RwLock<Vec<ReplanContext>>,
    bus: Option<Arc<EventBus>>,
}

impl Planner {
    /// Create a planner with the four built-in strategies registered and
    /// `multi` as the default.
    pub fn new() -> Self {
        let mut strategies: HashMap<String, Arc<dyn PlanStrategy>> = HashMap::new();
        strategies.insert("linear".into(), Arc::new(LinearStrategy));
        strategies.insert("tree".into(), Arc::new(TreeStrategy));
        strategies.insert("graph".into(), Arc::new(GraphStrategy));
        strategies.insert("multi".into(), Arc::new(MultiStrategy::new()));

        Self {
            strategies: RwLock::new(strategies),
            agent_strategies: RwLock::new(HashMap::new()),
            default_strategy: RwLock::new("multi".into()),
            registry: Arc::new(PlanRegistry::new()),
            hooks: RwLock::new(Vec::new()),
            replans: RwLock::new(Vec::new()),
            bus: None,
        }
    }

    /// Publish `planner:*` events onto the given bus.
    #[must_use]
    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Use a shared registry (e.g. one with a custom retention window).
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<PlanRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// The plan registry.
    pub fn registry(&self) -> &Arc<PlanRegistry> {
        &self.registry
    }

    /// Register lifecycle hooks. Multiple hook sets fire in registration order.
    pub async fn add_hooks(&self, hooks: Arc<dyn PlannerHooks>) {
        self.hooks.write().await.push(hooks);
    }

    /// Register (or replace) a strategy under a name.
    pub async fn register_strategy(&self, name: impl Into<String>, strategy: Arc<dyn PlanStrategy>) {
        self.strategies.write().await.insert(name.into(), strategy);
    }

    /// Set the fallback strategy used when neither options nor agent mapping
    /// pick one.
    pub async fn set_default_strategy(&self, name: impl Into<String>) {
        *self.default_strategy.write().await = name.into();
    }

    /// Map an agent to a strategy name.
    pub async fn set_agent_strategy(&self, agent_id: impl Into<String>, name: impl Into<String>) {
        self.agent_strategies
            .write()
            .await
            .insert(agent_id.into(), name.into());
    }

    /// Strategy name mapped to an agent, if any.
    pub async fn get_agent_strategy(&self, agent_id: &str) -> Option<String> {
        self.agent_strategies.read().await.get(agent_id).cloned()
    }

    /// Replan history, oldest first.
    pub async fn replan_history(&self) -> Vec<ReplanContext> {
        self.replans.read().await.clone()
    }

    // -----------------------------------------------------------------------
    // Plan creation
    // -----------------------------------------------------------------------

    /// Decompose a goal into a validated, registered plan.
    pub async fn create_plan(
        &self,
        goal: impl Into<Goal>,
        ctx: &PlanningContext,
        options: &PlanOptions,
    ) -> Result<Plan, PlannerError> {
        let goal = goal.into();
        let strategy_name = self.resolve_strategy_name(ctx, options).await;
        let strategy = self.lookup_strategy(&strategy_name).await?;

        if let Err(msg) = self.fire_plan_start(&goal, ctx, &strategy_name).await {
            let err = PlannerError::Hook(msg);
            self.fire_plan_error(&err, None).await;
            return Err(err);
        }

        let mut plan = match strategy.create_plan(&goal, ctx, options).await {
            Ok(plan) => plan,
            Err(err) => {
                let err = PlannerError::Strategy(err);
                self.fire_plan_error(&err, None).await;
                return Err(err);
            }
        };

        let correlation_id = options
            .correlation_id
            .clone()
            .unwrap_or_else(ids::correlation_id);
        plan.metadata
            .insert("correlation_id".into(), json!(correlation_id));

        if let Err(err) = plan.validate() {
            let err = PlannerError::InvalidPlan(err);
            self.fire_plan_error(&err, Some(&plan)).await;
            return Err(err);
        }

        // An empty goal plans to zero executable steps and completes
        // immediately.
        if plan.steps.is_empty() {
            plan.status = PlanStatus::Completed;
        }

        if let Err(msg) = self.fire_plan_steps_and_complete(&plan).await {
            let err = PlannerError::Hook(msg);
            self.fire_plan_error(&err, Some(&plan)).await;
            return Err(err);
        }

        self.registry.insert(plan.clone()).await;
        self.emit(
            BusEvent::new("planner:plan.created", "planner")
                .with_data(json!({
                    "plan_id": plan.id,
                    "strategy": plan.strategy.to_string(),
                    "steps": plan.steps.len(),
                }))
                .with_correlation_id(correlation_id),
        )
        .await;

        Ok(plan)
    }

    // -----------------------------------------------------------------------
    // Replanning
    // -----------------------------------------------------------------------

    /// Produce a successor plan and atomically swap it for the original.
    ///
    /// The successor uses the original goal unless `new_goal` is given and
    /// the strategy family that produced the original unless
    /// `options.strategy` overrides it.
    pub async fn replan(
        &self,
        plan_id: &str,
        reason: &str,
        new_goal: Option<Goal>,
        ctx: Option<PlanningContext>,
        options: Option<PlanOptions>,
    ) -> Result<Plan, PlannerError> {
        let original = self
            .registry
            .get(plan_id)
            .await
            .ok_or_else(|| PlannerError::PlanNotFound(plan_id.to_string()))?;

        if let Err(msg) = self.fire_replan(&original, reason).await {
            let err = PlannerError::Hook(msg);
            self.fire_plan_error(&err, Some(&original)).await;
            return Err(err);
        }

        let ctx = ctx.unwrap_or_default();
        let mut options = options.unwrap_or_default();
        if options.strategy.is_none() {
            options.strategy = Some(original.strategy.to_string());
        }
        let goal = new_goal.unwrap_or_else(|| original.goal.clone());

        let successor = self.create_plan(goal, &ctx, &options).await?;
        // create_plan registered the successor; swap retires the original in
        // the same write-lock scope as the successor's re-registration.
        self.registry.swap(plan_id, successor.clone()).await;

        let record = ReplanContext {
            replan_id: ids::replan_id(),
            timestamp: ids::now_ms(),
            reason: reason.to_string(),
            trigger_phase: ctx
                .metadata
                .get("trigger_phase")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            original_plan_id: plan_id.to_string(),
            successor_plan_id: successor.id.clone(),
            strategy: successor.strategy,
            context_at_replan: ctx,
        };
        self.emit(
            BusEvent::new("planner:replan.initiated", "planner").with_data(json!({
                "replan_id": record.replan_id,
                "original_plan_id": record.original_plan_id,
                "successor_plan_id": record.successor_plan_id,
                "reason": record.reason,
            })),
        )
        .await;
        self.replans.write().await.push(record);

        Ok(successor)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn resolve_strategy_name(&self, ctx: &PlanningContext, options: &PlanOptions) -> String {
        if let Some(name) = &options.strategy {
            return name.clone();
        }
        if let Some(agent_id) = &ctx.agent_id {
            if let Some(name) = self.get_agent_strategy(agent_id).await {
                return name;
            }
        }
        self.default_strategy.read().await.clone()
    }

    async fn lookup_strategy(&self, name: &str) -> Result<Arc<dyn PlanStrategy>, PlannerError> {
        self.strategies
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| PlannerError::StrategyNotFound(name.to_string()))
    }

    async fn fire_plan_start(
        &self,
        goal: &Goal,
        ctx: &PlanningContext,
        strategy: &str,
    ) -> HookResult {
        for hooks in self.hooks.read().await.iter() {
            hooks.on_plan_start(goal, ctx, strategy).await?;
        }
        Ok(())
    }

    async fn fire_plan_steps_and_complete(&self, plan: &Plan) -> HookResult {
        let hooks = self.hooks.read().await;
        for (index, step) in plan.steps.iter().enumerate() {
            for h in hooks.iter() {
                h.on_plan_step(step, index, plan).await?;
            }
        }
        for h in hooks.iter() {
            h.on_plan_complete(plan).await?;
        }
        Ok(())
    }

    async fn fire_plan_error(&self, error: &PlannerError, plan: Option<&Plan>) {
        for hooks in self.hooks.read().await.iter() {
            hooks.on_plan_error(error, plan).await;
        }
    }

    async fn fire_replan(&self, plan: &Plan, reason: &str) -> HookResult {
        for hooks in self.hooks.read().await.iter() {
            hooks.on_replan(plan, reason).await?;
        }
        Ok(())
    }

    async fn emit(&self, event: BusEvent) {
        if let Some(bus) = &self.bus {
            if let Err(err) = bus.publish(event).await {
                debug!("Planner event dropped: {err}");
            }
        }
    }
}

impl Default for Planner {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingHooks {
        starts: AtomicUsize,
        steps: AtomicUsize,
        completes: AtomicUsize,
        errors: AtomicUsize,
        replans: AtomicUsize,
    }

    #[async_trait]
    impl PlannerHooks for RecordingHooks {
        async fn on_plan_start(
            &self,
            _goal: &Goal,
            _ctx: &PlanningContext,
            _strategy: &str,
        ) -> HookResult {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_plan_step(&self, _step: &PlanStep, _index: usize, _plan: &Plan) -> HookResult {
            self.steps.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_plan_complete(&self, _plan: &Plan) -> HookResult {
            self.completes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_plan_error(&self, _error: &PlannerError, _plan: Option<&Plan>) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_replan(&self, _plan: &Plan, _reason: &str) -> HookResult {
            self.replans.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct RejectingHooks;

    #[async_trait]
    impl PlannerHooks for RejectingHooks {
        async fn on_plan_complete(&self, _plan: &Plan) -> HookResult {
            Err("audit rejected the plan".into())
        }
    }

    struct CyclicStrategy;

    #[async_trait]
    impl PlanStrategy for CyclicStrategy {
        fn name(&self) -> &str {
            "cyclic"
        }

        fn kind(&self) -> StrategyKind {
            StrategyKind::Graph
        }

        async fn create_plan(
            &self,
            goal: &Goal,
            _ctx: &PlanningContext,
            _options: &PlanOptions,
        ) -> Result<Plan, StrategyError> {
            Ok(Plan::new(goal.clone(), StrategyKind::Graph)
                .add_step(PlanStep::new("a", "A").depends_on("b"))
                .add_step(PlanStep::new("b", "B").depends_on("a")))
        }
    }

    fn linear_options() -> PlanOptions {
        PlanOptions {
            strategy: Some("linear".into()),
            max_steps: 3,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_plan_registers_and_fires_hooks() {
        let planner = Planner::new();
        let hooks = Arc::new(RecordingHooks::default());
        planner.add_hooks(hooks.clone()).await;

        let plan = planner
            .create_plan(
                "summarize report",
                &PlanningContext::default(),
                &linear_options(),
            )
            .await
            .unwrap();

        assert_eq!(plan.steps.len(), 3);
        assert!(planner.registry().contains(&plan.id).await);
        assert_eq!(hooks.starts.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.steps.load(Ordering::SeqCst), 3);
        assert_eq!(hooks.completes.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.errors.load(Ordering::SeqCst), 0);
        assert!(plan.metadata.contains_key("correlation_id"));
    }

    #[tokio::test]
    async fn missing_strategy_errors() {
        let planner = Planner::new();
        let result = planner
            .create_plan(
                "goal",
                &PlanningContext::default(),
                &PlanOptions {
                    strategy: Some("nonexistent".into()),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(result, Err(PlannerError::StrategyNotFound(_))));
    }

    #[tokio::test]
    async fn cyclic_strategy_output_is_rejected() {
        let planner = Planner::new();
        planner
            .register_strategy("cyclic", Arc::new(CyclicStrategy))
            .await;
        let hooks = Arc::new(RecordingHooks::default());
        planner.add_hooks(hooks.clone()).await;

        let result = planner
            .create_plan(
                "goal",
                &PlanningContext::default(),
                &PlanOptions {
                    strategy: Some("cyclic".into()),
                    ..Default::default()
                },
            )
            .await;

        assert!(matches!(result, Err(PlannerError::InvalidPlan(_))));
        assert_eq!(hooks.errors.load(Ordering::SeqCst), 1);
        assert!(planner.registry().is_empty().await);
    }

    #[tokio::test]
    async fn hook_rejection_keeps_registry_clean() {
        let planner = Planner::new();
        planner.add_hooks(Arc::new(RejectingHooks)).await;

        let result = planner
            .create_plan("goal", &PlanningContext::default(), &linear_options())
            .await;

        assert!(matches!(result, Err(PlannerError::Hook(_))));
        assert!(planner.registry().is_empty().await);
    }

    #[tokio::test]
    async fn empty_goal_completes_immediately() {
        let planner = Planner::new();
        let plan = planner
            .create_plan("", &PlanningContext::default(), &linear_options())
            .await
            .unwrap();
        assert!(plan.steps.is_empty());
        assert_eq!(plan.status, PlanStatus::Completed);
    }

    #[tokio::test]
    async fn agent_strategy_mapping_resolves() {
        let planner = Planner::new();
        planner.set_agent_strategy("researcher", "tree").await;
        assert_eq!(
            planner.get_agent_strategy("researcher").await.as_deref(),
            Some("tree")
        );

        let ctx = PlanningContext {
            agent_id: Some("researcher".into()),
            ..Default::default()
        };
        let plan = planner
            .create_plan("investigate options", &ctx, &PlanOptions::default())
            .await
            .unwrap();
        assert_eq!(plan.strategy, StrategyKind::Tree);
    }

    #[tokio::test]
    async fn replan_swaps_and_records() {
        let planner = Planner::new();
        let hooks = Arc::new(RecordingHooks::default());
        planner.add_hooks(hooks.clone()).await;

        let original = planner
            .create_plan(
                "summarize report",
                &PlanningContext::default(),
                &linear_options(),
            )
            .await
            .unwrap();

        let successor = planner
            .replan(&original.id, "tool budget exceeded", None, None, None)
            .await
            .unwrap();

        assert_ne!(successor.id, original.id);
        assert_eq!(successor.strategy, original.strategy);
        assert_eq!(
            planner.registry().get(&original.id).await.unwrap().status,
            PlanStatus::Cancelled
        );
        assert_eq!(planner.registry().active_ids().await, vec![successor.id.clone()]);

        let history = planner.replan_history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].original_plan_id, original.id);
        assert_eq!(history[0].successor_plan_id, successor.id);
        assert_eq!(hooks.replans.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn replan_unknown_plan_errors() {
        let planner = Planner::new();
        let result = planner.replan("plan-ghost", "why not", None, None, None).await;
        assert!(matches!(result, Err(PlannerError::PlanNotFound(_))));
    }
}
