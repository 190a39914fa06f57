//! The step executor service and its per-execution driver loop.
//!
//! Each execution gets one driver task that owns every piece of mutable
//! state. Runners and retry timers communicate with it exclusively through
//! a [`DriverMsg`] channel, so step state transitions are serialized and no
//! lock is held across a suspension point.

use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::EventBus;
use crate::event::BusEvent;
use crate::extract::derive_tool_name;
use crate::ids;
use crate::plan::{Plan, PlanStatus, PlanStep, StepStatus};
use crate::planner::{Planner, PlanningContext};
use crate::runtime::{ToolContext, ToolError, ToolOutput, ToolRunner};
use crate::timeline::TimelineManager;

use super::analytics::ExecutionAnalytics;
use super::{
    ExecutionHandle, ExecutionProgress, ExecutionReport, ExecutionStatus, ExecutorConfig,
    ExecutorError, ResourceUsage, StepError, StepErrorKind, StepObserver, StepRecord,
    retry_backoff_ms,
};

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

enum OutcomeKind {
    Success(ToolOutput),
    Failed(String),
    TimedOut,
    Cancelled,
}

struct StepOutcome {
    step_id: String,
    kind: OutcomeKind,
    started_at: u64,
    ended_at: u64,
}

enum DriverMsg {
    Outcome(StepOutcome),
    RetryDue { step_id: String },
    Pause,
    Resume,
    Cancel,
    ExecutionTimeout,
}

// ---------------------------------------------------------------------------
// Shared per-execution state
// ---------------------------------------------------------------------------

pub(crate) struct ExecutionShared {
    execution_id: String,
    plan_id: String,
    correlation_id: String,
    control: mpsc::UnboundedSender<DriverMsg>,
    cancel: CancellationToken,
    report: RwLock<ExecutionReport>,
    analytics: RwLock<ExecutionAnalytics>,
    events: RwLock<Vec<BusEvent>>,
    status_tx: watch::Sender<ExecutionStatus>,
}

// ---------------------------------------------------------------------------
// Replan options
// ---------------------------------------------------------------------------

/// Options for [`StepExecutor::initiate_replan`].
#[derive(Default)]
pub struct ReplanOptions {
    /// Let in-flight steps finish before replanning instead of cancelling
    /// them (default: cancel).
    pub drain: bool,
    /// Planning context passed to the planner for the successor plan.
    pub context: Option<PlanningContext>,
}

// ---------------------------------------------------------------------------
// StepExecutor
// ---------------------------------------------------------------------------

/// Executes plan DAGs. Cheap to share behind an `Arc`.
pub struct StepExecutor {
    config: ExecutorConfig,
    runner: Arc<dyn ToolRunner>,
    observers: Vec<Arc<dyn StepObserver>>,
    bus: Option<Arc<EventBus>>,
    timeline: Option<Arc<TimelineManager>>,
    planner: Option<Arc<Planner>>,
    executions: RwLock<HashMap<String, Arc<ExecutionShared>>>,
}

impl StepExecutor {
    pub fn new(runner: Arc<dyn ToolRunner>) -> Self {
        Self {
            config: ExecutorConfig::default(),
            runner,
            observers: Vec::new(),
            bus: None,
            timeline: None,
            planner: None,
            executions: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Publish `plan:*` / `step:*` events onto this bus.
    #[must_use]
    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Record execution phases onto this timeline manager. Do not also
    /// attach the same manager to the bus, or entries double up.
    #[must_use]
    pub fn with_timeline(mut self, timeline: Arc<TimelineManager>) -> Self {
        self.timeline = Some(timeline);
        self
    }

    /// Enable replanning through this planner and keep its registry's plan
    /// statuses in sync.
    #[must_use]
    pub fn with_planner(mut self, planner: Arc<Planner>) -> Self {
        self.planner = Some(planner);
        self
    }

    /// Add a step observer (e.g. the tracing adapter).
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn StepObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    // -----------------------------------------------------------------------
    // Public operations
    // -----------------------------------------------------------------------

    /// Validate and start executing a plan. Returns immediately; the
    /// execution runs on its own driver task.
    pub async fn start_execution(
        self: &Arc<Self>,
        plan: Plan,
    ) -> Result<ExecutionHandle, ExecutorError> {
        plan.validate()?;

        let execution_id = ids::execution_id();
        let correlation_id = plan
            .metadata
            .get("correlation_id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(ids::correlation_id);

        let records: HashMap<String, StepRecord> = plan
            .steps
            .iter()
            .map(|s| (s.id.clone(), StepRecord::new(&s.id)))
            .collect();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = watch::channel(ExecutionStatus::Pending);
        let shared = Arc::new(ExecutionShared {
            execution_id: execution_id.clone(),
            plan_id: plan.id.clone(),
            correlation_id: correlation_id.clone(),
            control: control_tx.clone(),
            cancel: CancellationToken::new(),
            report: RwLock::new(ExecutionReport {
                execution_id: execution_id.clone(),
                plan_id: plan.id.clone(),
                correlation_id: correlation_id.clone(),
                status: ExecutionStatus::Pending,
                started_at: ids::now_ms(),
                ended_at: None,
                current_step_id: None,
                records,
                last_error: None,
            }),
            analytics: RwLock::new(ExecutionAnalytics::default()),
            events: RwLock::new(Vec::new()),
            status_tx,
        });
        self.executions
            .write()
            .await
            .insert(execution_id.clone(), shared.clone());

        if let Some(planner) = &self.planner {
            planner
                .registry()
                .set_status(&plan.id, PlanStatus::Executing)
                .await;
        }

        let handle = ExecutionHandle {
            execution_id,
            plan_id: plan.id.clone(),
            correlation_id,
        };

        let driver = Driver {
            executor: Arc::clone(self),
            shared,
            plan,
            tx: control_tx,
            rx: control_rx,
        };
        tokio::spawn(driver.run());

        Ok(handle)
    }

    /// Stop admitting new steps. Running steps continue.
    pub async fn pause(&self, execution_id: &str) -> Result<(), ExecutorError> {
        self.send(execution_id, DriverMsg::Pause).await
    }

    /// Resume admissions after a pause.
    pub async fn resume(&self, execution_id: &str) -> Result<(), ExecutorError> {
        self.send(execution_id, DriverMsg::Resume).await
    }

    /// Cancel the execution: pending steps never start, running steps are
    /// interrupted at their next suspension point.
    pub async fn cancel(&self, execution_id: &str) -> Result<(), ExecutorError> {
        let shared = self.lookup(execution_id).await?;
        shared.cancel.cancel();
        let _ = shared.control.send(DriverMsg::Cancel);
        Ok(())
    }

    /// Current status and per-step records.
    pub async fn execution_status(
        &self,
        execution_id: &str,
    ) -> Result<ExecutionReport, ExecutorError> {
        Ok(self.lookup(execution_id).await?.report.read().await.clone())
    }

    /// Aggregate progress.
    pub async fn progress(&self, execution_id: &str) -> Result<ExecutionProgress, ExecutorError> {
        let report = self.execution_status(execution_id).await?;
        let mut progress = ExecutionProgress {
            total: report.records.len(),
            ..Default::default()
        };
        for record in report.records.values() {
            match record.status {
                StepStatus::Done => progress.completed += 1,
                StepStatus::DoneFailed | StepStatus::Skipped | StepStatus::Cancelled => {
                    progress.failed += 1
                }
                StepStatus::Running => progress.running += 1,
                StepStatus::Pending => progress.pending += 1,
            }
        }
        if progress.total > 0 {
            progress.percent =
                (progress.completed + progress.failed) as f64 / progress.total as f64 * 100.0;
        }
        Ok(progress)
    }

    /// Events emitted so far for an execution, in publish order.
    pub async fn events(&self, execution_id: &str) -> Result<Vec<BusEvent>, ExecutorError> {
        Ok(self.lookup(execution_id).await?.events.read().await.clone())
    }

    /// Rolling analytics.
    pub async fn analytics(
        &self,
        execution_id: &str,
    ) -> Result<ExecutionAnalytics, ExecutorError> {
        Ok(self
            .lookup(execution_id)
            .await?
            .analytics
            .read()
            .await
            .clone())
    }

    /// Wait for the execution to reach a terminal status.
    pub async fn wait(&self, execution_id: &str) -> Result<ExecutionReport, ExecutorError> {
        let shared = self.lookup(execution_id).await?;
        let mut status_rx = shared.status_tx.subscribe();
        loop {
            if status_rx.borrow_and_update().is_terminal() {
                break;
            }
            if status_rx.changed().await.is_err() {
                break;
            }
        }
        self.execution_status(execution_id).await
    }

    /// Replace the active plan with a planner-produced successor.
    ///
    /// In-flight steps of the old plan are cancelled unless
    /// [`ReplanOptions::drain`] is set, in which case the execution is
    /// allowed to finish first. Returns the successor plan; starting it is
    /// the caller's decision.
    pub async fn initiate_replan(
        &self,
        execution_id: &str,
        reason: &str,
        options: ReplanOptions,
    ) -> Result<Plan, ExecutorError> {
        let planner = self.planner.clone().ok_or(ExecutorError::ReplanUnavailable)?;
        let shared = self.lookup(execution_id).await?;

        if options.drain {
            let _ = self.wait(execution_id).await;
        } else {
            shared.cancel.cancel();
            let _ = shared.control.send(DriverMsg::Cancel);
            let _ = self.wait(execution_id).await;
        }

        let mut ctx = options.context.unwrap_or_default();
        if let Some(timeline) = &self.timeline {
            if let Some(t) = timeline.timeline(execution_id).await {
                ctx.metadata.insert(
                    "trigger_phase".into(),
                    json!(t.current_state.to_string()),
                );
            }
        }

        let successor = planner
            .replan(&shared.plan_id, reason, None, Some(ctx), None)
            .await?;

        self.emit_for(
            &shared,
            BusEvent::new("replan:initiated", "scheduler")
                .with_data(json!({
                    "execution_id": shared.execution_id,
                    "original_plan_id": shared.plan_id,
                    "successor_plan_id": successor.id,
                    "reason": reason,
                }))
                .with_execution_id(shared.execution_id.clone())
                .with_correlation_id(shared.correlation_id.clone())
                .critical(),
        )
        .await;

        Ok(successor)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn lookup(&self, execution_id: &str) -> Result<Arc<ExecutionShared>, ExecutorError> {
        self.executions
            .read()
            .await
            .get(execution_id)
            .cloned()
            .ok_or_else(|| ExecutorError::ExecutionNotFound(execution_id.to_string()))
    }

    async fn send(&self, execution_id: &str, msg: DriverMsg) -> Result<(), ExecutorError> {
        let shared = self.lookup(execution_id).await?;
        let _ = shared.control.send(msg);
        Ok(())
    }

    async fn emit_for(&self, shared: &ExecutionShared, event: BusEvent) {
        shared.events.write().await.push(event.clone());
        if let Some(bus) = &self.bus {
            if let Err(err) = bus.publish(event).await {
                debug!("Scheduler event dropped: {err}");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

struct Driver {
    executor: Arc<StepExecutor>,
    shared: Arc<ExecutionShared>,
    plan: Plan,
    tx: mpsc::UnboundedSender<DriverMsg>,
    rx: mpsc::UnboundedReceiver<DriverMsg>,
}

struct DriverState {
    done: HashSet<String>,
    done_failed: HashSet<String>,
    running: HashSet<String>,
    waiting_retry: HashSet<String>,
    usage: ResourceUsage,
    paused: bool,
    stopping: bool,
    cancelling: bool,
    exclusive_running: bool,
    retries: u64,
    parallelism_samples: Vec<usize>,
    fallback_used: HashSet<String>,
    effective_tool: HashMap<String, String>,
    step_index: HashMap<String, usize>,
}

impl Driver {
    async fn run(mut self) {
        let mut state = DriverState {
            done: HashSet::new(),
            done_failed: HashSet::new(),
            running: HashSet::new(),
            waiting_retry: HashSet::new(),
            usage: ResourceUsage::default(),
            paused: false,
            stopping: false,
            cancelling: false,
            exclusive_running: false,
            retries: 0,
            parallelism_samples: Vec::new(),
            fallback_used: HashSet::new(),
            effective_tool: HashMap::new(),
            step_index: self
                .plan
                .steps
                .iter()
                .enumerate()
                .map(|(i, s)| (s.id.clone(), i))
                .collect(),
        };

        self.set_status(ExecutionStatus::Running).await;
        self.emit("plan:started", None, json!({}), true).await;

        // Empty plans complete in the same tick they start.
        if self.plan.steps.is_empty() {
            self.finish(ExecutionStatus::Completed, &state).await;
            return;
        }

        let deadline = (self.executor.config.execution_timeout_ms > 0).then(|| {
            tokio::time::Instant::now()
                + std::time::Duration::from_millis(self.executor.config.execution_timeout_ms)
        });

        loop {
            if self.shared.cancel.is_cancelled() {
                self.handle_cancel(&mut state, ExecutionStatus::Cancelled).await;
                return;
            }

            if !state.paused && !state.stopping {
                self.admit(&mut state).await;
            }

            if state.running.is_empty() && state.waiting_retry.is_empty() {
                self.cascade_unreachable(&mut state).await;
                if self.all_terminal().await {
                    let status = if state.stopping {
                        ExecutionStatus::Failed
                    } else {
                        ExecutionStatus::Completed
                    };
                    self.finish(status, &state).await;
                    return;
                }
                if !state.paused && !state.stopping && self.admissible(&state).await.is_empty() {
                    // Nothing running, nothing admissible, steps left over:
                    // only reachable if readiness is wedged. Skip the rest
                    // and fail rather than spin.
                    warn!(
                        execution_id = %self.shared.execution_id,
                        "Scheduler wedged with non-terminal steps; skipping remainder"
                    );
                    self.skip_all_pending(&mut state, StepErrorKind::DependencyFailed)
                        .await;
                    continue;
                }
            }

            let msg = if let Some(deadline) = deadline {
                tokio::select! {
                    msg = self.rx.recv() => msg,
                    _ = self.shared.cancel.cancelled() => Some(DriverMsg::Cancel),
                    _ = tokio::time::sleep_until(deadline) => Some(DriverMsg::ExecutionTimeout),
                }
            } else {
                tokio::select! {
                    msg = self.rx.recv() => msg,
                    _ = self.shared.cancel.cancelled() => Some(DriverMsg::Cancel),
                }
            };

            match msg {
                Some(DriverMsg::Outcome(outcome)) => {
                    self.handle_outcome(&mut state, outcome).await;
                }
                Some(DriverMsg::RetryDue { step_id }) => {
                    if state.waiting_retry.remove(&step_id) {
                        // Step re-enters Pending and will be picked up by the
                        // next admission pass.
                    }
                }
                Some(DriverMsg::Pause) => {
                    if !state.paused {
                        state.paused = true;
                        self.set_status(ExecutionStatus::Paused).await;
                        self.emit("plan:paused", None, json!({}), true).await;
                    }
                }
                Some(DriverMsg::Resume) => {
                    if state.paused {
                        state.paused = false;
                        self.set_status(ExecutionStatus::Running).await;
                        self.emit("scheduler:tick", None, json!({"resumed": true}), true)
                            .await;
                    }
                }
                Some(DriverMsg::Cancel) => {
                    self.handle_cancel(&mut state, ExecutionStatus::Cancelled).await;
                    return;
                }
                Some(DriverMsg::ExecutionTimeout) => {
                    self.shared.cancel.cancel();
                    self.handle_cancel(&mut state, ExecutionStatus::Timeout).await;
                    return;
                }
                None => {
                    // All senders dropped; should not happen while we hold tx.
                    return;
                }
            }
        }
    }

    // -- admission ----------------------------------------------------------

    /// Step IDs currently admissible, in admission order: critical first,
    /// then shorter estimates, then insertion order.
    async fn admissible(&self, state: &DriverState) -> Vec<String> {
        let report = self.shared.report.read().await;
        let mut candidates: Vec<&PlanStep> = self
            .plan
            .steps
            .iter()
            .filter(|step| {
                report.records[&step.id].status == StepStatus::Pending
                    && !state.waiting_retry.contains(&step.id)
                    && step.dependencies.iter().all(|dep| {
                        state.done.contains(dep)
                            || (state.done_failed.contains(dep)
                                && !self.plan.step(dep).map(|s| s.critical).unwrap_or(true))
                    })
            })
            .collect();
        candidates.sort_by_key(|step| {
            (
                std::cmp::Reverse(step.critical),
                step.effective_duration_ms(),
                state.step_index[&step.id],
            )
        });
        candidates.into_iter().map(|s| s.id.clone()).collect()
    }

    async fn admit(&self, state: &mut DriverState) {
        if state.exclusive_running {
            return;
        }
        let candidates = self.admissible(state).await;
        if candidates.is_empty() {
            return;
        }

        let mut admitted_any = false;
        for step_id in &candidates {
            if state.running.len() >= self.executor.config.max_parallel_steps {
                break;
            }
            let step = self.plan.step(step_id).expect("candidate exists").clone();
            if !step.can_run_in_parallel && !state.running.is_empty() {
                continue;
            }
            if self.executor.config.resource_aware
                && !self
                    .executor
                    .config
                    .resource_caps
                    .admits(&state.usage, &step)
            {
                continue;
            }

            if !admitted_any {
                admitted_any = true;
                // One thinking beat per scheduling tick that admits work.
                self.emit("scheduler:tick", None, json!({}), true).await;
            }
            self.launch(state, step).await;
            if state.exclusive_running {
                break;
            }
        }

        // A step whose demands exceed the caps outright would wedge the
        // execution; when idle, admit the head candidate regardless.
        if !admitted_any && state.running.is_empty() {
            if let Some(step_id) = candidates.first() {
                let step = self.plan.step(step_id).expect("candidate exists").clone();
                admitted_any = true;
                self.emit("scheduler:tick", None, json!({}), true).await;
                self.launch(state, step).await;
            }
        }

        if admitted_any {
            state.parallelism_samples.push(state.running.len());
        }
    }

    async fn launch(&self, state: &mut DriverState, step: PlanStep) {
        let attempt = {
            let mut report = self.shared.report.write().await;
            report.current_step_id = Some(step.id.clone());
            let record = report.records.get_mut(&step.id).expect("record exists");
            record.status = StepStatus::Running;
            record.attempts += 1;
            if record.started_at.is_none() {
                record.started_at = Some(ids::now_ms());
            }
            record.attempts
        };

        state.running.insert(step.id.clone());
        state.usage.add(&step);
        if !step.can_run_in_parallel {
            state.exclusive_running = true;
        }

        let tool_name = state
            .effective_tool
            .entry(step.id.clone())
            .or_insert_with(|| step.tool_id.clone().unwrap_or_else(|| derive_tool_name(&step)))
            .clone();
        let timeout_ms = step
            .timeout_ms
            .unwrap_or(self.executor.config.default_timeout_ms);
        let ctx = ToolContext {
            call_id: ids::call_id(),
            step_id: step.id.clone(),
            execution_id: self.shared.execution_id.clone(),
            plan_id: self.shared.plan_id.clone(),
            correlation_id: self.shared.correlation_id.clone(),
            tenant_id: None,
            deadline_ms: Some(ids::now_ms() + timeout_ms),
            attempt,
            cancellation: self.shared.cancel.child_token(),
        };

        self.emit(
            "step:started",
            Some(&step.id),
            json!({"attempt": attempt, "tool": tool_name}),
            true,
        )
        .await;

        let runner = Arc::clone(&self.executor.runner);
        let observers = self.executor.observers.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let started_at = ids::now_ms();
            for observer in &observers {
                observer.on_step_start(&step, &ctx).await;
            }

            let kind = tokio::select! {
                biased;
                _ = ctx.cancellation.cancelled() => OutcomeKind::Cancelled,
                _ = tokio::time::sleep(std::time::Duration::from_millis(timeout_ms)) => {
                    OutcomeKind::TimedOut
                }
                result = runner.invoke(&tool_name, &step.params, &ctx) => match result {
                    Ok(output) => OutcomeKind::Success(output),
                    Err(ToolError::Cancelled(_)) => OutcomeKind::Cancelled,
                    Err(err) => OutcomeKind::Failed(err.to_string()),
                },
            };
            let ended_at = ids::now_ms();

            let observed: Result<ToolOutput, ToolError> = match &kind {
                OutcomeKind::Success(output) => Ok(output.clone()),
                OutcomeKind::Failed(message) => Err(ToolError::Failed {
                    tool: tool_name.clone(),
                    message: message.clone(),
                }),
                OutcomeKind::TimedOut => Err(ToolError::Failed {
                    tool: tool_name.clone(),
                    message: format!("timed out after {timeout_ms}ms"),
                }),
                OutcomeKind::Cancelled => Err(ToolError::Cancelled(tool_name.clone())),
            };
            for observer in &observers {
                observer
                    .on_step_end(&step, &ctx, &observed, ended_at.saturating_sub(started_at))
                    .await;
            }

            let _ = tx.send(DriverMsg::Outcome(StepOutcome {
                step_id: step.id.clone(),
                kind,
                started_at,
                ended_at,
            }));
        });
    }

    // -- outcomes -----------------------------------------------------------

    async fn handle_outcome(&self, state: &mut DriverState, outcome: StepOutcome) {
        let step = match self.plan.step(&outcome.step_id) {
            Some(step) => step.clone(),
            None => return,
        };
        state.running.remove(&step.id);
        state.usage.remove(&step);
        if !step.can_run_in_parallel {
            state.exclusive_running = false;
        }

        match outcome.kind {
            OutcomeKind::Success(output) => {
                self.record_terminal(
                    &step.id,
                    StepStatus::Done,
                    Some(output),
                    None,
                    outcome.ended_at,
                )
                .await;
                state.done.insert(step.id.clone());
                self.emit(
                    "step:completed",
                    Some(&step.id),
                    json!({"duration_ms": outcome.ended_at.saturating_sub(outcome.started_at)}),
                    true,
                )
                .await;
            }
            OutcomeKind::Cancelled => {
                self.record_terminal(
                    &step.id,
                    StepStatus::Cancelled,
                    None,
                    Some(StepError {
                        kind: StepErrorKind::Cancelled,
                        message: "cancelled".into(),
                        correlation_id: self.shared.correlation_id.clone(),
                    }),
                    outcome.ended_at,
                )
                .await;
            }
            OutcomeKind::Failed(message) => {
                self.handle_failure(state, &step, StepErrorKind::Failure, message, outcome.ended_at)
                    .await;
            }
            OutcomeKind::TimedOut => {
                let timeout = step
                    .timeout_ms
                    .unwrap_or(self.executor.config.default_timeout_ms);
                self.handle_failure(
                    state,
                    &step,
                    StepErrorKind::Timeout,
                    format!("step timed out after {timeout}ms"),
                    outcome.ended_at,
                )
                .await;
            }
        }
        self.refresh_analytics(state).await;
    }

    async fn handle_failure(
        &self,
        state: &mut DriverState,
        step: &PlanStep,
        kind: StepErrorKind,
        message: String,
        ended_at: u64,
    ) {
        // During cancellation drain, failures no longer retry.
        if state.cancelling {
            self.record_terminal(
                &step.id,
                StepStatus::Cancelled,
                None,
                Some(StepError {
                    kind: StepErrorKind::Cancelled,
                    message,
                    correlation_id: self.shared.correlation_id.clone(),
                }),
                ended_at,
            )
            .await;
            return;
        }

        let attempts = self.shared.report.read().await.records[&step.id].attempts;

        // Retry while the budget allows.
        if attempts <= step.retry_limit {
            state.retries += 1;
            {
                let mut report = self.shared.report.write().await;
                let record = report.records.get_mut(&step.id).expect("record exists");
                record.status = StepStatus::Pending;
            }
            let delay = retry_backoff_ms(self.executor.config.retry_delay_ms, attempts);
            state.waiting_retry.insert(step.id.clone());
            self.emit(
                "step:retrying",
                Some(&step.id),
                json!({"attempt": attempts, "delay_ms": delay, "error": message}),
                false,
            )
            .await;
            let tx = self.tx.clone();
            let step_id = step.id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                let _ = tx.send(DriverMsg::RetryDue { step_id });
            });
            return;
        }

        // One fallback attempt on the `_lite` variant when the step carried
        // a real retry budget.
        if step.retry_limit > 1 && !state.fallback_used.contains(&step.id) {
            state.fallback_used.insert(step.id.clone());
            let primary = state
                .effective_tool
                .get(&step.id)
                .cloned()
                .unwrap_or_else(|| derive_tool_name(step));
            let fallback = format!("{primary}_lite");
            state.effective_tool.insert(step.id.clone(), fallback.clone());
            {
                let mut report = self.shared.report.write().await;
                report
                    .records
                    .get_mut(&step.id)
                    .expect("record exists")
                    .status = StepStatus::Pending;
            }
            self.emit(
                "step:retrying",
                Some(&step.id),
                json!({"fallback_tool": fallback, "error": message}),
                false,
            )
            .await;
            return;
        }

        // Exhausted.
        let error = StepError {
            kind,
            message: message.clone(),
            correlation_id: self.shared.correlation_id.clone(),
        };
        self.record_terminal(&step.id, StepStatus::DoneFailed, None, Some(error.clone()), ended_at)
            .await;
        state.done_failed.insert(step.id.clone());
        self.shared.report.write().await.last_error = Some(error);
        self.emit(
            "step:failed",
            Some(&step.id),
            json!({"error": message, "kind": format!("{kind:?}").to_lowercase()}),
            true,
        )
        .await;

        if step.critical {
            // Fatal: stop admissions and skip everything not yet started.
            state.stopping = true;
            self.skip_all_pending(state, StepErrorKind::DependencyFailed).await;
        }
    }

    // -- cascades and termination -------------------------------------------

    /// Skip every pending step (used on fatal failure and wedge recovery).
    async fn skip_all_pending(&self, state: &mut DriverState, kind: StepErrorKind) {
        let pending: Vec<String> = {
            let report = self.shared.report.read().await;
            report
                .records
                .values()
                .filter(|r| r.status == StepStatus::Pending)
                .map(|r| r.step_id.clone())
                .collect()
        };
        for step_id in pending {
            state.waiting_retry.remove(&step_id);
            self.record_terminal(
                &step_id,
                StepStatus::Skipped,
                None,
                Some(StepError {
                    kind,
                    message: "upstream failure".into(),
                    correlation_id: self.shared.correlation_id.clone(),
                }),
                ids::now_ms(),
            )
            .await;
            self.emit("step:skipped", Some(&step_id), json!({}), false).await;
        }
    }

    /// Skip pending steps whose dependencies can no longer be satisfied
    /// (a dependency ended skipped or cancelled).
    async fn cascade_unreachable(&self, state: &mut DriverState) {
        loop {
            let unreachable: Vec<String> = {
                let report = self.shared.report.read().await;
                self.plan
                    .steps
                    .iter()
                    .filter(|step| {
                        report.records[&step.id].status == StepStatus::Pending
                            && step.dependencies.iter().any(|dep| {
                                matches!(
                                    report.records[dep].status,
                                    StepStatus::Skipped | StepStatus::Cancelled
                                ) || (report.records[dep].status == StepStatus::DoneFailed
                                    && self
                                        .plan
                                        .step(dep)
                                        .map(|s| s.critical)
                                        .unwrap_or(true))
                            })
                    })
                    .map(|s| s.id.clone())
                    .collect()
            };
            if unreachable.is_empty() {
                return;
            }
            for step_id in unreachable {
                state.waiting_retry.remove(&step_id);
                self.record_terminal(
                    &step_id,
                    StepStatus::Skipped,
                    None,
                    Some(StepError {
                        kind: StepErrorKind::DependencyFailed,
                        message: "dependency unavailable".into(),
                        correlation_id: self.shared.correlation_id.clone(),
                    }),
                    ids::now_ms(),
                )
                .await;
                self.emit("step:skipped", Some(&step_id), json!({}), false).await;
            }
        }
    }

    async fn handle_cancel(&mut self, state: &mut DriverState, status: ExecutionStatus) {
        state.cancelling = true;
        // Mark everything not yet started as cancelled; running steps will
        // be interrupted by the token and drained below.
        let pending: Vec<String> = {
            let report = self.shared.report.read().await;
            report
                .records
                .values()
                .filter(|r| r.status == StepStatus::Pending)
                .map(|r| r.step_id.clone())
                .collect()
        };
        for step_id in pending {
            state.waiting_retry.remove(&step_id);
            self.record_terminal(
                &step_id,
                StepStatus::Cancelled,
                None,
                Some(StepError {
                    kind: StepErrorKind::Cancelled,
                    message: "execution cancelled".into(),
                    correlation_id: self.shared.correlation_id.clone(),
                }),
                ids::now_ms(),
            )
            .await;
        }

        // Drain in-flight runners; completed work is preserved.
        while !state.running.is_empty() {
            match self.rx.recv().await {
                Some(DriverMsg::Outcome(outcome)) => {
                    self.handle_outcome(state, outcome).await;
                }
                Some(_) => {}
                None => break,
            }
        }

        self.finish(status, state).await;
    }

    async fn all_terminal(&self) -> bool {
        self.shared
            .report
            .read()
            .await
            .records
            .values()
            .all(|r| r.status.is_terminal())
    }

    async fn finish(&self, status: ExecutionStatus, state: &DriverState) {
        {
            let mut report = self.shared.report.write().await;
            report.status = status;
            report.ended_at = Some(ids::now_ms());
            report.current_step_id = None;
        }
        self.refresh_analytics(state).await;
        self.set_status(status).await;

        if let Some(planner) = &self.executor.planner {
            let plan_status = match status {
                ExecutionStatus::Completed => PlanStatus::Completed,
                ExecutionStatus::Cancelled => PlanStatus::Cancelled,
                _ => PlanStatus::Failed,
            };
            planner
                .registry()
                .set_status(&self.shared.plan_id, plan_status)
                .await;
        }

        let (event_type, critical) = match status {
            ExecutionStatus::Completed => ("plan:completed", false),
            ExecutionStatus::Cancelled => ("plan:cancelled", true),
            _ => ("plan:failed", true),
        };
        let data = json!({"status": format!("{status:?}").to_lowercase()});
        if critical {
            self.emit_critical(event_type, data).await;
        } else {
            self.emit(event_type, None, data, true).await;
        }
    }

    // -- bookkeeping helpers ------------------------------------------------

    async fn record_terminal(
        &self,
        step_id: &str,
        status: StepStatus,
        output: Option<ToolOutput>,
        error: Option<StepError>,
        ended_at: u64,
    ) {
        let mut report = self.shared.report.write().await;
        let record = report.records.get_mut(step_id).expect("record exists");
        // Terminal states are absorbing; a late outcome never rewrites one.
        if record.status.is_terminal() {
            return;
        }
        record.status = status;
        record.ended_at = Some(ended_at);
        record.duration_ms = record.started_at.map(|s| ended_at.saturating_sub(s));
        record.output = output;
        record.error = error;
    }

    async fn refresh_analytics(&self, state: &DriverState) {
        let report = self.shared.report.read().await.clone();
        let analytics =
            ExecutionAnalytics::from_report(&report, state.retries, &state.parallelism_samples);
        *self.shared.analytics.write().await = analytics;
    }

    async fn set_status(&self, status: ExecutionStatus) {
        self.shared.report.write().await.status = status;
        // send_replace updates the value even with no live receivers, so a
        // late `wait()` subscriber still observes the terminal status.
        self.shared.status_tx.send_replace(status);
    }

    async fn emit(
        &self,
        event_type: &str,
        step_id: Option<&str>,
        mut data: serde_json::Value,
        record_timeline: bool,
    ) {
        if let (Some(obj), Some(step_id)) = (data.as_object_mut(), step_id) {
            obj.insert("step_id".into(), json!(step_id));
        }
        let mut event = BusEvent::new(event_type, "scheduler")
            .with_data(data.clone())
            .with_execution_id(self.shared.execution_id.clone())
            .with_correlation_id(self.shared.correlation_id.clone());
        event.metadata.extra.insert(
            "plan_id".into(),
            self.shared.plan_id.clone(),
        );
        self.executor.emit_for(&self.shared, event).await;

        if record_timeline {
            if let Some(timeline) = &self.executor.timeline {
                let _ = timeline
                    .record(
                        &self.shared.execution_id,
                        event_type,
                        data,
                        Some(self.shared.correlation_id.clone()),
                    )
                    .await;
            }
        }
    }

    async fn emit_critical(&self, event_type: &str, data: serde_json::Value) {
        let mut event = BusEvent::new(event_type, "scheduler")
            .with_data(data.clone())
            .with_execution_id(self.shared.execution_id.clone())
            .with_correlation_id(self.shared.correlation_id.clone())
            .critical();
        event
            .metadata
            .extra
            .insert("plan_id".into(), self.shared.plan_id.clone());
        self.executor.emit_for(&self.shared, event).await;
        if let Some(timeline) = &self.executor.timeline {
            let _ = timeline
                .record(
                    &self.shared.execution_id,
                    event_type,
                    data,
                    Some(self.shared.correlation_id.clone()),
                )
                .await;
        }
    }
}
