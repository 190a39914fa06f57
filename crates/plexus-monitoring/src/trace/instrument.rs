//! Domain-span helpers and the scheduler tracing adapter.
//!
//! Standardizes span names and attributes for the three domain families:
//! `agent.<phase>`, `tool.execute`, and `llm.generation` (with `gen_ai.*`
//! attributes). [`TracingStepObserver`] implements the kernel's
//! [`StepObserver`] so every scheduled step runs under a `tool.execute`
//! span without the kernel depending on this crate.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use plexus_kernel::executor::StepObserver;
use plexus_kernel::plan::PlanStep;
use plexus_kernel::runtime::{ToolContext, ToolError, ToolOutput};

use super::span::{Span, SpanKind};
use super::tracer::Tracer;

/// Start an `agent.<phase>` span (e.g. `agent.thinking`).
pub async fn agent_phase_span(
    tracer: &Arc<Tracer>,
    phase: &str,
    correlation_id: &str,
) -> Span {
    tracer
        .span_builder(format!("agent.{phase}"))
        .with_attribute("correlation.id", correlation_id)
        .start()
        .await
}

/// Start a `tool.execute` span carrying the standard tool attributes.
pub async fn tool_execute_span(tracer: &Arc<Tracer>, ctx: &ToolContext, tool_name: &str) -> Span {
    let mut builder = tracer
        .span_builder("tool.execute")
        .with_kind(SpanKind::Client)
        .with_attribute("tool.name", tool_name)
        .with_attribute("call.id", ctx.call_id.as_str())
        .with_attribute("correlation.id", ctx.correlation_id.as_str())
        .with_attribute("execution.id", ctx.execution_id.as_str())
        .with_attribute("attempt", i64::from(ctx.attempt));
    if let Some(deadline) = ctx.deadline_ms {
        builder = builder.with_attribute("deadline_ms", deadline);
    }
    if let Some(tenant) = &ctx.tenant_id {
        builder = builder.with_attribute("tenant.id", tenant.as_str());
    }
    builder.start().await
}

/// Start an `llm.generation` span with `gen_ai.*` request attributes.
pub async fn llm_generation_span(
    tracer: &Arc<Tracer>,
    model: &str,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
) -> Span {
    let mut builder = tracer
        .span_builder("llm.generation")
        .with_kind(SpanKind::Client)
        .with_attribute("gen_ai.model.name", model);
    if let Some(temperature) = temperature {
        builder = builder.with_attribute("gen_ai.request.temperature", f64::from(temperature));
    }
    if let Some(max_tokens) = max_tokens {
        builder = builder.with_attribute("gen_ai.request.max_tokens", i64::from(max_tokens));
    }
    builder.start().await
}

/// Record token usage on a finished generation span.
pub async fn record_llm_usage(span: &Span, input_tokens: u64, output_tokens: u64) {
    span.set_attribute("gen_ai.usage.input_tokens", input_tokens).await;
    span.set_attribute("gen_ai.usage.output_tokens", output_tokens).await;
}

// ---------------------------------------------------------------------------
// Step observer
// ---------------------------------------------------------------------------

/// Wraps every scheduled step attempt in a `tool.execute` span.
///
/// Spans are keyed by call ID; retries get a fresh span per attempt because
/// the scheduler mints a fresh call ID per launch.
pub struct TracingStepObserver {
    tracer: Arc<Tracer>,
    open: Mutex<HashMap<String, Span>>,
}

impl TracingStepObserver {
    pub fn new(tracer: Arc<Tracer>) -> Self {
        Self {
            tracer,
            open: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl StepObserver for TracingStepObserver {
    async fn on_step_start(&self, step: &PlanStep, ctx: &ToolContext) {
        let tool_name = step.tool_id.as_deref().unwrap_or(step.id.as_str());
        let span = tool_execute_span(&self.tracer, ctx, tool_name).await;
        span.set_attribute("step.id", step.id.as_str()).await;
        self.open.lock().await.insert(ctx.call_id.clone(), span);
    }

    async fn on_step_end(
        &self,
        _step: &PlanStep,
        ctx: &ToolContext,
        result: &Result<ToolOutput, ToolError>,
        duration_ms: u64,
    ) {
        let Some(span) = self.open.lock().await.remove(&ctx.call_id) else {
            return;
        };
        span.set_attribute("duration_ms", duration_ms).await;
        match result {
            Ok(output) => {
                if let Some(points) = output.data_points {
                    span.set_attribute("data_points", points).await;
                }
                span.set_ok().await;
            }
            Err(err) => span.record_exception(err).await,
        }
        self.tracer.end_span(&span).await;
    }
}

#[cfg(test)]
mod tests {
    use super::super::span::{SpanAttribute, SpanStatus};
    use super::super::tracer::TracerConfig;
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn test_ctx() -> ToolContext {
        ToolContext {
            call_id: "call-1".into(),
            step_id: "s1".into(),
            execution_id: "exec-1".into(),
            plan_id: "plan-1".into(),
            correlation_id: "corr-1".into(),
            tenant_id: Some("acme".into()),
            deadline_ms: Some(99),
            attempt: 1,
            cancellation: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn tool_execute_span_attributes() {
        let tracer = Tracer::new(TracerConfig::new("test-service"));
        let span = tool_execute_span(&tracer, &test_ctx(), "web_search").await;
        let data = span.get_data().await;
        assert_eq!(data.name, "tool.execute");
        assert_eq!(data.kind, SpanKind::Client);
        assert_eq!(
            data.attributes["tool.name"],
            SpanAttribute::String("web_search".into())
        );
        assert_eq!(
            data.attributes["tenant.id"],
            SpanAttribute::String("acme".into())
        );
        assert_eq!(data.attributes["deadline_ms"], SpanAttribute::Int(99));
    }

    #[tokio::test]
    async fn llm_span_carries_gen_ai_attributes() {
        let tracer = Tracer::new(TracerConfig::new("test-service"));
        let span = llm_generation_span(&tracer, "sonnet-lite", Some(0.5), Some(1024)).await;
        record_llm_usage(&span, 120, 480).await;
        let data = span.get_data().await;
        assert_eq!(
            data.attributes["gen_ai.model.name"],
            SpanAttribute::String("sonnet-lite".into())
        );
        assert_eq!(
            data.attributes["gen_ai.usage.input_tokens"],
            SpanAttribute::Int(120)
        );
        assert_eq!(
            data.attributes["gen_ai.usage.output_tokens"],
            SpanAttribute::Int(480)
        );
    }

    #[tokio::test]
    async fn observer_opens_and_closes_span_per_attempt() {
        let tracer = Tracer::new(TracerConfig::new("test-service"));
        let observer = TracingStepObserver::new(tracer.clone());
        let step = PlanStep::new("s1", "fetch data").with_tool("fetch");
        let ctx = test_ctx();

        observer.on_step_start(&step, &ctx).await;
        assert_eq!(tracer.active_count().await, 1);

        observer
            .on_step_end(&step, &ctx, &Ok(ToolOutput::value("ok")), 12)
            .await;
        assert_eq!(tracer.active_count().await, 0);

        let completed = tracer.completed_spans().await;
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].status, SpanStatus::Ok);
        assert_eq!(completed[0].attributes["duration_ms"], SpanAttribute::Int(12));
    }

    #[tokio::test]
    async fn observer_records_failures() {
        let tracer = Tracer::new(TracerConfig::new("test-service"));
        let observer = TracingStepObserver::new(tracer.clone());
        let step = PlanStep::new("s1", "fetch data");
        let ctx = test_ctx();

        observer.on_step_start(&step, &ctx).await;
        let failure: Result<ToolOutput, ToolError> = Err(ToolError::Failed {
            tool: "fetch".into(),
            message: "boom".into(),
        });
        observer.on_step_end(&step, &ctx, &failure, 5).await;

        let completed = tracer.completed_spans().await;
        assert!(matches!(completed[0].status, SpanStatus::Error { .. }));
    }
}
