//! Async context propagation — the task-local "current span".
//!
//! Parent/child relationships follow the logical call stack of
//! suspension-aware code, not wall-clock overlap: [`with_span`] installs a
//! span as the current context for exactly the duration of a future, and
//! [`SpanBuilder::start`](super::tracer::SpanBuilder::start) picks it up as
//! the default parent. Nesting works by re-scoping; leaving the scope
//! restores the outer span automatically.

use std::future::Future;

use super::context::SpanContext;
use super::span::Span;

tokio::task_local! {
    static CURRENT_SPAN: SpanContext;
}

/// Run `fut` with `span` installed as the current tracing context.
pub async fn with_span<F>(span: &Span, fut: F) -> F::Output
where
    F: Future,
{
    let ctx = span.span_context().await;
    CURRENT_SPAN.scope(ctx, fut).await
}

/// Run `fut` with an explicit [`SpanContext`] installed (e.g. one extracted
/// from an incoming request).
pub async fn with_span_context<F>(ctx: SpanContext, fut: F) -> F::Output
where
    F: Future,
{
    CURRENT_SPAN.scope(ctx, fut).await
}

/// The current task-local span context, if one is installed.
pub fn current_span_context() -> Option<SpanContext> {
    CURRENT_SPAN.try_with(|ctx| ctx.clone()).ok()
}
