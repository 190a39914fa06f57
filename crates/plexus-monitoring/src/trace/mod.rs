//! Span-based tracing: contexts, spans, the in-memory tracer, async
//! propagation, and domain-span helpers.

pub mod context;
pub mod instrument;
pub mod propagation;
pub mod span;
pub mod tracer;

pub use context::{SpanContext, SpanId, TraceFlags, TraceId};
pub use instrument::{
    TracingStepObserver, agent_phase_span, llm_generation_span, record_llm_usage,
    tool_execute_span,
};
pub use propagation::{current_span_context, with_span, with_span_context};
pub use span::{Span, SpanAttribute, SpanData, SpanEvent, SpanKind, SpanStatus};
pub use tracer::{
    BatchSpanProcessor, CollectingSink, ContextProvider, LogSink, SamplingStrategy,
    SimpleSpanProcessor, SpanProcessor, StaticContextProvider, TraceSink, Tracer, TracerConfig,
    global_tracer, set_global_tracer,
};
