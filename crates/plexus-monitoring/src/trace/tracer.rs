//! The in-memory tracer — sampling, span registry, processors, timeouts.
//!
//! The tracer keeps every live span in an `active` registry and a bounded
//! FIFO of completed [`SpanData`] for inspection. Each recording span is
//! armed with a safety-net timer (default 5 minutes): if `end` never comes,
//! the span is force-ended with [`SpanStatus::Timeout`]. `dispose()` closes
//! all remaining active spans with an error status — the business-level
//! timeout always belongs to the scheduler, never to the tracer.
//!
//! Processor and sink failures are logged and never propagate to callers:
//! observability must not break the critical path.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error};

use super::context::{SpanContext, SpanId, TraceFlags, TraceId};
use super::propagation;
use super::span::{Span, SpanAttribute, SpanData, SpanKind, SpanStatus};

// ---------------------------------------------------------------------------
// Sampling
// ---------------------------------------------------------------------------

/// Sampling strategy.
#[derive(Debug, Clone, Default)]
pub enum SamplingStrategy {
    /// Always sample.
    #[default]
    AlwaysOn,
    /// Never sample.
    AlwaysOff,
    /// Sample a fraction of traces, decided deterministically per trace ID.
    Probabilistic(f64),
    /// Follow the parent's decision; use `root` for parentless spans.
    ParentBased { root: Box<SamplingStrategy> },
}

impl SamplingStrategy {
    /// Decide whether a trace should be sampled.
    pub fn should_sample(&self, parent: Option<&SpanContext>, trace_id: &TraceId) -> bool {
        match self {
            SamplingStrategy::AlwaysOn => true,
            SamplingStrategy::AlwaysOff => false,
            SamplingStrategy::Probabilistic(rate) => {
                let hash = trace_id
                    .as_bytes()
                    .iter()
                    .fold(0u64, |acc, &b| acc.wrapping_mul(31).wrapping_add(b as u64));
                (hash as f64 / u64::MAX as f64) < *rate
            }
            SamplingStrategy::ParentBased { root } => match parent {
                Some(parent) => parent.is_sampled(),
                None => root.should_sample(None, trace_id),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Default safety-net span timeout: 5 minutes.
pub const DEFAULT_SPAN_TIMEOUT_MS: u64 = 300_000;

/// Tracer configuration.
#[derive(Debug, Clone)]
pub struct TracerConfig {
    pub service_name: String,
    pub sampling: SamplingStrategy,
    /// Safety-net timeout armed on every span (0 disables).
    pub span_timeout_ms: u64,
    /// Bound of the completed-span history (oldest evicted first).
    pub max_completed_spans: usize,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown-service".to_string(),
            sampling: SamplingStrategy::AlwaysOn,
            span_timeout_ms: DEFAULT_SPAN_TIMEOUT_MS,
            max_completed_spans: 1_000,
        }
    }
}

impl TracerConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_sampling(mut self, sampling: SamplingStrategy) -> Self {
        self.sampling = sampling;
        self
    }

    #[must_use]
    pub fn with_span_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.span_timeout_ms = timeout_ms;
        self
    }
}

// ---------------------------------------------------------------------------
// Processors and sinks
// ---------------------------------------------------------------------------

/// Receives span lifecycle notifications.
#[async_trait]
pub trait SpanProcessor: Send + Sync {
    async fn on_start(&self, span: &Span);
    async fn on_end(&self, span: SpanData);
    async fn shutdown(&self) -> Result<(), String>;
    async fn force_flush(&self) -> Result<(), String>;
}

/// Receives batches of completed spans for export.
#[async_trait]
pub trait TraceSink: Send + Sync {
    async fn export(&self, batch: Vec<SpanData>) -> Result<(), String>;

    async fn shutdown(&self) -> Result<(), String> {
        Ok(())
    }

    async fn force_flush(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Sink that writes one debug log line per span.
pub struct LogSink;

#[async_trait]
impl TraceSink for LogSink {
    async fn export(&self, batch: Vec<SpanData>) -> Result<(), String> {
        for span in batch {
            debug!(
                name = %span.name,
                trace_id = %span.span_context.trace_id,
                span_id = %span.span_context.span_id,
                status = ?span.status,
                "span completed"
            );
        }
        Ok(())
    }
}

/// Sink that collects spans in memory; the standard test double.
#[derive(Default)]
pub struct CollectingSink {
    spans: Mutex<Vec<SpanData>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn collected(&self) -> Vec<SpanData> {
        self.spans.lock().await.clone()
    }
}

#[async_trait]
impl TraceSink for CollectingSink {
    async fn export(&self, batch: Vec<SpanData>) -> Result<(), String> {
        self.spans.lock().await.extend(batch);
        Ok(())
    }
}

/// Exports every span as soon as it ends.
pub struct SimpleSpanProcessor {
    sink: Arc<dyn TraceSink>,
}

impl SimpleSpanProcessor {
    pub fn new(sink: Arc<dyn TraceSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl SpanProcessor for SimpleSpanProcessor {
    async fn on_start(&self, _span: &Span) {}

    async fn on_end(&self, span: SpanData) {
        if let Err(e) = self.sink.export(vec![span]).await {
            error!("Failed to export span: {e}");
        }
    }

    async fn shutdown(&self) -> Result<(), String> {
        self.sink.shutdown().await
    }

    async fn force_flush(&self) -> Result<(), String> {
        self.sink.force_flush().await
    }
}

/// Buffers completed spans and exports them in batches.
pub struct BatchSpanProcessor {
    sink: Arc<dyn TraceSink>,
    buffer: Mutex<Vec<SpanData>>,
    batch_size: usize,
    max_queue_size: usize,
}

impl BatchSpanProcessor {
    pub fn new(sink: Arc<dyn TraceSink>, batch_size: usize, max_queue_size: usize) -> Self {
        Self {
            sink,
            buffer: Mutex::new(Vec::new()),
            batch_size: batch_size.max(1),
            max_queue_size,
        }
    }

    async fn maybe_export(&self) -> Result<(), String> {
        let to_export: Option<Vec<SpanData>> = {
            let mut buffer = self.buffer.lock().await;
            if buffer.len() >= self.batch_size {
                Some(buffer.drain(..).collect())
            } else {
                None
            }
        };
        if let Some(spans) = to_export {
            self.sink.export(spans).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl SpanProcessor for BatchSpanProcessor {
    async fn on_start(&self, _span: &Span) {}

    async fn on_end(&self, span: SpanData) {
        {
            let mut buffer = self.buffer.lock().await;
            if buffer.len() < self.max_queue_size {
                buffer.push(span);
            }
        }
        if let Err(e) = self.maybe_export().await {
            error!("Failed to export spans: {e}");
        }
    }

    async fn shutdown(&self) -> Result<(), String> {
        self.force_flush().await?;
        self.sink.shutdown().await
    }

    async fn force_flush(&self) -> Result<(), String> {
        let to_export: Vec<SpanData> = {
            let mut buffer = self.buffer.lock().await;
            buffer.drain(..).collect()
        };
        if !to_export.is_empty() {
            self.sink.export(to_export).await?;
        }
        self.sink.force_flush().await
    }
}

// ---------------------------------------------------------------------------
// Context provider
// ---------------------------------------------------------------------------

/// Supplies ambient attributes (`tenant.id`, `correlation.id`,
/// `execution.id`) injected on every span at start.
pub trait ContextProvider: Send + Sync {
    fn context_attributes(&self) -> Vec<(String, SpanAttribute)>;
}

/// A fixed attribute set; covers the common single-tenant case.
pub struct StaticContextProvider {
    attributes: Vec<(String, SpanAttribute)>,
}

impl StaticContextProvider {
    pub fn new(attributes: Vec<(String, SpanAttribute)>) -> Self {
        Self { attributes }
    }
}

impl ContextProvider for StaticContextProvider {
    fn context_attributes(&self) -> Vec<(String, SpanAttribute)> {
        self.attributes.clone()
    }
}

// ---------------------------------------------------------------------------
// Tracer
// ---------------------------------------------------------------------------

/// The in-memory tracer. Use through an `Arc`.
pub struct Tracer {
    config: TracerConfig,
    active: RwLock<HashMap<SpanId, Span>>,
    completed: RwLock<VecDeque<SpanData>>,
    processors: RwLock<Vec<Arc<dyn SpanProcessor>>>,
    context_provider: RwLock<Option<Arc<dyn ContextProvider>>>,
    disposed: AtomicBool,
}

impl Tracer {
    pub fn new(config: TracerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            active: RwLock::new(HashMap::new()),
            completed: RwLock::new(VecDeque::new()),
            processors: RwLock::new(Vec::new()),
            context_provider: RwLock::new(None),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn service_name(&self) -> &str {
        &self.config.service_name
    }

    /// Register a span processor.
    pub async fn add_processor(&self, processor: Arc<dyn SpanProcessor>) {
        self.processors.write().await.push(processor);
    }

    /// Install the ambient-attribute provider.
    pub async fn set_context_provider(&self, provider: Arc<dyn ContextProvider>) {
        *self.context_provider.write().await = Some(provider);
    }

    /// Start a root or child span with default options.
    pub async fn start_span(self: &Arc<Self>, name: impl Into<String>) -> Span {
        self.span_builder(name).start().await
    }

    /// Start building a span.
    pub fn span_builder(self: &Arc<Self>, name: impl Into<String>) -> SpanBuilder {
        SpanBuilder {
            tracer: Arc::clone(self),
            name: name.into(),
            kind: SpanKind::Internal,
            parent: None,
            attributes: Vec::new(),
            timeout_ms: None,
        }
    }

    /// End a span and move it into the completed history.
    pub async fn end_span(&self, span: &Span) {
        if !span.is_recording().await {
            return;
        }
        if span.end_guarded().await {
            self.finalize(span).await;
        }
    }

    /// Number of spans currently recording.
    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }

    /// Snapshot of the completed-span history, oldest first.
    pub async fn completed_spans(&self) -> Vec<SpanData> {
        self.completed.read().await.iter().cloned().collect()
    }

    /// Flush every processor.
    pub async fn force_flush(&self) {
        for processor in self.processors.read().await.iter() {
            if let Err(e) = processor.force_flush().await {
                error!("Trace processor flush failed: {e}");
            }
        }
    }

    /// Close all active spans with an error status, flush, and shut down
    /// processors. Further spans are non-recording.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let active: Vec<Span> = self.active.write().await.drain().map(|(_, s)| s).collect();
        for span in active {
            if span
                .force_end_with_status(SpanStatus::Error {
                    message: "tracer disposed".into(),
                })
                .await
            {
                self.record_completed(&span).await;
            }
        }
        for processor in self.processors.read().await.iter() {
            if let Err(e) = processor.shutdown().await {
                error!("Trace processor shutdown failed: {e}");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn finalize(&self, span: &Span) {
        let span_id = span.span_id().await;
        self.active.write().await.remove(&span_id);
        self.record_completed(span).await;
    }

    async fn record_completed(&self, span: &Span) {
        let data = span.get_data().await;
        {
            let mut completed = self.completed.write().await;
            if completed.len() >= self.config.max_completed_spans {
                completed.pop_front();
            }
            completed.push_back(data.clone());
        }
        for processor in self.processors.read().await.iter() {
            processor.on_end(data.clone()).await;
        }
    }

    fn arm_timeout(self: &Arc<Self>, span: Span, timeout_ms: u64) {
        if timeout_ms == 0 {
            return;
        }
        let tracer = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(timeout_ms)).await;
            if span.force_end_with_status(SpanStatus::Timeout).await {
                debug!("Span force-ended by safety-net timeout");
                tracer.finalize(&span).await;
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Fluent span construction.
pub struct SpanBuilder {
    tracer: Arc<Tracer>,
    name: String,
    kind: SpanKind,
    parent: Option<SpanContext>,
    attributes: Vec<(String, SpanAttribute)>,
    timeout_ms: Option<u64>,
}

impl SpanBuilder {
    #[must_use]
    pub fn with_kind(mut self, kind: SpanKind) -> Self {
        self.kind = kind;
        self
    }

    #[must_use]
    pub fn with_parent(mut self, parent: SpanContext) -> Self {
        self.parent = Some(parent);
        self
    }

    #[must_use]
    pub fn with_attribute(
        mut self,
        key: impl Into<String>,
        value: impl Into<SpanAttribute>,
    ) -> Self {
        self.attributes.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Create the span: resolve the parent (explicit or task-local), apply
    /// sampling, inject ambient attributes, register it, and arm the
    /// safety-net timer.
    pub async fn start(self) -> Span {
        let tracer = self.tracer;

        // Parent: explicit wins, then the task-local current span.
        let parent = self.parent.or_else(propagation::current_span_context);
        let trace_id = parent.as_ref().map(|p| p.trace_id).unwrap_or_default();

        let sampled = !tracer.disposed.load(Ordering::SeqCst)
            && tracer
                .config
                .sampling
                .should_sample(parent.as_ref(), &trace_id);
        let flags = if sampled {
            TraceFlags::SAMPLED
        } else {
            TraceFlags::NONE
        };
        let span_context = SpanContext::new(trace_id, SpanId::new(), flags, false);

        if !sampled {
            return Span::non_recording(span_context);
        }

        let span = Span::new(
            self.name,
            span_context,
            parent,
            self.kind,
            &tracer.config.service_name,
        );
        span.set_attributes(self.attributes).await;
        if let Some(provider) = tracer.context_provider.read().await.as_ref() {
            span.set_attributes(provider.context_attributes()).await;
        }

        let span_id = span.span_id().await;
        tracer.active.write().await.insert(span_id, span.clone());
        for processor in tracer.processors.read().await.iter() {
            processor.on_start(&span).await;
        }
        tracer.arm_timeout(
            span.clone(),
            self.timeout_ms.unwrap_or(tracer.config.span_timeout_ms),
        );

        span
    }
}

// ---------------------------------------------------------------------------
// Global tracer
// ---------------------------------------------------------------------------

lazy_static::lazy_static! {
    static ref GLOBAL_TRACER: std::sync::RwLock<Option<Arc<Tracer>>> =
        std::sync::RwLock::new(None);
}

/// Install the process-wide tracer. Configure once at startup; later calls
/// atomically swap the instance.
pub fn set_global_tracer(tracer: Arc<Tracer>) {
    *GLOBAL_TRACER.write().expect("global tracer lock poisoned") = Some(tracer);
}

/// Retrieve the process-wide tracer, if installed.
pub fn global_tracer() -> Option<Arc<Tracer>> {
    GLOBAL_TRACER
        .read()
        .expect("global tracer lock poisoned")
        .clone()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn span_lifecycle_through_tracer() {
        let tracer = Tracer::new(TracerConfig::new("test-service"));
        let sink = Arc::new(CollectingSink::new());
        tracer
            .add_processor(Arc::new(SimpleSpanProcessor::new(sink.clone())))
            .await;

        let span = tracer.start_span("operation").await;
        assert!(span.is_recording().await);
        assert_eq!(tracer.active_count().await, 1);

        span.set_ok().await;
        tracer.end_span(&span).await;
        assert_eq!(tracer.active_count().await, 0);
        assert_eq!(tracer.completed_spans().await.len(), 1);

        let exported = sink.collected().await;
        assert_eq!(exported.len(), 1);
        assert_eq!(exported[0].name, "operation");
        assert_eq!(exported[0].status, SpanStatus::Ok);
    }

    #[tokio::test]
    async fn end_span_twice_finalizes_once() {
        let tracer = Tracer::new(TracerConfig::new("test-service"));
        let span = tracer.start_span("op").await;
        tracer.end_span(&span).await;
        tracer.end_span(&span).await;
        assert_eq!(tracer.completed_spans().await.len(), 1);
    }

    #[tokio::test]
    async fn sampling_off_yields_non_recording() {
        let config =
            TracerConfig::new("test-service").with_sampling(SamplingStrategy::AlwaysOff);
        let tracer = Tracer::new(config);
        let span = tracer.start_span("op").await;
        assert!(!span.is_recording().await);
        assert_eq!(tracer.active_count().await, 0);
    }

    #[test]
    fn probabilistic_sampling_rate_holds_roughly() {
        let strategy = SamplingStrategy::Probabilistic(0.5);
        let sampled = (0..1000)
            .filter(|_| strategy.should_sample(None, &TraceId::new()))
            .count();
        let ratio = sampled as f64 / 1000.0;
        assert!(ratio > 0.3 && ratio < 0.7, "ratio was {ratio}");
    }

    #[test]
    fn parent_based_follows_parent() {
        let strategy = SamplingStrategy::ParentBased {
            root: Box::new(SamplingStrategy::AlwaysOff),
        };
        let sampled_parent =
            SpanContext::new(TraceId::new(), SpanId::new(), TraceFlags::SAMPLED, false);
        assert!(strategy.should_sample(Some(&sampled_parent), &TraceId::new()));
        assert!(!strategy.should_sample(None, &TraceId::new()));
    }

    #[tokio::test(start_paused = true)]
    async fn span_timeout_force_ends_with_timeout_status() {
        let config = TracerConfig::new("test-service").with_span_timeout_ms(50);
        let tracer = Tracer::new(config);
        let span = tracer.start_span("stuck").await;

        tokio::time::sleep(std::time::Duration::from_millis(120)).await;
        // Give the timeout task a chance to run to completion.
        tokio::task::yield_now().await;

        assert!(span.is_ended().await);
        assert_eq!(span.get_data().await.status, SpanStatus::Timeout);
        assert_eq!(tracer.active_count().await, 0);
        assert_eq!(tracer.completed_spans().await.len(), 1);
    }

    #[tokio::test]
    async fn dispose_closes_active_spans_with_error() {
        let tracer = Tracer::new(TracerConfig::new("test-service"));
        let span = tracer.start_span("doomed").await;
        tracer.dispose().await;

        assert!(span.is_ended().await);
        assert!(matches!(
            span.get_data().await.status,
            SpanStatus::Error { .. }
        ));
        // New spans after dispose are non-recording.
        let after = tracer.start_span("late").await;
        assert!(!after.is_recording().await);
    }

    #[tokio::test]
    async fn completed_history_is_bounded_fifo() {
        let config = TracerConfig {
            max_completed_spans: 3,
            ..TracerConfig::new("test-service")
        };
        let tracer = Tracer::new(config);
        for i in 0..5 {
            let span = tracer.start_span(format!("op-{i}")).await;
            tracer.end_span(&span).await;
        }
        let completed = tracer.completed_spans().await;
        assert_eq!(completed.len(), 3);
        assert_eq!(completed[0].name, "op-2");
        assert_eq!(completed[2].name, "op-4");
    }

    #[tokio::test]
    async fn context_provider_attributes_injected() {
        let tracer = Tracer::new(TracerConfig::new("test-service"));
        tracer
            .set_context_provider(Arc::new(StaticContextProvider::new(vec![
                ("tenant.id".into(), "acme".into()),
                ("correlation.id".into(), "corr-9".into()),
            ])))
            .await;

        let span = tracer.start_span("op").await;
        let data = span.get_data().await;
        assert_eq!(data.attributes["tenant.id"], SpanAttribute::String("acme".into()));
        assert_eq!(
            data.attributes["correlation.id"],
            SpanAttribute::String("corr-9".into())
        );
    }

    #[tokio::test]
    async fn batch_processor_flushes_on_batch_and_force() {
        let sink = Arc::new(CollectingSink::new());
        let processor = BatchSpanProcessor::new(sink.clone(), 2, 100);
        let tracer = Tracer::new(TracerConfig::new("test-service"));

        let a = tracer.start_span("a").await;
        processor.on_end(a.get_data().await).await;
        assert!(sink.collected().await.is_empty());

        let b = tracer.start_span("b").await;
        processor.on_end(b.get_data().await).await;
        assert_eq!(sink.collected().await.len(), 2);

        let c = tracer.start_span("c").await;
        processor.on_end(c.get_data().await).await;
        processor.force_flush().await.unwrap();
        assert_eq!(sink.collected().await.len(), 3);
    }
}
