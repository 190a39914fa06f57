//! Span — the basic unit of tracing.

use super::context::{SpanContext, SpanId, TraceId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Span kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SpanKind {
    /// Internal operation.
    #[default]
    Internal,
    /// Server side (handling a request).
    Server,
    /// Client side (issuing a request).
    Client,
    /// Message producer.
    Producer,
    /// Message consumer.
    Consumer,
}

impl std::fmt::Display for SpanKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpanKind::Internal => write!(f, "INTERNAL"),
            SpanKind::Server => write!(f, "SERVER"),
            SpanKind::Client => write!(f, "CLIENT"),
            SpanKind::Producer => write!(f, "PRODUCER"),
            SpanKind::Consumer => write!(f, "CONSUMER"),
        }
    }
}

/// Span status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SpanStatus {
    #[default]
    Unset,
    Ok,
    Error {
        message: String,
    },
    /// The span's safety-net timer expired before `end` was called.
    Timeout,
}

/// Span attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SpanAttribute {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    StringArray(Vec<String>),
}

impl From<&str> for SpanAttribute {
    fn from(v: &str) -> Self {
        SpanAttribute::String(v.to_string())
    }
}

impl From<String> for SpanAttribute {
    fn from(v: String) -> Self {
        SpanAttribute::String(v)
    }
}

impl From<i64> for SpanAttribute {
    fn from(v: i64) -> Self {
        SpanAttribute::Int(v)
    }
}

impl From<i32> for SpanAttribute {
    fn from(v: i32) -> Self {
        SpanAttribute::Int(v as i64)
    }
}

impl From<u64> for SpanAttribute {
    fn from(v: u64) -> Self {
        SpanAttribute::Int(v as i64)
    }
}

impl From<f64> for SpanAttribute {
    fn from(v: f64) -> Self {
        SpanAttribute::Float(v)
    }
}

impl From<bool> for SpanAttribute {
    fn from(v: bool) -> Self {
        SpanAttribute::Bool(v)
    }
}

impl From<Vec<String>> for SpanAttribute {
    fn from(v: Vec<String>) -> Self {
        SpanAttribute::StringArray(v)
    }
}

/// Timestamped event attached to a span.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanEvent {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub attributes: HashMap<String, SpanAttribute>,
}

impl SpanEvent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timestamp: Utc::now(),
            attributes: HashMap::new(),
        }
    }

    pub fn with_attribute(
        mut self,
        key: impl Into<String>,
        value: impl Into<SpanAttribute>,
    ) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// Exported span payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanData {
    pub span_context: SpanContext,
    pub parent_span_context: Option<SpanContext>,
    pub name: String,
    pub kind: SpanKind,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: SpanStatus,
    pub attributes: HashMap<String, SpanAttribute>,
    pub events: Vec<SpanEvent>,
    pub service_name: String,
}

struct SpanInner {
    data: SpanData,
    is_recording: bool,
    is_ended: bool,
}

/// A handle to one traced unit of work. Cloning shares the same span.
pub struct Span {
    inner: Arc<RwLock<SpanInner>>,
}

impl Span {
    pub(crate) fn new(
        name: impl Into<String>,
        span_context: SpanContext,
        parent_span_context: Option<SpanContext>,
        kind: SpanKind,
        service_name: impl Into<String>,
    ) -> Self {
        let inner = SpanInner {
            data: SpanData {
                span_context,
                parent_span_context,
                name: name.into(),
                kind,
                start_time: Utc::now(),
                end_time: None,
                status: SpanStatus::Unset,
                attributes: HashMap::new(),
                events: Vec::new(),
                service_name: service_name.into(),
            },
            is_recording: true,
            is_ended: false,
        };
        Self {
            inner: Arc::new(RwLock::new(inner)),
        }
    }

    /// A non-recording span for unsampled traces: every mutator is a no-op.
    pub fn non_recording(span_context: SpanContext) -> Self {
        let inner = SpanInner {
            data: SpanData {
                span_context,
                parent_span_context: None,
                name: String::new(),
                kind: SpanKind::Internal,
                start_time: Utc::now(),
                end_time: None,
                status: SpanStatus::Unset,
                attributes: HashMap::new(),
                events: Vec::new(),
                service_name: String::new(),
            },
            is_recording: false,
            is_ended: false,
        };
        Self {
            inner: Arc::new(RwLock::new(inner)),
        }
    }

    pub async fn span_context(&self) -> SpanContext {
        self.inner.read().await.data.span_context.clone()
    }

    pub async fn trace_id(&self) -> TraceId {
        self.inner.read().await.data.span_context.trace_id
    }

    pub async fn span_id(&self) -> SpanId {
        self.inner.read().await.data.span_context.span_id
    }

    pub async fn is_recording(&self) -> bool {
        self.inner.read().await.is_recording
    }

    pub async fn is_ended(&self) -> bool {
        self.inner.read().await.is_ended
    }

    pub async fn set_attribute(&self, key: impl Into<String>, value: impl Into<SpanAttribute>) {
        let mut inner = self.inner.write().await;
        if inner.is_recording && !inner.is_ended {
            inner.data.attributes.insert(key.into(), value.into());
        }
    }

    pub async fn set_attributes(
        &self,
        attributes: impl IntoIterator<Item = (String, SpanAttribute)>,
    ) {
        let mut inner = self.inner.write().await;
        if inner.is_recording && !inner.is_ended {
            for (key, value) in attributes {
                inner.data.attributes.insert(key, value);
            }
        }
    }

    pub async fn add_event(&self, event: SpanEvent) {
        let mut inner = self.inner.write().await;
        if inner.is_recording && !inner.is_ended {
            inner.data.events.push(event);
        }
    }

    pub async fn add_event_with_name(&self, name: impl Into<String>) {
        self.add_event(SpanEvent::new(name)).await;
    }

    pub async fn set_status(&self, status: SpanStatus) {
        let mut inner = self.inner.write().await;
        if inner.is_recording && !inner.is_ended {
            inner.data.status = status;
        }
    }

    pub async fn set_ok(&self) {
        self.set_status(SpanStatus::Ok).await;
    }

    pub async fn set_error(&self, message: impl Into<String>) {
        self.set_status(SpanStatus::Error {
            message: message.into(),
        })
        .await;
    }

    /// Record an error as an `exception` event and set error status.
    pub async fn record_exception(&self, error: &(dyn std::error::Error + Send + Sync)) {
        let event = SpanEvent::new("exception")
            .with_attribute("exception.type", std::any::type_name_of_val(error))
            .with_attribute("exception.message", error.to_string());
        self.add_event(event).await;
        self.set_error(error.to_string()).await;
    }

    pub async fn update_name(&self, name: impl Into<String>) {
        let mut inner = self.inner.write().await;
        if inner.is_recording && !inner.is_ended {
            inner.data.name = name.into();
        }
    }

    /// End the span. Idempotent. `end_time` is present iff the span is no
    /// longer recording.
    pub async fn end(&self) {
        let mut inner = self.inner.write().await;
        if !inner.is_ended {
            inner.is_ended = true;
            inner.data.end_time = Some(Utc::now());
        }
    }

    /// End the span, reporting whether this call performed the transition.
    /// Lets the tracer finalize each span exactly once.
    pub(crate) async fn end_guarded(&self) -> bool {
        let mut inner = self.inner.write().await;
        if inner.is_ended {
            return false;
        }
        inner.is_ended = true;
        inner.data.end_time = Some(Utc::now());
        true
    }

    /// End the span with a forced status even if one was already set.
    /// Used by the tracer's timeout and dispose paths.
    pub(crate) async fn force_end_with_status(&self, status: SpanStatus) -> bool {
        let mut inner = self.inner.write().await;
        if inner.is_ended {
            return false;
        }
        inner.is_ended = true;
        inner.data.status = status;
        inner.data.end_time = Some(Utc::now());
        true
    }

    pub async fn get_data(&self) -> SpanData {
        self.inner.read().await.data.clone()
    }

    pub async fn duration_ms(&self) -> Option<i64> {
        let inner = self.inner.read().await;
        inner
            .data
            .end_time
            .map(|end| (end - inner.data.start_time).num_milliseconds())
    }
}

impl Clone for Span {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}
