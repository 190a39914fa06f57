//! Core event model shared by the bus, the scheduler, and the timeline.
//!
//! Events use a single concrete type with a namespaced `event_type` string
//! rather than one enum per producer — components that only route or store
//! events never need to know every payload shape.
//!
//! Common type prefixes:
//!
//! - `planner:*` — plan creation and replanning (`planner:plan.created`)
//! - `plan:*` — plan lifecycle (`plan:started`, `plan:completed`, `plan:failed`)
//! - `step:*` — step lifecycle (`step:started`, `step:completed`, `step:failed`,
//!   `step:skipped`, `step:retrying`)
//! - `tool:*` — tool invocation (`tool:called`, `tool:result`, `tool:error`)
//! - `agent:*` — agent phases (`agent:started`, `agent:thinking`, `agent:completed`)
//! - `system:*` — infrastructure (`system:memory.leak.detected`)

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::ids;

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Delivery priority of an event.
///
/// The bus reserves headroom in its buffer for [`EventPriority::Critical`]
/// events; normal events are shed first under backpressure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventPriority {
    /// Best-effort delivery; may be dropped when the buffer is near capacity.
    #[default]
    Normal,
    /// Must-not-drop delivery; uses the reserved buffer headroom.
    Critical,
}

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

/// Cross-component correlation metadata attached to every event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Correlation ID tying the event to a plan/execution/span family.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Execution this event belongs to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    /// Tenant the producing workload runs under, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    /// Free-form extra attributes.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, String>,
}

impl EventMetadata {
    /// Metadata carrying only a correlation ID.
    pub fn correlated(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// BusEvent
// ---------------------------------------------------------------------------

/// A single event published on the [`EventBus`](crate::bus::EventBus).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEvent {
    /// Unique event ID.
    pub id: String,

    /// Namespaced event type, e.g. `"step:completed"`.
    pub event_type: String,

    /// Component that produced the event, e.g. `"scheduler"`.
    pub source: String,

    /// Epoch-milliseconds timestamp assigned at construction.
    pub timestamp: u64,

    /// JSON payload.
    pub data: serde_json::Value,

    /// Correlation metadata.
    #[serde(default)]
    pub metadata: EventMetadata,

    /// Delivery priority.
    #[serde(default)]
    pub priority: EventPriority,
}

impl BusEvent {
    /// Create a new event with a fresh ID and the current timestamp.
    pub fn new(event_type: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: ids::event_id(),
            event_type: event_type.into(),
            source: source.into(),
            timestamp: ids::now_ms(),
            data: serde_json::Value::Null,
            metadata: EventMetadata::default(),
            priority: EventPriority::Normal,
        }
    }

    /// Attach a JSON payload.
    #[must_use]
    pub fn with_data(mut self, data: impl Into<serde_json::Value>) -> Self {
        self.data = data.into();
        self
    }

    /// Attach correlation metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: EventMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Set the correlation ID.
    #[must_use]
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.metadata.correlation_id = Some(id.into());
        self
    }

    /// Set the execution ID.
    #[must_use]
    pub fn with_execution_id(mut self, id: impl Into<String>) -> Self {
        self.metadata.execution_id = Some(id.into());
        self
    }

    /// Set the tenant ID.
    #[must_use]
    pub fn with_tenant_id(mut self, id: impl Into<String>) -> Self {
        self.metadata.tenant_id = Some(id.into());
        self
    }

    /// Mark the event as critical (never shed under backpressure).
    #[must_use]
    pub fn critical(mut self) -> Self {
        self.priority = EventPriority::Critical;
        self
    }

    /// Deserialize the payload into a typed value.
    pub fn data_as<T: for<'de> Deserialize<'de>>(&self) -> Option<T> {
        serde_json::from_value(self.data.clone()).ok()
    }

    /// Returns `true` if the event type matches exactly.
    pub fn is_type(&self, event_type: &str) -> bool {
        self.event_type == event_type
    }

    /// Returns `true` if the event type starts with the given prefix.
    pub fn matches_prefix(&self, prefix: &str) -> bool {
        self.event_type.starts_with(prefix)
    }
}
