//! Identifier service — correlation, execution, plan, call, and replan IDs.
//!
//! Every entity in the core is cross-referenced by ID rather than by direct
//! reference, so ID generation is centralized here. IDs are UUIDv4 strings
//! with a short type prefix, which makes log lines self-describing
//! (`corr-…` vs `exec-…`) and keeps accidental cross-type comparisons
//! visible during debugging.

use uuid::Uuid;

/// Generate a correlation ID tying plan, execution, events, and spans together.
pub fn correlation_id() -> String {
    prefixed("corr")
}

/// Generate a plan ID.
pub fn plan_id() -> String {
    prefixed("plan")
}

/// Generate an execution ID.
pub fn execution_id() -> String {
    prefixed("exec")
}

/// Generate a tool-call ID.
pub fn call_id() -> String {
    prefixed("call")
}

/// Generate a replan ID.
pub fn replan_id() -> String {
    prefixed("replan")
}

/// Generate an event ID.
pub fn event_id() -> String {
    prefixed("evt")
}

/// Generate an alert ID.
pub fn alert_id() -> String {
    prefixed("alert")
}

fn prefixed(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4())
}

// ---------------------------------------------------------------------------
// Clock abstraction (injectable for testing)
// ---------------------------------------------------------------------------

/// Provides the current wall-clock time as Unix-epoch milliseconds.
///
/// Timing-sensitive components (scheduler, timeline, leak detector sweeps)
/// take a `Clock` rather than calling `SystemTime::now()` directly, so tests
/// can drive them deterministically.
pub trait Clock: Send + Sync {
    /// Returns the current time as milliseconds since the Unix epoch.
    fn now_millis(&self) -> u64;
}

/// The default [`Clock`] implementation backed by the system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis()
            .try_into()
            .unwrap_or(u64::MAX)
    }
}

/// Current wall-clock time in epoch milliseconds via [`SystemClock`].
pub fn now_ms() -> u64 {
    SystemClock.now_millis()
}
