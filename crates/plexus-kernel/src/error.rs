//! Crate-level error types for `plexus-kernel`.
//!
//! Provides a unified [`KernelError`] that composes errors from every
//! sub-module together with [`error_stack::Report`] for rich,
//! context-carrying propagation via the [`KernelResult`] alias.

use thiserror::Error;

use crate::bus::BusError;
use crate::config::ConfigError;
use crate::executor::ExecutorError;
use crate::plan::PlanError;
use crate::planner::PlannerError;
use crate::runtime::{LlmError, ToolError};
use crate::timeline::TimelineError;

/// Crate-level error type for `plexus-kernel`.
///
/// Wraps each sub-module's typed error via `#[from]` so the `?` operator
/// converts them automatically.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KernelError {
    /// A structural plan error.
    #[error("Plan error: {0}")]
    Plan(#[from] PlanError),

    /// A planner-level error.
    #[error("Planner error: {0}")]
    Planner(#[from] PlannerError),

    /// A scheduler/executor error.
    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),

    /// A bus communication error.
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    /// A timeline state-machine error.
    #[error("Timeline error: {0}")]
    Timeline(#[from] TimelineError),

    /// A configuration error.
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// A tool invocation error surfaced outside the scheduler's policy table.
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    /// An LLM host error.
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    /// A JSON (de)serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An internal / untyped error described by a message string.
    #[error("{0}")]
    Internal(String),
}

/// Convenience result alias using [`error_stack::Report`].
pub type KernelResult<T> = Result<T, error_stack::Report<KernelError>>;

#[cfg(test)]
mod tests {
    use super::*;
    use error_stack::{Report, ResultExt};

    #[test]
    fn plan_error_converts_via_from() {
        let err: KernelError = PlanError::DuplicateStepId("a".into()).into();
        assert!(matches!(err, KernelError::Plan(_)));
        assert!(err.to_string().contains("'a'"));
    }

    #[test]
    fn bus_error_converts_via_from() {
        let err: KernelError = BusError::SubscriptionNotFound("sub-1".into()).into();
        assert!(matches!(err, KernelError::Bus(_)));
    }

    #[test]
    fn serde_error_converts_via_from() {
        let serde_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: KernelError = serde_err.into();
        assert!(matches!(err, KernelError::Serialization(_)));
    }

    #[test]
    fn internal_error_display() {
        let err = KernelError::Internal("something broke".into());
        assert_eq!(err.to_string(), "something broke");
    }

    #[test]
    fn report_carries_context() {
        let result: KernelResult<()> =
            Err(Report::new(KernelError::Internal("root cause".into())))
                .attach("while starting an execution");
        let report = result.unwrap_err();
        let display = format!("{report:?}");
        assert!(display.contains("root cause"));
        assert!(display.contains("while starting an execution"));
    }
}
