//! Observable operations — compose retry, timeout, validation, and
//! observation around a tool runner.
//!
//! The scheduler applies its own policy table to plan steps; this builder
//! serves hosts that invoke tools *outside* a plan (warm-up calls, health
//! checks, ad-hoc invocations) and still want the same hardening. Wrap a
//! runner once, then use it anywhere a [`ToolRunner`] is expected.
//!
//! ```rust,ignore
//! let hardened = ObservableOperation::new(raw_runner)
//!     .with_retry(3, 250)
//!     .with_timeout_ms(10_000)
//!     .with_validator(|out| {
//!         out.value.get("status").is_some().then_some(()).ok_or("missing status".into())
//!     })
//!     .build();
//! ```

use async_trait::async_trait;
use std::sync::Arc;

use crate::executor::retry_backoff_ms;
use crate::ids;
use crate::runtime::{ToolContext, ToolError, ToolOutput, ToolRunner};

/// Validates a tool output; an `Err` is treated as a retryable failure.
pub type OutputValidator = dyn Fn(&ToolOutput) -> Result<(), String> + Send + Sync;

/// Hooks around each wrapped invocation attempt.
#[async_trait]
pub trait InvocationObserver: Send + Sync {
    async fn on_invoke(&self, _tool: &str, _ctx: &ToolContext) {}

    async fn on_result(
        &self,
        _tool: &str,
        _ctx: &ToolContext,
        _result: &Result<ToolOutput, ToolError>,
        _duration_ms: u64,
    ) {
    }
}

/// Builder composing hardening layers around a [`ToolRunner`].
pub struct ObservableOperation {
    inner: Arc<dyn ToolRunner>,
    retry_limit: u32,
    retry_delay_ms: u64,
    timeout_ms: Option<u64>,
    validator: Option<Arc<OutputValidator>>,
    observers: Vec<Arc<dyn InvocationObserver>>,
}

impl ObservableOperation {
    pub fn new(inner: Arc<dyn ToolRunner>) -> Self {
        Self {
            inner,
            retry_limit: 0,
            retry_delay_ms: 250,
            timeout_ms: None,
            validator: None,
            observers: Vec::new(),
        }
    }

    /// Retry failed invocations up to `limit` times with exponential
    /// backoff from `base_delay_ms` (doubling, capped at 30 s).
    #[must_use]
    pub fn with_retry(mut self, limit: u32, base_delay_ms: u64) -> Self {
        self.retry_limit = limit;
        self.retry_delay_ms = base_delay_ms.max(1);
        self
    }

    /// Bound each attempt to `timeout_ms`.
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Reject outputs the validator refuses; rejection counts as a failure
    /// and consumes a retry.
    #[must_use]
    pub fn with_validator(
        mut self,
        validator: impl Fn(&ToolOutput) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Observe every attempt (e.g. to open a span per invocation).
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn InvocationObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Finish the composition.
    pub fn build(self) -> Arc<dyn ToolRunner> {
        Arc::new(ObservableRunner {
            inner: self.inner,
            retry_limit: self.retry_limit,
            retry_delay_ms: self.retry_delay_ms,
            timeout_ms: self.timeout_ms,
            validator: self.validator,
            observers: self.observers,
        })
    }
}

struct ObservableRunner {
    inner: Arc<dyn ToolRunner>,
    retry_limit: u32,
    retry_delay_ms: u64,
    timeout_ms: Option<u64>,
    validator: Option<Arc<OutputValidator>>,
    observers: Vec<Arc<dyn InvocationObserver>>,
}

impl ObservableRunner {
    async fn attempt(
        &self,
        tool_name: &str,
        arguments: &serde_json::Map<String, serde_json::Value>,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let result = match self.timeout_ms {
            Some(timeout_ms) => {
                tokio::select! {
                    biased;
                    _ = ctx.cancellation.cancelled() => {
                        Err(ToolError::Cancelled(tool_name.to_string()))
                    }
                    _ = tokio::time::sleep(std::time::Duration::from_millis(timeout_ms)) => {
                        Err(ToolError::Failed {
                            tool: tool_name.to_string(),
                            message: format!("timed out after {timeout_ms}ms"),
                        })
                    }
                    result = self.inner.invoke(tool_name, arguments, ctx) => result,
                }
            }
            None => self.inner.invoke(tool_name, arguments, ctx).await,
        };

        match (result, &self.validator) {
            (Ok(output), Some(validator)) => match validator(&output) {
                Ok(()) => Ok(output),
                Err(reason) => Err(ToolError::Failed {
                    tool: tool_name.to_string(),
                    message: format!("output rejected: {reason}"),
                }),
            },
            (result, _) => result,
        }
    }
}

#[async_trait]
impl ToolRunner for ObservableRunner {
    async fn invoke(
        &self,
        tool_name: &str,
        arguments: &serde_json::Map<String, serde_json::Value>,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let attempt_ctx = ToolContext {
                attempt,
                ..ctx.clone()
            };
            for observer in &self.observers {
                observer.on_invoke(tool_name, &attempt_ctx).await;
            }

            let started = ids::now_ms();
            let result = self.attempt(tool_name, arguments, &attempt_ctx).await;
            let duration = ids::now_ms().saturating_sub(started);
            for observer in &self.observers {
                observer
                    .on_result(tool_name, &attempt_ctx, &result, duration)
                    .await;
            }

            match result {
                Ok(output) => return Ok(output),
                // Cancellation is never retried.
                Err(ToolError::Cancelled(tool)) => return Err(ToolError::Cancelled(tool)),
                Err(err) if attempt <= self.retry_limit => {
                    let delay = retry_backoff_ms(self.retry_delay_ms, attempt);
                    tracing::debug!(
                        tool = tool_name,
                        attempt,
                        delay_ms = delay,
                        "Retrying observable operation: {err}"
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{FnToolRunner, ToolFuture};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_util::sync::CancellationToken;

    fn ctx() -> ToolContext {
        ToolContext {
            call_id: "call-1".into(),
            step_id: "s1".into(),
            execution_id: "exec-1".into(),
            plan_id: "plan-1".into(),
            correlation_id: "corr-1".into(),
            tenant_id: None,
            deadline_ms: None,
            attempt: 1,
            cancellation: CancellationToken::new(),
        }
    }

    fn flaky_runner(failures: u32) -> Arc<dyn ToolRunner> {
        let remaining = Arc::new(AtomicU32::new(failures));
        Arc::new(FnToolRunner::new(move |tool, _args, _ctx| {
            let tool = tool.to_string();
            let remaining = Arc::clone(&remaining);
            Box::pin(async move {
                if remaining
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
                {
                    Err(ToolError::Failed {
                        tool,
                        message: "transient".into(),
                    })
                } else {
                    Ok(ToolOutput::value("ok"))
                }
            }) as ToolFuture
        }))
    }

    #[tokio::test]
    async fn retries_until_success() {
        let runner = ObservableOperation::new(flaky_runner(2))
            .with_retry(3, 1)
            .build();
        let out = runner
            .invoke("fetch", &serde_json::Map::new(), &ctx())
            .await
            .unwrap();
        assert_eq!(out.value, json!("ok"));
    }

    #[tokio::test]
    async fn exhausted_retries_surface_the_error() {
        let runner = ObservableOperation::new(flaky_runner(10))
            .with_retry(2, 1)
            .build();
        let result = runner.invoke("fetch", &serde_json::Map::new(), &ctx()).await;
        assert!(matches!(result, Err(ToolError::Failed { .. })));
    }

    #[tokio::test]
    async fn timeout_counts_as_failure() {
        let slow = Arc::new(FnToolRunner::new(|_tool, _args, _ctx| {
            Box::pin(async move {
                tokio::time::sleep(std::time::Duration::from_secs(60)).await;
                Ok(ToolOutput::value("late"))
            }) as ToolFuture
        }));
        let runner = ObservableOperation::new(slow).with_timeout_ms(20).build();
        let result = runner.invoke("slow", &serde_json::Map::new(), &ctx()).await;
        match result {
            Err(ToolError::Failed { message, .. }) => assert!(message.contains("timed out")),
            other => panic!("expected timeout failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn validator_rejection_is_retryable() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counting = {
            let attempts = Arc::clone(&attempts);
            Arc::new(FnToolRunner::new(move |_tool, _args, _ctx| {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                Box::pin(async move { Ok(ToolOutput::value(json!({ "attempt": n }))) })
                    as ToolFuture
            }))
        };
        // Accept only the second output.
        let runner = ObservableOperation::new(counting)
            .with_retry(3, 1)
            .with_validator(|out| {
                if out.value["attempt"] == json!(1) {
                    Ok(())
                } else {
                    Err("not yet".into())
                }
            })
            .build();

        let out = runner
            .invoke("picky", &serde_json::Map::new(), &ctx())
            .await
            .unwrap();
        assert_eq!(out.value["attempt"], json!(1));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancellation_is_not_retried() {
        let cancelled = Arc::new(FnToolRunner::new(|tool, _args, _ctx| {
            let tool = tool.to_string();
            Box::pin(async move { Err(ToolError::Cancelled(tool)) }) as ToolFuture
        }));
        let runner = ObservableOperation::new(cancelled).with_retry(5, 1).build();
        let result = runner.invoke("halt", &serde_json::Map::new(), &ctx()).await;
        assert!(matches!(result, Err(ToolError::Cancelled(_))));
    }

    #[tokio::test]
    async fn observers_see_every_attempt() {
        struct Counting(AtomicU32, AtomicU32);

        #[async_trait]
        impl InvocationObserver for Counting {
            async fn on_invoke(&self, _tool: &str, _ctx: &ToolContext) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }

            async fn on_result(
                &self,
                _tool: &str,
                _ctx: &ToolContext,
                _result: &Result<ToolOutput, ToolError>,
                _duration_ms: u64,
            ) {
                self.1.fetch_add(1, Ordering::SeqCst);
            }
        }

        let observer = Arc::new(Counting(AtomicU32::new(0), AtomicU32::new(0)));
        let runner = ObservableOperation::new(flaky_runner(1))
            .with_retry(2, 1)
            .with_observer(observer.clone())
            .build();
        runner
            .invoke("fetch", &serde_json::Map::new(), &ctx())
            .await
            .unwrap();

        assert_eq!(observer.0.load(Ordering::SeqCst), 2);
        assert_eq!(observer.1.load(Ordering::SeqCst), 2);
    }
}
