//! External collaborator interfaces — tool runner, LLM client, session store.
//!
//! The core consumes these through narrow traits and never depends on a
//! concrete transport. Hosts supply implementations; tests supply stubs.
//!
//! Cancellation is cooperative: runners receive a
//! [`CancellationToken`](tokio_util::sync::CancellationToken) in the
//! [`ToolContext`] and must finish promptly with [`ToolError::Cancelled`]
//! once it trips. Idempotence is not assumed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Tool runner
// ---------------------------------------------------------------------------

/// Per-invocation context threaded into every tool call.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// The flattened call this invocation serves.
    pub call_id: String,
    /// The plan step behind the call.
    pub step_id: String,
    /// Execution the call belongs to.
    pub execution_id: String,
    /// Plan the call belongs to.
    pub plan_id: String,
    /// Correlation ID shared across plan, execution, events, and spans.
    pub correlation_id: String,
    /// Tenant, if the host is multi-tenant.
    pub tenant_id: Option<String>,
    /// Absolute deadline in epoch milliseconds, if any.
    pub deadline_ms: Option<u64>,
    /// 1-based attempt number (increments across retries).
    pub attempt: u32,
    /// Cooperative cancellation token; poll at suspension points.
    pub cancellation: CancellationToken,
}

/// Successful tool output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolOutput {
    /// The tool's result payload.
    pub value: serde_json::Value,
    /// Data points processed, when the runner reports throughput.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_points: Option<u64>,
}

impl ToolOutput {
    /// Wrap a JSON value with no throughput report.
    pub fn value(value: impl Into<serde_json::Value>) -> Self {
        Self {
            value: value.into(),
            data_points: None,
        }
    }
}

/// Errors a tool runner may surface.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ToolError {
    /// The named tool is not registered with the host.
    #[error("Tool '{0}' not found")]
    NotFound(String),

    /// The invocation failed; retryable per the step's policy.
    #[error("Tool '{tool}' failed: {message}")]
    Failed { tool: String, message: String },

    /// The cancellation token tripped mid-invocation.
    #[error("Tool '{0}' cancelled")]
    Cancelled(String),
}

/// Host-supplied tool execution interface.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Invoke a tool by name. Must complete promptly with
    /// [`ToolError::Cancelled`] when `ctx.cancellation` trips.
    async fn invoke(
        &self,
        tool_name: &str,
        arguments: &serde_json::Map<String, serde_json::Value>,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError>;
}

/// Boxed future type used by [`FnToolRunner`] handlers.
pub type ToolFuture = Pin<Box<dyn Future<Output = Result<ToolOutput, ToolError>> + Send>>;

/// A [`ToolRunner`] backed by a closure — the standard test double, also
/// handy for embedding small hosts.
///
/// # Example
///
/// ```rust,ignore
/// let runner = FnToolRunner::new(|tool, _args, _ctx| {
///     let tool = tool.to_string();
///     Box::pin(async move { Ok(ToolOutput::value(format!("{tool}: ok"))) })
/// });
/// ```
pub struct FnToolRunner<F> {
    handler: F,
}

impl<F> FnToolRunner<F>
where
    F: Fn(&str, &serde_json::Map<String, serde_json::Value>, &ToolContext) -> ToolFuture
        + Send
        + Sync,
{
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl<F> ToolRunner for FnToolRunner<F>
where
    F: Fn(&str, &serde_json::Map<String, serde_json::Value>, &ToolContext) -> ToolFuture
        + Send
        + Sync,
{
    async fn invoke(
        &self,
        tool_name: &str,
        arguments: &serde_json::Map<String, serde_json::Value>,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        (self.handler)(tool_name, arguments, ctx).await
    }
}

// ---------------------------------------------------------------------------
// LLM client
// ---------------------------------------------------------------------------

/// Token accounting reported by the model host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Options for a generation request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerateOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// A completed generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub output: String,
    pub usage: TokenUsage,
    pub model: String,
}

/// Errors from the model host. Propagate as planner errors when a strategy
/// calls out for decomposition.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[non_exhaustive]
pub enum LlmError {
    #[error("LLM request failed: {0}")]
    Request(String),

    #[error("LLM response malformed: {0}")]
    Malformed(String),
}

/// Host-supplied LLM interface, used by strategies that delegate
/// decomposition to a model.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn generate(&self, prompt: &str, options: &GenerateOptions)
    -> Result<LlmResponse, LlmError>;
}

// ---------------------------------------------------------------------------
// Session store
// ---------------------------------------------------------------------------

/// Narrow key-value session interface for enrichment contexts. The core
/// reads and writes opaque JSON; the schema belongs to the host.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, session_id: &str, key: &str) -> Option<serde_json::Value>;
    async fn set(&self, session_id: &str, key: &str, value: serde_json::Value);
}

/// In-memory [`SessionStore`] for tests and single-process hosts.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, HashMap<String, serde_json::Value>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared handle, ready to hand to the planner.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, session_id: &str, key: &str) -> Option<serde_json::Value> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .and_then(|s| s.get(key).cloned())
    }

    async fn set(&self, session_id: &str, key: &str, value: serde_json::Value) {
        self.sessions
            .write()
            .await
            .entry(session_id.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_context() -> ToolContext {
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

    #[tokio::test]
    async fn fn_tool_runner_invokes_handler() {
        let runner = FnToolRunner::new(|tool, _args, _ctx| {
            let tool = tool.to_string();
            Box::pin(async move { Ok(ToolOutput::value(json!({ "tool": tool }))) }) as ToolFuture
        });

        let out = runner
            .invoke("fetch", &serde_json::Map::new(), &test_context())
            .await
            .unwrap();
        assert_eq!(out.value["tool"], "fetch");
    }

    #[tokio::test]
    async fn fn_tool_runner_observes_cancellation() {
        let runner = FnToolRunner::new(|tool, _args, ctx| {
            let tool = tool.to_string();
            let token = ctx.cancellation.clone();
            Box::pin(async move {
                tokio::select! {
                    _ = token.cancelled() => Err(ToolError::Cancelled(tool)),
                    _ = tokio::time::sleep(std::time::Duration::from_secs(60)) => {
                        Ok(ToolOutput::value("done"))
                    }
                }
            }) as ToolFuture
        });

        let ctx = test_context();
        ctx.cancellation.cancel();
        let result = runner.invoke("slow", &serde_json::Map::new(), &ctx).await;
        assert!(matches!(result, Err(ToolError::Cancelled(_))));
    }

    #[tokio::test]
    async fn in_memory_session_store_roundtrip() {
        let store = InMemorySessionStore::new();
        assert!(store.get("sess", "history").await.is_none());
        store.set("sess", "history", json!(["q1"])).await;
        assert_eq!(store.get("sess", "history").await, Some(json!(["q1"])));
        // A different session sees nothing.
        assert!(store.get("other", "history").await.is_none());
    }

    #[test]
    fn tool_error_display() {
        let e = ToolError::Failed {
            tool: "fetch".into(),
            message: "connection reset".into(),
        };
        assert!(e.to_string().contains("fetch"));
        assert!(e.to_string().contains("connection reset"));
    }
}
