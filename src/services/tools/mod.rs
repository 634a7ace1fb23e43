//! Tool Registry & Invocation
//!
//! Named tools with typed parameter descriptors, dispatched on a bounded
//! worker pool. Tool failures are returned as structured results, never as
//! crashes: the LLM sees `{"error": <kind>, "message": <text>}`.

pub mod ops;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::{json, Value};
use tokio::sync::Semaphore;

use crate::services::llm::ToolDefinition;

/// Default size of the shared tool worker pool
pub const TOOL_POOL_SIZE: usize = 32;

/// Per-tool-call timeout
pub const TOOL_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Result of a tool execution
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub success: bool,
    pub output: Option<String>,
    pub error: Option<String>,
}

impl ToolResult {
    /// Create a successful result
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: Some(output.into()),
            error: None,
        }
    }

    /// Create an error result
    pub fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
        }
    }
}

/// Async tool handler taking JSON arguments
pub type ToolHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, ToolResult> + Send + Sync>;

struct RegisteredTool {
    definition: ToolDefinition,
    handler: ToolHandler,
}

/// Registry of named tools sharing one bounded worker pool.
///
/// Each agent carries its own registry instance; the semaphore is shared
/// across all registries (and requests) to cap concurrent external I/O.
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
    permits: Arc<Semaphore>,
    call_timeout: Duration,
}

impl ToolRegistry {
    pub fn new(permits: Arc<Semaphore>) -> Self {
        Self {
            tools: HashMap::new(),
            permits,
            call_timeout: TOOL_CALL_TIMEOUT,
        }
    }

    /// Shared permit pool for all registries in the process.
    pub fn shared_permits() -> Arc<Semaphore> {
        Arc::new(Semaphore::new(TOOL_POOL_SIZE))
    }

    #[cfg(test)]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn register(&mut self, definition: ToolDefinition, handler: ToolHandler) {
        self.tools.insert(definition.name.clone(), RegisteredTool {
            definition,
            handler,
        });
    }

    /// JSON-schema listing suitable for handing to the LLM.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> =
            self.tools.values().map(|t| t.definition.clone()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Invoke a tool by name, returning a structured JSON result.
    ///
    /// Never fails: unknown tools, handler errors, and timeouts all come
    /// back as error-shaped results for the LLM to recover from.
    pub async fn invoke(&self, name: &str, arguments: Value) -> Value {
        let Some(tool) = self.tools.get(name) else {
            return json!({
                "error": "unknown_tool",
                "message": format!("No tool named '{}' is registered", name),
            });
        };

        let _permit = match self.permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                return json!({
                    "error": "pool_closed",
                    "message": "Tool worker pool is shut down",
                })
            }
        };

        let call = (tool.handler)(arguments);
        let result = match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!("tool '{}' timed out after {:?}", name, self.call_timeout);
                return json!({
                    "error": "timeout",
                    "message": format!("Tool '{}' did not complete in time", name),
                });
            }
        };

        if result.success {
            let raw = result.output.unwrap_or_default();
            // Pass JSON outputs through structurally so the frontend can
            // pretty-print them.
            serde_json::from_str(&raw).unwrap_or(Value::String(raw))
        } else {
            json!({
                "error": "tool_failed",
                "message": result.error.unwrap_or_else(|| "unknown failure".to_string()),
            })
        }
    }
}

/// Wrap a synchronous tool function into a handler.
pub fn sync_handler<F>(f: F) -> ToolHandler
where
    F: Fn(Value) -> ToolResult + Send + Sync + 'static,
{
    let f = Arc::new(f);
    Arc::new(move |args| {
        let f = Arc::clone(&f);
        Box::pin(async move { f(args) })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::llm::ParameterSchema;

    fn echo_definition(name: &str) -> ToolDefinition {
        ToolDefinition {
            name: name.to_string(),
            description: "echo".to_string(),
            input_schema: ParameterSchema::object(None, HashMap::new(), vec![]),
        }
    }

    #[tokio::test]
    async fn test_invoke_returns_structured_output() {
        let mut registry = ToolRegistry::new(ToolRegistry::shared_permits());
        registry.register(
            echo_definition("echo"),
            sync_handler(|args| ToolResult::ok(json!({"echo": args}).to_string())),
        );

        let result = registry.invoke("echo", json!({"x": 1})).await;
        assert_eq!(result["echo"]["x"], 1);
    }

    #[tokio::test]
    async fn test_unknown_tool_is_structured_error() {
        let registry = ToolRegistry::new(ToolRegistry::shared_permits());
        let result = registry.invoke("nope", json!({})).await;
        assert_eq!(result["error"], "unknown_tool");
    }

    #[tokio::test]
    async fn test_failure_is_structured_error() {
        let mut registry = ToolRegistry::new(ToolRegistry::shared_permits());
        registry.register(
            echo_definition("boom"),
            sync_handler(|_| ToolResult::err("backend unavailable")),
        );
        let result = registry.invoke("boom", json!({})).await;
        assert_eq!(result["error"], "tool_failed");
        assert_eq!(result["message"], "backend unavailable");
    }

    #[tokio::test]
    async fn test_timeout_is_structured_error() {
        let mut registry =
            ToolRegistry::new(ToolRegistry::shared_permits()).with_timeout(Duration::from_millis(10));
        registry.register(
            echo_definition("slow"),
            Arc::new(|_| {
                Box::pin(async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    ToolResult::ok("too late")
                })
            }),
        );
        let result = registry.invoke("slow", json!({})).await;
        assert_eq!(result["error"], "timeout");
    }

    #[tokio::test]
    async fn test_definitions_sorted_by_name() {
        let mut registry = ToolRegistry::new(ToolRegistry::shared_permits());
        registry.register(echo_definition("b"), sync_handler(|_| ToolResult::ok("")));
        registry.register(echo_definition("a"), sync_handler(|_| ToolResult::ok("")));
        let names: Vec<String> = registry.definitions().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
