//! Observability Middleware
//!
//! Interceptors around agent and tool invocations. Both obtain the event
//! bus from the ambient per-request handle; with no handle set (offline
//! execution, background summarization) they are silent.

use serde_json::Value;

use crate::models::Event;
use crate::services::bus::emit_ambient;
use crate::services::llm::Usage;

/// Emitted before an agent run begins.
pub async fn agent_invoked(agent: &str) {
    emit_ambient(Event::AgentInvoked {
        agent: agent.to_string(),
    })
    .await;
}

/// Emitted after an agent run completes. Orchestration agents (triage,
/// plan, replan, review, clarify, summary) pass their structured output so
/// the UI can render decision traces; worker agents pass `None`.
pub async fn agent_finished(
    agent: &str,
    model: &str,
    usage: Option<Usage>,
    execution_time_ms: u64,
    output: Option<Value>,
) {
    emit_ambient(Event::AgentFinished {
        agent: agent.to_string(),
        model: model.to_string(),
        usage,
        execution_time_ms,
        output,
    })
    .await;
}

/// Emitted before each tool call with its serialized arguments.
pub async fn function_start(function: &str, arguments: &Value) {
    emit_ambient(Event::FunctionStart {
        function: function.to_string(),
        arguments: arguments.clone(),
    })
    .await;
}

/// Emitted after each tool call. Errors still arrive here, as an
/// error-shaped result.
pub async fn function_end(function: &str, result: &Value) {
    emit_ambient(Event::FunctionEnd {
        function: function.to_string(),
        result: result.clone(),
    })
    .await;
}
