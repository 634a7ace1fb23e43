//! Request-scoped event types delivered to clients over SSE.
//!
//! Every event is a tagged record; the tag doubles as the JSON `type`
//! field on the wire. Events are grouped into SSE event names by
//! [`Event::sse_event_name`]: user/assistant payloads arrive as `message`
//! events, lifecycle records as `thinking`, incremental text as `stream`,
//! and the terminator as `done`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::services::llm::Usage;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Echo of the saved user message
    #[serde(rename = "user")]
    UserMessage { content: String, seq: u32, time: String },

    /// An agent began execution
    AgentInvoked { agent: String },

    /// An agent finished; orchestration agents additionally carry their
    /// structured output so the UI can render decision traces
    AgentFinished {
        agent: String,
        model: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
        execution_time_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
    },

    /// A tool call was dispatched
    FunctionStart { function: String, arguments: Value },

    /// A tool call completed (errors arrive as error-shaped results)
    FunctionEnd { function: String, result: Value },

    /// Incremental text chunk from a user-visible streaming executor
    Stream {
        executor_id: String,
        text: String,
        seq: u64,
    },

    /// The final answer, already persisted when this event is delivered
    #[serde(rename = "assistant")]
    AssistantMessage {
        content: String,
        seq: u32,
        time: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },

    /// Terminator sentinel
    Done,
}

impl Event {
    /// SSE event name this record is delivered under.
    pub fn sse_event_name(&self) -> &'static str {
        match self {
            Event::UserMessage { .. } | Event::AssistantMessage { .. } => "message",
            Event::AgentInvoked { .. }
            | Event::AgentFinished { .. }
            | Event::FunctionStart { .. }
            | Event::FunctionEnd { .. } => "thinking",
            Event::Stream { .. } => "stream",
            Event::Done => "done",
        }
    }
}
