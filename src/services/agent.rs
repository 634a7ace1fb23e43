//! Agent
//!
//! A configured LLM unit: name, system prompt, optional structured-output
//! schema, optional tool set, and a resolved model client. Exposes buffered
//! (`run`) and streaming (`run_stream`) entrypoints, both wrapped by the
//! observability middleware.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::services::llm::{
    complete_structured, with_transient_retry, ChatClient, ChatMessage, ChatRequest,
    StreamUpdate, ToolCall, Usage,
};
use crate::services::middleware;
use crate::services::tools::ToolRegistry;
use crate::utils::error::{AppError, AppResult};

/// Default budget of tool calls per agent run
pub const DEFAULT_TOOL_CALL_BUDGET: u32 = 8;

/// Static configuration of an agent
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub name: String,
    pub instructions: String,
    /// When set, the agent's final text must be JSON conforming to this schema
    pub response_schema: Option<Value>,
    /// Orchestration agents attach their structured output to agent_finished
    pub orchestration: bool,
    pub max_tool_calls: u32,
}

impl AgentConfig {
    pub fn new(name: impl Into<String>, instructions: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instructions: instructions.into(),
            response_schema: None,
            orchestration: false,
            max_tool_calls: DEFAULT_TOOL_CALL_BUDGET,
        }
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.response_schema = Some(schema);
        self
    }

    pub fn orchestration(mut self) -> Self {
        self.orchestration = true;
        self
    }
}

/// Buffered result of an agent run
#[derive(Debug, Clone)]
pub struct AgentResponse {
    pub text: String,
    pub usage: Usage,
    /// All tool calls executed during the run, in order
    pub tool_calls: Vec<ToolCall>,
}

/// A runnable agent bound to a chat client and optional tools
pub struct Agent {
    config: AgentConfig,
    client: Arc<dyn ChatClient>,
    tools: Option<Arc<ToolRegistry>>,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        client: Arc<dyn ChatClient>,
        tools: Option<Arc<ToolRegistry>>,
    ) -> Self {
        Self {
            config,
            client,
            tools,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn model(&self) -> &str {
        self.client.model()
    }

    fn base_messages(&self, input: Vec<ChatMessage>) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(input.len() + 1);
        messages.push(ChatMessage::system(self.config.instructions.clone()));
        messages.extend(input);
        messages
    }

    /// Structured output for agent_finished: the parsed JSON when the text
    /// is JSON, the raw text otherwise.
    fn trace_output(&self, text: &str) -> Option<Value> {
        if !self.config.orchestration {
            return None;
        }
        Some(
            serde_json::from_str(text.trim())
                .unwrap_or_else(|_| Value::String(text.to_string())),
        )
    }

    /// Buffered run with tool-call loop.
    pub async fn run(&self, input: Vec<ChatMessage>) -> AppResult<AgentResponse> {
        let started = Instant::now();
        middleware::agent_invoked(&self.config.name).await;

        let response = self.run_inner(input).await?;

        middleware::agent_finished(
            &self.config.name,
            self.client.model(),
            Some(response.usage),
            started.elapsed().as_millis() as u64,
            self.trace_output(&response.text),
        )
        .await;
        Ok(response)
    }

    async fn run_inner(&self, input: Vec<ChatMessage>) -> AppResult<AgentResponse> {
        let messages = self.base_messages(input);

        let Some(tools) = &self.tools else {
            return self.run_without_tools(messages).await;
        };
        self.run_tool_loop(Arc::clone(tools), messages).await
    }

    async fn run_without_tools(&self, messages: Vec<ChatMessage>) -> AppResult<AgentResponse> {
        let mut request = ChatRequest::new(&self.config.name, messages);

        if let Some(schema) = &self.config.response_schema {
            request = request.with_schema(schema.clone());
            let (_, response) = complete_structured(self.client.as_ref(), request).await?;
            return Ok(AgentResponse {
                text: response.text,
                usage: response.usage,
                tool_calls: Vec::new(),
            });
        }

        let response =
            with_transient_retry("agent completion", || self.client.complete(request.clone()))
                .await?;
        Ok(AgentResponse {
            text: response.text,
            usage: response.usage,
            tool_calls: Vec::new(),
        })
    }

    async fn run_tool_loop(
        &self,
        tools: Arc<ToolRegistry>,
        mut messages: Vec<ChatMessage>,
    ) -> AppResult<AgentResponse> {
        let definitions = tools.definitions();
        let mut total_usage = Usage::default();
        let mut executed_calls: Vec<ToolCall> = Vec::new();

        loop {
            let request = ChatRequest::new(&self.config.name, messages.clone())
                .with_tools(definitions.clone());
            let response = with_transient_retry("agent tool-loop completion", || {
                self.client.complete(request.clone())
            })
            .await?;
            total_usage.add(response.usage);

            if response.tool_calls.is_empty() {
                return Ok(AgentResponse {
                    text: response.text,
                    usage: total_usage,
                    tool_calls: executed_calls,
                });
            }

            if executed_calls.len() + response.tool_calls.len()
                > self.config.max_tool_calls as usize
            {
                return Err(AppError::ToolLoopExhausted(self.config.max_tool_calls));
            }

            messages.push(ChatMessage::assistant_tool_calls(
                response.text.clone(),
                response.tool_calls.clone(),
            ));

            for call in response.tool_calls {
                middleware::function_start(&call.name, &call.arguments).await;
                let result = tools.invoke(&call.name, call.arguments.clone()).await;
                middleware::function_end(&call.name, &result).await;

                messages.push(ChatMessage::tool_result(
                    call.id.clone(),
                    result.to_string(),
                ));
                executed_calls.push(call);
            }
        }
    }

    /// Streaming run. Tool phases run buffered; the text phase streams
    /// token deltas on `updates`. Returns the buffered response recovered
    /// from the completed stream (concatenated deltas, terminal usage).
    pub async fn run_stream(
        &self,
        input: Vec<ChatMessage>,
        updates: mpsc::Sender<StreamUpdate>,
        cancel: CancellationToken,
    ) -> AppResult<AgentResponse> {
        let started = Instant::now();
        middleware::agent_invoked(&self.config.name).await;

        let response = match &self.tools {
            None => {
                let messages = self.base_messages(input);
                let mut request = ChatRequest::new(&self.config.name, messages);
                if let Some(schema) = &self.config.response_schema {
                    request = request.with_schema(schema.clone());
                }
                let response = self
                    .client
                    .complete_stream(request, updates, cancel)
                    .await?;
                AgentResponse {
                    text: response.text,
                    usage: response.usage,
                    tool_calls: Vec::new(),
                }
            }
            Some(_) => {
                // Tool-bound agents resolve their tool loop buffered; the
                // final text is forwarded as a single delta.
                let response = self.run_inner(input).await?;
                if !response.text.is_empty() {
                    let _ = updates
                        .send(StreamUpdate::TextDelta {
                            content: response.text.clone(),
                        })
                        .await;
                }
                let _ = updates.send(StreamUpdate::Complete).await;
                response
            }
        };

        middleware::agent_finished(
            &self.config.name,
            self.client.model(),
            Some(response.usage),
            started.elapsed().as_millis() as u64,
            self.trace_output(&response.text),
        )
        .await;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::bus::{with_bus, EventBus};
    use crate::services::llm::{ChatResponse, ParameterSchema, ToolDefinition};
    use crate::services::tools::{sync_handler, ToolResult};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Chat client replaying a fixed sequence of responses.
    struct ScriptedClient {
        replies: Mutex<Vec<ChatResponse>>,
    }

    impl ScriptedClient {
        fn new(replies: Vec<ChatResponse>) -> Self {
            Self {
                replies: Mutex::new(replies),
            }
        }

        fn reply(text: &str, tool_calls: Vec<ToolCall>) -> ChatResponse {
            ChatResponse {
                text: text.to_string(),
                usage: Usage::new(10, 5),
                tool_calls,
                model: "gpt-4.1".to_string(),
            }
        }
    }

    #[async_trait]
    impl ChatClient for ScriptedClient {
        fn model(&self) -> &str {
            "gpt-4.1"
        }

        async fn complete(&self, _request: ChatRequest) -> AppResult<ChatResponse> {
            let mut replies = self.replies.lock().unwrap();
            if replies.is_empty() {
                return Err(AppError::internal("script exhausted"));
            }
            Ok(replies.remove(0))
        }

        async fn complete_stream(
            &self,
            request: ChatRequest,
            tx: mpsc::Sender<StreamUpdate>,
            _cancel: CancellationToken,
        ) -> AppResult<ChatResponse> {
            let response = self.complete(request).await?;
            for chunk in response.text.split_inclusive(' ') {
                let _ = tx
                    .send(StreamUpdate::TextDelta {
                        content: chunk.to_string(),
                    })
                    .await;
            }
            let _ = tx.send(StreamUpdate::Complete).await;
            Ok(response)
        }
    }

    fn incident_tools() -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::new(ToolRegistry::shared_permits());
        registry.register(
            ToolDefinition {
                name: "get_incident".into(),
                description: "Fetch incident".into(),
                input_schema: ParameterSchema::object(None, HashMap::new(), vec![]),
            },
            sync_handler(|args| ToolResult::ok(json!({"number": args["incident_id"]}).to_string())),
        );
        Arc::new(registry)
    }

    #[tokio::test]
    async fn test_tool_loop_executes_and_terminates() {
        let client = Arc::new(ScriptedClient::new(vec![
            ScriptedClient::reply(
                "",
                vec![ToolCall {
                    id: "call_1".into(),
                    name: "get_incident".into(),
                    arguments: json!({"incident_id": "INC123"}),
                }],
            ),
            ScriptedClient::reply("INC123 is in progress.", vec![]),
        ]));
        let agent = Agent::new(
            AgentConfig::new("servicenow-agent", "You are a ServiceNow assistant."),
            client,
            Some(incident_tools()),
        );

        let response = agent.run(vec![ChatMessage::user("Check INC123")]).await.unwrap();
        assert_eq!(response.text, "INC123 is in progress.");
        assert_eq!(response.tool_calls.len(), 1);
        // Usage accumulated across both completions.
        assert_eq!(response.usage.input_tokens, 20);
    }

    #[tokio::test]
    async fn test_tool_budget_exhaustion() {
        let call = ToolCall {
            id: "call".into(),
            name: "get_incident".into(),
            arguments: json!({"incident_id": "INC123"}),
        };
        // Every reply proposes another call; the budget must trip.
        let replies: Vec<ChatResponse> = (0..16)
            .map(|_| ScriptedClient::reply("", vec![call.clone()]))
            .collect();
        let mut config = AgentConfig::new("looping-agent", "loop forever");
        config.max_tool_calls = 3;
        let agent = Agent::new(config, Arc::new(ScriptedClient::new(replies)), Some(incident_tools()));

        let err = agent.run(vec![ChatMessage::user("go")]).await.unwrap_err();
        assert!(matches!(err, AppError::ToolLoopExhausted(3)));
    }

    #[tokio::test]
    async fn test_middleware_events_surround_tool_calls() {
        let client = Arc::new(ScriptedClient::new(vec![
            ScriptedClient::reply(
                "",
                vec![ToolCall {
                    id: "call_1".into(),
                    name: "get_incident".into(),
                    arguments: json!({"incident_id": "INC123"}),
                }],
            ),
            ScriptedClient::reply("done", vec![]),
        ]));
        let agent = Agent::new(
            AgentConfig::new("servicenow-agent", "instructions"),
            client,
            Some(incident_tools()),
        );

        let (bus, mut rx) = EventBus::new();
        with_bus(bus, async {
            agent.run(vec![ChatMessage::user("Check INC123")]).await.unwrap();
        })
        .await;

        let mut kinds = Vec::new();
        while let Ok(event) = tokio::time::timeout(
            std::time::Duration::from_millis(100),
            rx.recv(),
        )
        .await
        {
            match event {
                Some(e) => kinds.push(serde_json::to_value(&e).unwrap()["type"]
                    .as_str()
                    .unwrap()
                    .to_string()),
                None => break,
            }
        }
        assert_eq!(
            kinds,
            vec!["agent_invoked", "function_start", "function_end", "agent_finished"]
        );
    }

    #[tokio::test]
    async fn test_stream_concatenation_matches_buffered_text() {
        let client = Arc::new(ScriptedClient::new(vec![ScriptedClient::reply(
            "the final streamed answer",
            vec![],
        )]));
        let agent = Agent::new(
            AgentConfig::new("summary-agent", "Summarize.").orchestration(),
            client,
            None,
        );

        let (tx, mut rx) = mpsc::channel(64);
        let response = agent
            .run_stream(
                vec![ChatMessage::user("summarize")],
                tx,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let mut streamed = String::new();
        while let Some(update) = rx.recv().await {
            if let StreamUpdate::TextDelta { content } = update {
                streamed.push_str(&content);
            }
        }
        assert_eq!(streamed, response.text);
    }
}
