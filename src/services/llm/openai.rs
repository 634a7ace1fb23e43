//! OpenAI-Compatible Chat Client
//!
//! Implementation of the ChatClient trait over an OpenAI-compatible
//! chat-completions endpoint. Supports buffered and streamed completions,
//! tool calling, and schema-constrained JSON output.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::provider::{ChatClient, LLM_CALL_TIMEOUT};
use super::registry::ResolvedModelConfig;
use super::types::{
    ChatMessage, ChatRequest, ChatResponse, ChatRole, StreamUpdate, ToolCall, Usage,
};
use crate::utils::error::{AppError, AppResult};

/// OpenAI-compatible chat client bound to one resolved deployment
pub struct OpenAiCompatClient {
    config: ResolvedModelConfig,
    client: reqwest::Client,
}

impl OpenAiCompatClient {
    pub fn new(config: ResolvedModelConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.config.endpoint.trim_end_matches('/'))
    }

    /// Build the request body for the API
    fn build_request_body(&self, request: &ChatRequest, stream: bool) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .map(|m| self.message_to_wire(m))
            .collect();

        let mut body = serde_json::json!({
            "model": self.config.deployment_name,
            "messages": messages,
            "stream": stream,
        });

        if !request.tools.is_empty() {
            let tools: Vec<serde_json::Value> = request
                .tools
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.input_schema,
                        }
                    })
                })
                .collect();
            body["tools"] = serde_json::json!(tools);
        }

        if let Some(schema) = &request.response_schema {
            body["response_format"] = serde_json::json!({
                "type": "json_schema",
                "json_schema": {
                    "name": "response",
                    "schema": schema,
                    "strict": true,
                }
            });
        }

        if stream {
            body["stream_options"] = serde_json::json!({ "include_usage": true });
        }

        body
    }

    fn message_to_wire(&self, message: &ChatMessage) -> serde_json::Value {
        let role = match message.role {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
            ChatRole::Tool => "tool",
        };

        if let Some(tool_call_id) = &message.tool_call_id {
            return serde_json::json!({
                "role": role,
                "tool_call_id": tool_call_id,
                "content": message.content,
            });
        }

        if !message.tool_calls.is_empty() {
            let tool_calls: Vec<serde_json::Value> = message
                .tool_calls
                .iter()
                .map(|tc| {
                    serde_json::json!({
                        "id": tc.id,
                        "type": "function",
                        "function": {
                            "name": tc.name,
                            "arguments": tc.arguments.to_string(),
                        }
                    })
                })
                .collect();
            let mut wire = serde_json::json!({
                "role": role,
                "tool_calls": tool_calls,
            });
            if !message.content.is_empty() {
                wire["content"] = serde_json::json!(message.content);
            }
            return wire;
        }

        serde_json::json!({
            "role": role,
            "content": message.content,
        })
    }

    async fn post(&self, body: &serde_json::Value) -> AppResult<reqwest::Response> {
        let response = self
            .client
            .post(self.completions_url())
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| AppError::transient(format!("llm request failed: {}", e)))?;

        let status = response.status().as_u16();
        if status == 200 {
            return Ok(response);
        }

        let body_text = response.text().await.unwrap_or_default();
        Err(classify_http_error(status, &body_text))
    }

    fn parse_response(&self, response: ApiResponse) -> ChatResponse {
        let mut text = String::new();
        let mut tool_calls = Vec::new();

        if let Some(choice) = response.choices.into_iter().next() {
            if let Some(message) = choice.message {
                if let Some(content) = message.content {
                    text = content;
                }
                for tc in message.tool_calls.unwrap_or_default() {
                    let arguments = serde_json::from_str(&tc.function.arguments)
                        .unwrap_or(serde_json::Value::Null);
                    tool_calls.push(ToolCall {
                        id: tc.id,
                        name: tc.function.name,
                        arguments,
                    });
                }
            }
        }

        ChatResponse {
            text,
            usage: response
                .usage
                .map(|u| Usage::new(u.prompt_tokens, u.completion_tokens))
                .unwrap_or_default(),
            tool_calls,
            model: self.config.deployment_name.clone(),
        }
    }
}

/// Map HTTP status codes onto the service error taxonomy.
fn classify_http_error(status: u16, body: &str) -> AppError {
    match status {
        401 | 403 => AppError::permanent(format!("llm auth failed ({}): {}", status, body)),
        429 => AppError::transient(format!("llm rate limited: {}", body)),
        500..=599 => AppError::transient(format!("llm server error ({}): {}", status, body)),
        _ => AppError::permanent(format!("llm request rejected ({}): {}", status, body)),
    }
}

#[async_trait]
impl ChatClient for OpenAiCompatClient {
    fn model(&self) -> &str {
        &self.config.deployment_name
    }

    async fn complete(&self, request: ChatRequest) -> AppResult<ChatResponse> {
        let body = self.build_request_body(&request, false);

        let response = tokio::time::timeout(LLM_CALL_TIMEOUT, self.post(&body))
            .await
            .map_err(|_| AppError::Timeout("llm completion".into()))??;

        let body_text = response
            .text()
            .await
            .map_err(|e| AppError::transient(format!("llm response read failed: {}", e)))?;

        let api_response: ApiResponse = serde_json::from_str(&body_text).map_err(|e| {
            AppError::transient(format!("failed to parse llm response: {}", e))
        })?;

        Ok(self.parse_response(api_response))
    }

    async fn complete_stream(
        &self,
        request: ChatRequest,
        tx: mpsc::Sender<StreamUpdate>,
        cancel: CancellationToken,
    ) -> AppResult<ChatResponse> {
        let body = self.build_request_body(&request, true);

        let response = tokio::time::timeout(LLM_CALL_TIMEOUT, self.post(&body))
            .await
            .map_err(|_| AppError::Timeout("llm stream start".into()))??;

        let mut accumulated = String::new();
        let mut usage = Usage::default();
        let mut buffer = String::new();
        let mut stream = response.bytes_stream();

        loop {
            let chunk = tokio::select! {
                // Dropping the byte stream aborts the HTTP request, which
                // stops token production upstream.
                _ = cancel.cancelled() => {
                    tracing::debug!("llm stream cancelled for '{}'", request.agent);
                    return Err(AppError::Timeout("llm stream cancelled".into()));
                }
                next = stream.next() => match next {
                    Some(chunk) => chunk
                        .map_err(|e| AppError::transient(format!("llm stream failed: {}", e)))?,
                    None => break,
                },
            };

            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(line_end) = buffer.find('\n') {
                let line = buffer[..line_end].trim().to_string();
                buffer = buffer[line_end + 1..].to_string();

                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                if data == "[DONE]" {
                    continue;
                }

                let chunk: ApiStreamChunk = match serde_json::from_str(data) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        tracing::warn!("skipping malformed stream chunk: {}", e);
                        continue;
                    }
                };

                if let Some(u) = chunk.usage {
                    usage = Usage::new(u.prompt_tokens, u.completion_tokens);
                    let _ = tx
                        .send(StreamUpdate::Usage {
                            input_tokens: u.prompt_tokens,
                            output_tokens: u.completion_tokens,
                        })
                        .await;
                }

                for choice in chunk.choices {
                    if let Some(content) = choice.delta.content {
                        if !content.is_empty() {
                            accumulated.push_str(&content);
                            let _ = tx
                                .send(StreamUpdate::TextDelta { content })
                                .await;
                        }
                    }
                }
            }
        }

        let _ = tx.send(StreamUpdate::Complete).await;

        Ok(ChatResponse {
            text: accumulated,
            usage,
            tool_calls: Vec::new(),
            model: self.config.deployment_name.clone(),
        })
    }
}

// ── Wire types ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: Option<ApiMessage>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ApiToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ApiToolCall {
    id: String,
    function: ApiFunction,
}

#[derive(Debug, Deserialize)]
struct ApiFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ApiStreamChunk {
    #[serde(default)]
    choices: Vec<ApiStreamChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiStreamChoice {
    delta: ApiDelta,
}

#[derive(Debug, Deserialize)]
struct ApiDelta {
    content: Option<String>,
}
