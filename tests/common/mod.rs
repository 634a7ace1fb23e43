//! Shared test support: a scripted chat client routed by agent name.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use opschat::services::llm::{
    ChatClient, ChatRequest, ChatResponse, ClientProvider, StreamUpdate, ToolCall, Usage,
};
use opschat::{AppError, AppResult};

/// Chat client that replays scripted responses per agent name. All agents
/// share one instance (the provider hands it out for every model), and the
/// request's agent field selects the script.
pub struct RoutedClient {
    scripts: Mutex<HashMap<String, VecDeque<ChatResponse>>>,
    calls: Mutex<Vec<String>>,
    /// When set, streamed responses trickle out slowly and honor
    /// cancellation, for disconnect tests.
    slow_stream: std::sync::atomic::AtomicBool,
}

impl RoutedClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            slow_stream: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub fn set_slow_stream(&self) {
        self.slow_stream
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    /// Queue a reply for an agent; replies pop in FIFO order per agent.
    pub fn script(&self, agent: &str, response: ChatResponse) {
        self.scripts
            .lock()
            .unwrap()
            .entry(agent.to_string())
            .or_default()
            .push_back(response);
    }

    /// Agent names in completion order (parallel agents interleave).
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count_calls(&self, agent: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == agent).count()
    }

    pub fn text(text: &str) -> ChatResponse {
        ChatResponse {
            text: text.to_string(),
            usage: Usage::new(20, 10),
            tool_calls: Vec::new(),
            model: "gpt-4.1".to_string(),
        }
    }

    pub fn json(value: Value) -> ChatResponse {
        Self::text(&value.to_string())
    }

    pub fn tool_call(name: &str, arguments: Value) -> ChatResponse {
        ChatResponse {
            text: String::new(),
            usage: Usage::new(20, 10),
            tool_calls: vec![ToolCall {
                id: format!("call_{}", name),
                name: name.to_string(),
                arguments,
            }],
            model: "gpt-4.1".to_string(),
        }
    }
}

#[async_trait]
impl ChatClient for RoutedClient {
    fn model(&self) -> &str {
        "gpt-4.1"
    }

    async fn complete(&self, request: ChatRequest) -> AppResult<ChatResponse> {
        self.calls.lock().unwrap().push(request.agent.clone());
        let mut scripts = self.scripts.lock().unwrap();
        scripts
            .get_mut(&request.agent)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| {
                AppError::internal(format!("no scripted reply for agent '{}'", request.agent))
            })
    }

    async fn complete_stream(
        &self,
        request: ChatRequest,
        tx: mpsc::Sender<StreamUpdate>,
        cancel: CancellationToken,
    ) -> AppResult<ChatResponse> {
        let response = self.complete(request).await?;
        let slow = self.slow_stream.load(std::sync::atomic::Ordering::SeqCst);

        for chunk in response.text.split_inclusive(' ') {
            if slow {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(AppError::Timeout("llm stream cancelled".into()));
                    }
                    _ = tokio::time::sleep(Duration::from_millis(25)) => {}
                }
            }
            let _ = tx
                .send(StreamUpdate::TextDelta {
                    content: chunk.to_string(),
                })
                .await;
        }
        let _ = tx
            .send(StreamUpdate::Usage {
                input_tokens: response.usage.input_tokens,
                output_tokens: response.usage.output_tokens,
            })
            .await;
        let _ = tx.send(StreamUpdate::Complete).await;
        Ok(response)
    }
}

/// Provider returning the shared routed client for every model.
pub struct MockProvider {
    client: Arc<RoutedClient>,
}

impl MockProvider {
    pub fn new(client: Arc<RoutedClient>) -> Arc<dyn ClientProvider> {
        Arc::new(Self { client })
    }
}

impl ClientProvider for MockProvider {
    fn client_for(&self, _model: &str) -> AppResult<Arc<dyn ChatClient>> {
        Ok(Arc::clone(&self.client) as Arc<dyn ChatClient>)
    }
}
