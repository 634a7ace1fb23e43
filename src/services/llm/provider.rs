//! Chat Client Trait
//!
//! Defines the common interface for chat completion backends plus the
//! retry and structured-output helpers applied at this boundary.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::types::{ChatRequest, ChatResponse, StreamUpdate};
use crate::utils::error::{AppError, AppResult};

/// Per-LLM-call timeout
pub const LLM_CALL_TIMEOUT: Duration = Duration::from_secs(120);

/// Retry attempts for transient failures and schema violations
const MAX_ATTEMPTS: u32 = 3;

/// Trait implemented by chat completion backends.
///
/// Streaming uses a channel sender for updates and returns the buffered
/// response after the stream ends, so the terminal usage and concatenated
/// text are always recoverable from a completed stream.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Model name this client resolves to
    fn model(&self) -> &str;

    /// Buffered completion
    async fn complete(&self, request: ChatRequest) -> AppResult<ChatResponse>;

    /// Streaming completion. Text deltas are sent on `tx`; firing `cancel`
    /// stops further token production.
    async fn complete_stream(
        &self,
        request: ChatRequest,
        tx: mpsc::Sender<StreamUpdate>,
        cancel: CancellationToken,
    ) -> AppResult<ChatResponse>;
}

/// Resolve credentials and construct a [`ChatClient`] for a model name.
///
/// Production uses the model registry; tests substitute scripted clients.
pub trait ClientProvider: Send + Sync {
    fn client_for(&self, model: &str) -> AppResult<Arc<dyn ChatClient>>;
}

/// Run `f` with exponential backoff on retriable errors, up to 3 attempts.
pub async fn with_transient_retry<T, F, Fut>(operation: &str, mut f: F) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    let mut delay = Duration::from_millis(250);
    let mut attempt = 1;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retriable() && attempt < MAX_ATTEMPTS => {
                tracing::warn!(
                    "{} failed (attempt {}/{}), retrying in {:?}: {}",
                    operation,
                    attempt,
                    MAX_ATTEMPTS,
                    delay,
                    err
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Buffered completion constrained to a JSON schema.
///
/// Parse failures are retried up to 3 times before surfacing as
/// `SchemaViolation`. Transient transport failures inside each attempt are
/// handled separately by [`with_transient_retry`].
pub async fn complete_structured(
    client: &dyn ChatClient,
    request: ChatRequest,
) -> AppResult<(Value, ChatResponse)> {
    let mut last_error = String::new();
    for attempt in 1..=MAX_ATTEMPTS {
        let response =
            with_transient_retry("llm completion", || client.complete(request.clone())).await?;

        match parse_against_schema(&response.text, request.response_schema.as_ref()) {
            Ok(value) => return Ok((value, response)),
            Err(reason) => {
                tracing::warn!(
                    "structured output for '{}' failed validation (attempt {}/{}): {}",
                    request.agent,
                    attempt,
                    MAX_ATTEMPTS,
                    reason
                );
                last_error = reason;
            }
        }
    }
    Err(AppError::SchemaViolation(format!(
        "agent '{}': {}",
        request.agent, last_error
    )))
}

/// Parse text as JSON and check the schema's required top-level fields.
fn parse_against_schema(text: &str, schema: Option<&Value>) -> Result<Value, String> {
    let value: Value = serde_json::from_str(text.trim())
        .map_err(|e| format!("response is not valid JSON: {}", e))?;

    if let Some(schema) = schema {
        if let Some(required) = schema.get("required").and_then(Value::as_array) {
            for field in required.iter().filter_map(Value::as_str) {
                if value.get(field).is_none() {
                    return Err(format!("missing required field '{}'", field));
                }
            }
        }
    }
    Ok(value)
}
