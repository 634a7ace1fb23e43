//! Memory Service
//!
//! Sliding-window conversation summarization. At the end of each round the
//! service decides whether to compress older turns into a rolling summary;
//! the summarization itself runs as a background task serialized per
//! conversation by the single-`processing`-record invariant enforced in
//! the database.

use std::sync::Arc;
use std::time::Instant;

use crate::models::{ConversationContext, MemoryRecord, StoredMessage};
use crate::services::agents::create_memory_agent;
use crate::services::llm::{ChatMessage, ClientProvider};
use crate::services::workflow::schemas::MemorySummaryOutput;
use crate::storage::DurableBackend;
use crate::utils::error::AppResult;

#[derive(Clone)]
pub struct MemoryService {
    backend: Arc<dyn DurableBackend>,
    provider: Arc<dyn ClientProvider>,
    memory_model: String,
    rolling_window_size: u32,
    summarize_after_seq: u32,
}

impl MemoryService {
    pub fn new(
        backend: Arc<dyn DurableBackend>,
        provider: Arc<dyn ClientProvider>,
        memory_model: impl Into<String>,
        rolling_window_size: u32,
        summarize_after_seq: u32,
    ) -> Self {
        Self {
            backend,
            provider,
            memory_model: memory_model.into(),
            rolling_window_size,
            summarize_after_seq,
        }
    }

    /// Sliding window for a round ending at `last_saved_seq`: the start is
    /// aligned up to an even sequence so user/assistant pairs never split.
    fn summary_range(&self, last_saved_seq: u32) -> (u32, u32) {
        let end = last_saved_seq;
        let mut start = end.saturating_sub(self.rolling_window_size - 1);
        if start % 2 != 0 {
            start += 1;
        }
        (start, end)
    }

    /// Read contract, called at the start of each round with the current
    /// message list (the just-posted user message last).
    ///
    /// Degrades gracefully: with no completed memory yet, all prior
    /// messages are returned as the gap.
    pub async fn context_for_workflow(
        &self,
        conversation_id: &str,
        messages: &[StoredMessage],
    ) -> ConversationContext {
        let latest = match self.backend.latest_completed_memory(conversation_id).await {
            Ok(latest) => latest,
            Err(err) => {
                tracing::warn!("memory read failed for {}: {}", conversation_id, err);
                None
            }
        };

        // The last message is the current user message; it is appended by
        // the caller, not part of the context.
        let prior = messages.len().saturating_sub(1);

        match latest {
            Some(memory) => {
                let gap_start = (memory.end_sequence + 1) as usize;
                let gap_messages = if gap_start < prior {
                    messages[gap_start..prior].to_vec()
                } else {
                    Vec::new()
                };
                ConversationContext {
                    memory_text: Some(memory.memory_text),
                    gap_messages,
                }
            }
            None => ConversationContext {
                memory_text: None,
                gap_messages: messages[..prior].to_vec(),
            },
        }
    }

    /// Trigger contract, called at the end of each round with the
    /// assistant message's sequence number. Returns the new memory id when
    /// a summarization was started.
    pub async fn trigger_summarization(
        &self,
        conversation_id: &str,
        last_saved_seq: u32,
        messages: Vec<StoredMessage>,
    ) -> AppResult<Option<i64>> {
        if last_saved_seq < self.summarize_after_seq {
            tracing::debug!(
                "not enough messages to summarize {}: seq {} < threshold {}",
                conversation_id,
                last_saved_seq,
                self.summarize_after_seq
            );
            return Ok(None);
        }

        let (start, end) = self.summary_range(last_saved_seq);
        let base = self.backend.latest_completed_memory(conversation_id).await?;

        if start > 0 {
            tracing::info!(
                "sliding window: dropping seq 0-{} for {}",
                start - 1,
                conversation_id
            );
        }

        // The existence check inside this insert's transaction is the
        // per-conversation serialization point.
        let Some(memory_id) = self
            .backend
            .insert_processing_memory(conversation_id, start, end, base.as_ref().map(|b| b.memory_id))
            .await?
        else {
            tracing::debug!("summarization already in progress for {}", conversation_id);
            return Ok(None);
        };

        let service = self.clone();
        let conversation_id = conversation_id.to_string();
        // Detached on purpose: summarization survives client disconnects.
        tokio::spawn(async move {
            service
                .run_summarization(memory_id, conversation_id, start, end, base, messages)
                .await;
        });

        Ok(Some(memory_id))
    }

    async fn run_summarization(
        &self,
        memory_id: i64,
        conversation_id: String,
        start: u32,
        end: u32,
        base: Option<MemoryRecord>,
        messages: Vec<StoredMessage>,
    ) {
        let started = Instant::now();
        match self
            .summarize(&conversation_id, start, end, base.as_ref(), &messages)
            .await
        {
            Ok(summary) if !summary.is_empty() => {
                let elapsed = started.elapsed().as_millis() as i64;
                if let Err(err) = self
                    .backend
                    .complete_memory(memory_id, &summary, elapsed)
                    .await
                {
                    tracing::error!("failed to store memory for {}: {}", conversation_id, err);
                    return;
                }
                tracing::info!(
                    "summarized messages {}-{} for {} in {}ms",
                    start,
                    end,
                    conversation_id,
                    elapsed
                );
            }
            Ok(_) => {
                tracing::warn!("empty memory generated for {}", conversation_id);
                let _ = self.backend.fail_memory(memory_id).await;
            }
            Err(err) => {
                tracing::error!("failed to summarize {}: {}", conversation_id, err);
                let _ = self.backend.fail_memory(memory_id).await;
            }
        }
    }

    async fn summarize(
        &self,
        conversation_id: &str,
        start: u32,
        end: u32,
        base: Option<&MemoryRecord>,
        messages: &[StoredMessage],
    ) -> AppResult<String> {
        // Incremental path: only the messages after the base window are
        // fed to the model alongside the previous summary.
        let new_start = base.map(|b| b.end_sequence + 1).unwrap_or(start);
        let new_messages: Vec<&StoredMessage> = messages
            .iter()
            .filter(|m| m.sequence_number >= new_start && m.sequence_number <= end)
            .collect();

        if new_messages.is_empty() {
            tracing::debug!("no new messages to summarize for {}", conversation_id);
            return Ok(String::new());
        }

        let conversation_text = new_messages
            .iter()
            .map(|m| format!("{}: {}", capitalize(m.role.as_str()), m.content))
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = match base {
            Some(base) => format!(
                "Previous summary:\n{}\n\nNew messages to incorporate:\n{}\n\n\
Merge the new information into the summary. Drop content that only concerns \
messages before sequence {}.",
                base.memory_text, conversation_text, start
            ),
            None => format!(
                "Conversation messages:\n{}\n\nExtract key information from this conversation.",
                conversation_text
            ),
        };

        let agent = create_memory_agent(&self.provider, &self.memory_model)?;
        let response = agent.run(vec![ChatMessage::user(prompt)]).await?;
        let output: MemorySummaryOutput = serde_json::from_str(response.text.trim())
            .map_err(|e| crate::utils::error::AppError::SchemaViolation(format!("memory output: {}", e)))?;
        Ok(output.summary.trim().to_string())
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
