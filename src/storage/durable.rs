//! Durable backend trait
//!
//! The record of truth behind the write-through store. Two implementations:
//! embedded SQLite (local mode) and PostgreSQL.

use async_trait::async_trait;

use crate::models::{Conversation, ConversationMeta, MemoryRecord};
use crate::utils::error::AppResult;

#[async_trait]
pub trait DurableBackend: Send + Sync {
    /// List conversation metadata for a user within the history window,
    /// newest `last_modified` first. Message lists are not loaded.
    async fn list_conversations(
        &self,
        user_id: &str,
        days: i64,
    ) -> AppResult<Vec<ConversationMeta>>;

    /// Load one conversation with its full message sequence.
    async fn get_conversation(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> AppResult<Option<Conversation>>;

    /// Persist a conversation atomically: metadata upsert plus a
    /// transactional delete-then-insert of the whole message sequence,
    /// constrained by `UNIQUE(conversation_id, sequence_number)`.
    async fn save_conversation(&self, conversation: &Conversation) -> AppResult<()>;

    /// Delete a conversation; messages and memory cascade.
    async fn delete_conversation(&self, conversation_id: &str, user_id: &str) -> AppResult<()>;

    /// Set or clear the satisfaction flag and comment on one message.
    async fn set_evaluation(
        &self,
        conversation_id: &str,
        sequence_number: u32,
        is_satisfy: Option<bool>,
        comment: Option<String>,
    ) -> AppResult<()>;

    // ── Memory table ────────────────────────────────────────────────────

    /// Latest completed memory record (highest end_sequence).
    async fn latest_completed_memory(
        &self,
        conversation_id: &str,
    ) -> AppResult<Option<MemoryRecord>>;

    async fn memory_by_id(&self, memory_id: i64) -> AppResult<Option<MemoryRecord>>;

    /// Insert a `processing` record, guarded by an existence check inside
    /// the same transaction: returns `None` (no insert) when the
    /// conversation already has a processing record.
    async fn insert_processing_memory(
        &self,
        conversation_id: &str,
        start_sequence: u32,
        end_sequence: u32,
        base_memory_id: Option<i64>,
    ) -> AppResult<Option<i64>>;

    /// Transition a processing record to `completed` with its summary.
    async fn complete_memory(
        &self,
        memory_id: i64,
        memory_text: &str,
        generation_time_ms: i64,
    ) -> AppResult<()>;

    /// Transition a processing record to `failed`.
    async fn fail_memory(&self, memory_id: i64) -> AppResult<()>;
}
