//! Memory record types for sliding-window conversation summarization.

use serde::{Deserialize, Serialize};

use super::conversation::StoredMessage;

/// Lifecycle of a memory record.
///
/// At most one `Processing` record may exist per conversation at any time;
/// the insert path enforces this with an existence check inside a
/// transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryStatus {
    Processing,
    Completed,
    Failed,
}

impl MemoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryStatus::Processing => "processing",
            MemoryStatus::Completed => "completed",
            MemoryStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "processing" => Some(MemoryStatus::Processing),
            "completed" => Some(MemoryStatus::Completed),
            "failed" => Some(MemoryStatus::Failed),
            _ => None,
        }
    }
}

/// A summarized, versioned abstract of a contiguous message window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub memory_id: i64,
    pub conversation_id: String,
    /// Empty only while status is `processing`
    pub memory_text: String,
    /// First message covered; always even (never splits a round)
    pub start_sequence: u32,
    /// Last message covered; always odd
    pub end_sequence: u32,
    /// Prior completed record whose summary this one extends
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_memory_id: Option<i64>,
    pub status: MemoryStatus,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_time_ms: Option<i64>,
}

/// Context prepared for workflow execution: the latest completed summary
/// plus the messages it does not yet cover.
#[derive(Debug, Clone, Default)]
pub struct ConversationContext {
    /// Summarized older context, if a completed memory exists
    pub memory_text: Option<String>,
    /// Messages after the memory window, excluding the current user message
    pub gap_messages: Vec<StoredMessage>,
}
