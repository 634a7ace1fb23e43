//! Conversation and message types
//!
//! The message sequence of a conversation is dense (0..n-1) and alternates
//! user/assistant starting with user: even sequences are user messages, odd
//! sequences are assistant messages. A "round" is the pair (2k, 2k+1).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Role of a stored chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(MessageRole::User),
            "assistant" => Some(MessageRole::Assistant),
            _ => None,
        }
    }

    /// The role a dense sequence number must carry.
    pub fn for_sequence(seq: u32) -> Self {
        if seq % 2 == 0 {
            MessageRole::User
        } else {
            MessageRole::Assistant
        }
    }
}

/// A persisted message within a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Dense position within the conversation, unique per conversation
    pub sequence_number: u32,
    pub role: MessageRole,
    pub content: String,
    /// RFC 3339 timestamp
    pub timestamp: String,
    /// User satisfaction flag set via the evaluation endpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_satisfy: Option<bool>,
    /// Free-text evaluation comment
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl StoredMessage {
    pub fn new(sequence_number: u32, role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            sequence_number,
            role,
            content: content.into(),
            timestamp: crate::utils::now_rfc3339(),
            is_satisfy: None,
            comment: None,
        }
    }
}

/// Conversation metadata (messages loaded separately)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMeta {
    pub conversation_id: String,
    pub user_id: String,
    pub title: String,
    /// Default model for the whole workflow
    pub model: String,
    /// Optional per-agent model overrides (agent key -> model name)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_level_llm_overwrite: Option<HashMap<String, String>>,
    pub created_at: String,
    pub last_modified: String,
}

impl ConversationMeta {
    pub fn new(user_id: impl Into<String>, model: impl Into<String>) -> Self {
        let now = crate::utils::now_rfc3339();
        Self {
            conversation_id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            title: "New chat".to_string(),
            model: model.into(),
            agent_level_llm_overwrite: None,
            created_at: now.clone(),
            last_modified: now,
        }
    }
}

/// A full conversation: metadata plus the dense message sequence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    #[serde(flatten)]
    pub meta: ConversationMeta,
    pub messages: Vec<StoredMessage>,
}

impl Conversation {
    pub fn new(meta: ConversationMeta) -> Self {
        Self {
            meta,
            messages: Vec::new(),
        }
    }

    /// Append a message at the next dense sequence number, returning it.
    pub fn append(&mut self, role: MessageRole, content: impl Into<String>) -> u32 {
        let seq = self.messages.len() as u32;
        self.messages.push(StoredMessage::new(seq, role, content));
        seq
    }
}
