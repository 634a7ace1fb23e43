//! Data model types shared across services and the HTTP layer.

pub mod conversation;
pub mod events;
pub mod memory;

pub use conversation::{Conversation, ConversationMeta, MessageRole, StoredMessage};
pub use events::Event;
pub use memory::{ConversationContext, MemoryRecord, MemoryStatus};
