//! History cache
//!
//! In-process TTL cache in front of the durable store. Metadata is cached
//! per user+conversation, message lists per conversation, mirroring the
//! `conv:meta:{user}:{id}` / `conv:msgs:{id}` keyspace.

use std::time::Duration;

use mini_moka::sync::Cache;

use crate::models::{ConversationMeta, StoredMessage};

/// Cached entries per kind; generous for one node
const CACHE_CAPACITY: u64 = 10_000;

pub struct HistoryCache {
    meta: Cache<String, ConversationMeta>,
    messages: Cache<String, Vec<StoredMessage>>,
}

fn meta_key(user_id: &str, conversation_id: &str) -> String {
    format!("conv:meta:{}:{}", user_id, conversation_id)
}

fn msgs_key(conversation_id: &str) -> String {
    format!("conv:msgs:{}", conversation_id)
}

impl HistoryCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            meta: Cache::builder()
                .max_capacity(CACHE_CAPACITY)
                .time_to_live(ttl)
                .build(),
            messages: Cache::builder()
                .max_capacity(CACHE_CAPACITY)
                .time_to_live(ttl)
                .build(),
        }
    }

    pub fn get_meta(&self, user_id: &str, conversation_id: &str) -> Option<ConversationMeta> {
        self.meta.get(&meta_key(user_id, conversation_id))
    }

    pub fn set_meta(&self, meta: &ConversationMeta) {
        self.meta
            .insert(meta_key(&meta.user_id, &meta.conversation_id), meta.clone());
    }

    pub fn get_messages(&self, conversation_id: &str) -> Option<Vec<StoredMessage>> {
        self.messages.get(&msgs_key(conversation_id))
    }

    pub fn set_messages(&self, conversation_id: &str, messages: &[StoredMessage]) {
        self.messages
            .insert(msgs_key(conversation_id), messages.to_vec());
    }

    /// Drop both entries for a conversation.
    pub fn invalidate(&self, user_id: &str, conversation_id: &str) {
        self.meta.invalidate(&meta_key(user_id, conversation_id));
        self.messages.invalidate(&msgs_key(conversation_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessageRole;

    #[test]
    fn test_round_trip_and_invalidate() {
        let cache = HistoryCache::new(Duration::from_secs(1800));
        let meta = ConversationMeta::new("user-1", "gpt-4.1");
        let messages = vec![StoredMessage::new(0, MessageRole::User, "hi")];

        cache.set_meta(&meta);
        cache.set_messages(&meta.conversation_id, &messages);

        assert_eq!(
            cache.get_meta("user-1", &meta.conversation_id).unwrap(),
            meta
        );
        assert_eq!(
            cache.get_messages(&meta.conversation_id).unwrap(),
            messages
        );

        cache.invalidate("user-1", &meta.conversation_id);
        assert!(cache.get_meta("user-1", &meta.conversation_id).is_none());
        assert!(cache.get_messages(&meta.conversation_id).is_none());
    }

    #[test]
    fn test_meta_is_user_scoped() {
        let cache = HistoryCache::new(Duration::from_secs(1800));
        let meta = ConversationMeta::new("user-1", "gpt-4.1");
        cache.set_meta(&meta);
        assert!(cache.get_meta("user-2", &meta.conversation_id).is_none());
    }
}
