//! SQLite durable backend
//!
//! Embedded database for local mode using rusqlite with r2d2 connection
//! pooling. All pool work runs on the blocking thread pool so async
//! callers never stall an executor thread.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};

use super::durable::DurableBackend;
use crate::models::{
    Conversation, ConversationMeta, MemoryRecord, MemoryStatus, MessageRole, StoredMessage,
};
use crate::utils::error::{AppError, AppResult};

/// Type alias for the connection pool
pub type DbPool = Pool<SqliteConnectionManager>;

pub struct SqliteBackend {
    pool: DbPool,
}

impl SqliteBackend {
    /// Open (or create) the database at `path` and initialize the schema.
    pub fn new(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let manager = SqliteConnectionManager::file(path)
            .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;"));
        let pool = Pool::builder()
            .max_size(10)
            .build(manager)
            .map_err(|e| AppError::database(format!("Failed to create connection pool: {}", e)))?;

        let backend = Self { pool };
        backend.init_schema()?;
        Ok(backend)
    }

    fn init_schema(&self) -> AppResult<()> {
        let conn = self
            .pool
            .get()
            .map_err(|e| AppError::database(format!("Failed to get connection: {}", e)))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS conversations (
                conversation_id TEXT PRIMARY KEY,
                user_client_id TEXT NOT NULL,
                title TEXT NOT NULL,
                model TEXT NOT NULL,
                agent_level_llm_overwrite TEXT,
                created_at TEXT NOT NULL,
                last_modified TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_conversations_user_modified
                ON conversations(user_client_id, last_modified DESC);
            CREATE INDEX IF NOT EXISTS idx_conversations_user_created
                ON conversations(user_client_id, created_at DESC);

            CREATE TABLE IF NOT EXISTS messages (
                message_id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id TEXT NOT NULL
                    REFERENCES conversations(conversation_id) ON DELETE CASCADE,
                sequence_number INTEGER NOT NULL,
                role TEXT NOT NULL CHECK (role IN ('user', 'assistant')),
                content TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                is_satisfy INTEGER,
                comment TEXT,
                UNIQUE (conversation_id, sequence_number)
            );
            CREATE INDEX IF NOT EXISTS idx_messages_conversation_seq
                ON messages(conversation_id, sequence_number ASC);

            CREATE TABLE IF NOT EXISTS memory (
                memory_id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id TEXT NOT NULL
                    REFERENCES conversations(conversation_id) ON DELETE CASCADE,
                memory_text TEXT NOT NULL DEFAULT '',
                start_sequence INTEGER NOT NULL,
                end_sequence INTEGER NOT NULL,
                base_memory_id INTEGER REFERENCES memory(memory_id),
                status TEXT NOT NULL CHECK (status IN ('processing', 'completed', 'failed')),
                created_at TEXT NOT NULL,
                generation_time_ms INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_memory_conv_status_end
                ON memory(conversation_id, status, end_sequence DESC);
            CREATE UNIQUE INDEX IF NOT EXISTS uniq_memory_completed_window
                ON memory(conversation_id, end_sequence) WHERE status = 'completed';",
        )?;
        Ok(())
    }

    /// Run `f` with a pooled connection on the blocking thread pool.
    async fn with_conn<T, F>(&self, f: F) -> AppResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> AppResult<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| AppError::database(format!("Failed to get connection: {}", e)))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| AppError::internal(format!("blocking task panicked: {}", e)))?
    }
}

fn meta_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationMeta> {
    let overrides_json: Option<String> = row.get("agent_level_llm_overwrite")?;
    let agent_level_llm_overwrite = overrides_json
        .as_deref()
        .and_then(|raw| serde_json::from_str::<HashMap<String, String>>(raw).ok());
    Ok(ConversationMeta {
        conversation_id: row.get("conversation_id")?,
        user_id: row.get("user_client_id")?,
        title: row.get("title")?,
        model: row.get("model")?,
        agent_level_llm_overwrite,
        created_at: row.get("created_at")?,
        last_modified: row.get("last_modified")?,
    })
}

fn message_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    let role_raw: String = row.get("role")?;
    Ok(StoredMessage {
        sequence_number: row.get("sequence_number")?,
        role: MessageRole::parse(&role_raw).unwrap_or(MessageRole::User),
        content: row.get("content")?,
        timestamp: row.get("timestamp")?,
        is_satisfy: row.get("is_satisfy")?,
        comment: row.get("comment")?,
    })
}

fn memory_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryRecord> {
    let status_raw: String = row.get("status")?;
    Ok(MemoryRecord {
        memory_id: row.get("memory_id")?,
        conversation_id: row.get("conversation_id")?,
        memory_text: row.get("memory_text")?,
        start_sequence: row.get("start_sequence")?,
        end_sequence: row.get("end_sequence")?,
        base_memory_id: row.get("base_memory_id")?,
        status: MemoryStatus::parse(&status_raw).unwrap_or(MemoryStatus::Failed),
        created_at: row.get("created_at")?,
        generation_time_ms: row.get("generation_time_ms")?,
    })
}

fn history_cutoff(days: i64) -> String {
    (chrono::Utc::now() - chrono::Duration::days(days)).to_rfc3339()
}

#[async_trait]
impl DurableBackend for SqliteBackend {
    async fn list_conversations(
        &self,
        user_id: &str,
        days: i64,
    ) -> AppResult<Vec<ConversationMeta>> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT conversation_id, user_client_id, title, model,
                        agent_level_llm_overwrite, created_at, last_modified
                 FROM conversations
                 WHERE user_client_id = ?1 AND last_modified >= ?2
                 ORDER BY last_modified DESC",
            )?;
            let rows = stmt.query_map(params![user_id, history_cutoff(days)], meta_from_row)?;
            let mut metas = Vec::new();
            for row in rows {
                metas.push(row?);
            }
            Ok(metas)
        })
        .await
    }

    async fn get_conversation(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> AppResult<Option<Conversation>> {
        let conversation_id = conversation_id.to_string();
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            let meta = conn
                .query_row(
                    "SELECT conversation_id, user_client_id, title, model,
                            agent_level_llm_overwrite, created_at, last_modified
                     FROM conversations
                     WHERE conversation_id = ?1 AND user_client_id = ?2",
                    params![conversation_id, user_id],
                    meta_from_row,
                )
                .optional()?;

            let Some(meta) = meta else {
                return Ok(None);
            };

            let mut stmt = conn.prepare(
                "SELECT sequence_number, role, content, timestamp, is_satisfy, comment
                 FROM messages
                 WHERE conversation_id = ?1
                 ORDER BY sequence_number ASC",
            )?;
            let rows = stmt.query_map(params![conversation_id], message_from_row)?;
            let mut messages = Vec::new();
            for row in rows {
                messages.push(row?);
            }

            Ok(Some(Conversation { meta, messages }))
        })
        .await
    }

    async fn save_conversation(&self, conversation: &Conversation) -> AppResult<()> {
        let conversation = conversation.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;

            let overrides_json = conversation
                .meta
                .agent_level_llm_overwrite
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;

            tx.execute(
                "INSERT INTO conversations
                    (conversation_id, user_client_id, title, model,
                     agent_level_llm_overwrite, created_at, last_modified)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(conversation_id) DO UPDATE SET
                    title = excluded.title,
                    model = excluded.model,
                    agent_level_llm_overwrite = excluded.agent_level_llm_overwrite,
                    last_modified = excluded.last_modified",
                params![
                    conversation.meta.conversation_id,
                    conversation.meta.user_id,
                    conversation.meta.title,
                    conversation.meta.model,
                    overrides_json,
                    conversation.meta.created_at,
                    conversation.meta.last_modified,
                ],
            )?;

            tx.execute(
                "DELETE FROM messages WHERE conversation_id = ?1",
                params![conversation.meta.conversation_id],
            )?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO messages
                        (conversation_id, sequence_number, role, content,
                         timestamp, is_satisfy, comment)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )?;
                for message in &conversation.messages {
                    stmt.execute(params![
                        conversation.meta.conversation_id,
                        message.sequence_number,
                        message.role.as_str(),
                        message.content,
                        message.timestamp,
                        message.is_satisfy,
                        message.comment,
                    ])?;
                }
            }

            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn delete_conversation(&self, conversation_id: &str, user_id: &str) -> AppResult<()> {
        let conversation_id = conversation_id.to_string();
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM conversations
                 WHERE conversation_id = ?1 AND user_client_id = ?2",
                params![conversation_id, user_id],
            )?;
            Ok(())
        })
        .await
    }

    async fn set_evaluation(
        &self,
        conversation_id: &str,
        sequence_number: u32,
        is_satisfy: Option<bool>,
        comment: Option<String>,
    ) -> AppResult<()> {
        let conversation_id = conversation_id.to_string();
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE messages SET is_satisfy = ?1, comment = ?2
                 WHERE conversation_id = ?3 AND sequence_number = ?4",
                params![is_satisfy, comment, conversation_id, sequence_number],
            )?;
            if updated == 0 {
                return Err(AppError::not_found(format!(
                    "message {} in conversation {}",
                    sequence_number, conversation_id
                )));
            }
            Ok(())
        })
        .await
    }

    async fn latest_completed_memory(
        &self,
        conversation_id: &str,
    ) -> AppResult<Option<MemoryRecord>> {
        let conversation_id = conversation_id.to_string();
        self.with_conn(move |conn| {
            let record = conn
                .query_row(
                    "SELECT memory_id, conversation_id, memory_text, start_sequence,
                            end_sequence, base_memory_id, status, created_at, generation_time_ms
                     FROM memory
                     WHERE conversation_id = ?1 AND status = 'completed'
                     ORDER BY end_sequence DESC
                     LIMIT 1",
                    params![conversation_id],
                    memory_from_row,
                )
                .optional()?;
            Ok(record)
        })
        .await
    }

    async fn memory_by_id(&self, memory_id: i64) -> AppResult<Option<MemoryRecord>> {
        self.with_conn(move |conn| {
            let record = conn
                .query_row(
                    "SELECT memory_id, conversation_id, memory_text, start_sequence,
                            end_sequence, base_memory_id, status, created_at, generation_time_ms
                     FROM memory
                     WHERE memory_id = ?1",
                    params![memory_id],
                    memory_from_row,
                )
                .optional()?;
            Ok(record)
        })
        .await
    }

    async fn insert_processing_memory(
        &self,
        conversation_id: &str,
        start_sequence: u32,
        end_sequence: u32,
        base_memory_id: Option<i64>,
    ) -> AppResult<Option<i64>> {
        let conversation_id = conversation_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;

            let processing_exists: bool = tx.query_row(
                "SELECT EXISTS(
                    SELECT 1 FROM memory
                    WHERE conversation_id = ?1 AND status = 'processing')",
                params![conversation_id],
                |row| row.get(0),
            )?;
            if processing_exists {
                return Ok(None);
            }

            tx.execute(
                "INSERT INTO memory
                    (conversation_id, memory_text, start_sequence, end_sequence,
                     base_memory_id, status, created_at)
                 VALUES (?1, '', ?2, ?3, ?4, 'processing', ?5)",
                params![
                    conversation_id,
                    start_sequence,
                    end_sequence,
                    base_memory_id,
                    crate::utils::now_rfc3339(),
                ],
            )?;
            let memory_id = tx.last_insert_rowid();
            tx.commit()?;
            Ok(Some(memory_id))
        })
        .await
    }

    async fn complete_memory(
        &self,
        memory_id: i64,
        memory_text: &str,
        generation_time_ms: i64,
    ) -> AppResult<()> {
        let memory_text = memory_text.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE memory
                 SET status = 'completed', memory_text = ?1, generation_time_ms = ?2
                 WHERE memory_id = ?3 AND status = 'processing'",
                params![memory_text, generation_time_ms, memory_id],
            )?;
            Ok(())
        })
        .await
    }

    async fn fail_memory(&self, memory_id: i64) -> AppResult<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE memory SET status = 'failed' WHERE memory_id = ?1",
                params![memory_id],
            )?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn backend() -> (SqliteBackend, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let backend = SqliteBackend::new(dir.path().join("test.db")).unwrap();
        (backend, dir)
    }

    fn sample_conversation(user_id: &str) -> Conversation {
        let mut conversation = Conversation::new(ConversationMeta::new(user_id, "gpt-4.1"));
        conversation.append(MessageRole::User, "Check INC123");
        conversation.append(MessageRole::Assistant, "INC123 is in progress.");
        conversation
    }

    #[tokio::test]
    async fn test_save_and_read_round_trip() {
        let (backend, _dir) = backend().await;
        let conversation = sample_conversation("user-1");
        backend.save_conversation(&conversation).await.unwrap();

        let loaded = backend
            .get_conversation(&conversation.meta.conversation_id, "user-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded, conversation);
    }

    #[tokio::test]
    async fn test_save_replaces_message_sequence() {
        let (backend, _dir) = backend().await;
        let mut conversation = sample_conversation("user-1");
        backend.save_conversation(&conversation).await.unwrap();

        conversation.append(MessageRole::User, "And CHG0012345?");
        conversation.append(MessageRole::Assistant, "Approved.");
        backend.save_conversation(&conversation).await.unwrap();

        let loaded = backend
            .get_conversation(&conversation.meta.conversation_id, "user-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.messages.len(), 4);
        let seqs: Vec<u32> = loaded.messages.iter().map(|m| m.sequence_number).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_conversation_scoped_to_user() {
        let (backend, _dir) = backend().await;
        let conversation = sample_conversation("user-1");
        backend.save_conversation(&conversation).await.unwrap();

        let other = backend
            .get_conversation(&conversation.meta.conversation_id, "user-2")
            .await
            .unwrap();
        assert!(other.is_none());
    }

    #[tokio::test]
    async fn test_delete_cascades() {
        let (backend, _dir) = backend().await;
        let conversation = sample_conversation("user-1");
        backend.save_conversation(&conversation).await.unwrap();
        backend
            .insert_processing_memory(&conversation.meta.conversation_id, 0, 1, None)
            .await
            .unwrap()
            .unwrap();

        backend
            .delete_conversation(&conversation.meta.conversation_id, "user-1")
            .await
            .unwrap();
        assert!(backend
            .get_conversation(&conversation.meta.conversation_id, "user-1")
            .await
            .unwrap()
            .is_none());
        assert!(backend
            .latest_completed_memory(&conversation.meta.conversation_id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_evaluation_update() {
        let (backend, _dir) = backend().await;
        let conversation = sample_conversation("user-1");
        backend.save_conversation(&conversation).await.unwrap();

        backend
            .set_evaluation(
                &conversation.meta.conversation_id,
                1,
                Some(true),
                Some("helpful".into()),
            )
            .await
            .unwrap();

        let loaded = backend
            .get_conversation(&conversation.meta.conversation_id, "user-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.messages[1].is_satisfy, Some(true));
        assert_eq!(loaded.messages[1].comment.as_deref(), Some("helpful"));

        let missing = backend
            .set_evaluation(&conversation.meta.conversation_id, 99, None, None)
            .await;
        assert!(matches!(missing, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_single_processing_memory_guard() {
        let (backend, _dir) = backend().await;
        let conversation = sample_conversation("user-1");
        backend.save_conversation(&conversation).await.unwrap();
        let conv_id = &conversation.meta.conversation_id;

        let first = backend
            .insert_processing_memory(conv_id, 0, 5, None)
            .await
            .unwrap();
        assert!(first.is_some());

        // Second insert while the first is processing is refused.
        let second = backend
            .insert_processing_memory(conv_id, 0, 7, None)
            .await
            .unwrap();
        assert!(second.is_none());

        // Completing the first unblocks the next window.
        backend
            .complete_memory(first.unwrap(), "summary text", 120)
            .await
            .unwrap();
        let third = backend
            .insert_processing_memory(conv_id, 2, 7, first)
            .await
            .unwrap();
        assert!(third.is_some());

        let latest = backend
            .latest_completed_memory(conv_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.memory_text, "summary text");
        assert_eq!(latest.end_sequence, 5);
        assert_eq!(latest.status, MemoryStatus::Completed);
    }

    #[tokio::test]
    async fn test_failed_memory_not_surfaced() {
        let (backend, _dir) = backend().await;
        let conversation = sample_conversation("user-1");
        backend.save_conversation(&conversation).await.unwrap();
        let conv_id = &conversation.meta.conversation_id;

        let id = backend
            .insert_processing_memory(conv_id, 0, 5, None)
            .await
            .unwrap()
            .unwrap();
        backend.fail_memory(id).await.unwrap();

        assert!(backend.latest_completed_memory(conv_id).await.unwrap().is_none());
        let record = backend.memory_by_id(id).await.unwrap().unwrap();
        assert_eq!(record.status, MemoryStatus::Failed);
    }

    #[tokio::test]
    async fn test_list_orders_by_last_modified() {
        let (backend, _dir) = backend().await;
        let older = sample_conversation("user-1");
        backend.save_conversation(&older).await.unwrap();

        let mut newer = sample_conversation("user-1");
        newer.meta.last_modified = chrono::Utc::now().to_rfc3339();
        backend.save_conversation(&newer).await.unwrap();

        let listed = backend.list_conversations("user-1", 7).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed[0].last_modified >= listed[1].last_modified);
    }
}
