//! PostgreSQL durable backend
//!
//! Server-backed storage for deployments where the service does not own
//! its disk. Uses deadpool-postgres for pooling; schema mirrors the SQLite
//! backend.

use async_trait::async_trait;
use deadpool_postgres::{Pool, Runtime};
use tokio_postgres::NoTls;

use super::durable::DurableBackend;
use crate::config::Settings;
use crate::models::{
    Conversation, ConversationMeta, MemoryRecord, MemoryStatus, MessageRole, StoredMessage,
};
use crate::utils::error::{AppError, AppResult};

pub struct PostgresBackend {
    pool: Pool,
}

fn pg_err(e: impl std::fmt::Display) -> AppError {
    AppError::database(format!("postgres: {}", e))
}

impl PostgresBackend {
    /// Connect and initialize the schema.
    pub async fn new(settings: &Settings) -> AppResult<Self> {
        let pool = settings
            .postgres_config()
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| AppError::permanent(format!("postgres pool: {}", e)))?;

        let backend = Self { pool };
        backend.init_schema().await?;
        Ok(backend)
    }

    async fn init_schema(&self) -> AppResult<()> {
        let client = self.pool.get().await.map_err(pg_err)?;
        client
            .batch_execute(
                "CREATE TABLE IF NOT EXISTS conversations (
                    conversation_id TEXT PRIMARY KEY,
                    user_client_id TEXT NOT NULL,
                    title TEXT NOT NULL,
                    model TEXT NOT NULL,
                    agent_level_llm_overwrite JSONB,
                    created_at TEXT NOT NULL,
                    last_modified TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_conversations_user_modified
                    ON conversations(user_client_id, last_modified DESC);
                CREATE INDEX IF NOT EXISTS idx_conversations_user_created
                    ON conversations(user_client_id, created_at DESC);

                CREATE TABLE IF NOT EXISTS messages (
                    message_id BIGSERIAL PRIMARY KEY,
                    conversation_id TEXT NOT NULL
                        REFERENCES conversations(conversation_id) ON DELETE CASCADE,
                    sequence_number INTEGER NOT NULL,
                    role TEXT NOT NULL CHECK (role IN ('user', 'assistant')),
                    content TEXT NOT NULL,
                    timestamp TEXT NOT NULL,
                    is_satisfy BOOLEAN,
                    comment TEXT,
                    UNIQUE (conversation_id, sequence_number)
                );
                CREATE INDEX IF NOT EXISTS idx_messages_conversation_seq
                    ON messages(conversation_id, sequence_number ASC);

                CREATE TABLE IF NOT EXISTS memory (
                    memory_id BIGSERIAL PRIMARY KEY,
                    conversation_id TEXT NOT NULL
                        REFERENCES conversations(conversation_id) ON DELETE CASCADE,
                    memory_text TEXT NOT NULL DEFAULT '',
                    start_sequence INTEGER NOT NULL,
                    end_sequence INTEGER NOT NULL,
                    base_memory_id BIGINT REFERENCES memory(memory_id),
                    status TEXT NOT NULL CHECK (status IN ('processing', 'completed', 'failed')),
                    created_at TEXT NOT NULL,
                    generation_time_ms BIGINT
                );
                CREATE INDEX IF NOT EXISTS idx_memory_conv_status_end
                    ON memory(conversation_id, status, end_sequence DESC);
                CREATE UNIQUE INDEX IF NOT EXISTS uniq_memory_completed_window
                    ON memory(conversation_id, end_sequence) WHERE status = 'completed';",
            )
            .await
            .map_err(pg_err)?;
        Ok(())
    }
}

fn meta_from_row(row: &tokio_postgres::Row) -> ConversationMeta {
    let overrides: Option<serde_json::Value> = row.get("agent_level_llm_overwrite");
    ConversationMeta {
        conversation_id: row.get("conversation_id"),
        user_id: row.get("user_client_id"),
        title: row.get("title"),
        model: row.get("model"),
        agent_level_llm_overwrite: overrides.and_then(|v| serde_json::from_value(v).ok()),
        created_at: row.get("created_at"),
        last_modified: row.get("last_modified"),
    }
}

fn message_from_row(row: &tokio_postgres::Row) -> StoredMessage {
    let role_raw: String = row.get("role");
    let sequence: i32 = row.get("sequence_number");
    StoredMessage {
        sequence_number: sequence as u32,
        role: MessageRole::parse(&role_raw).unwrap_or(MessageRole::User),
        content: row.get("content"),
        timestamp: row.get("timestamp"),
        is_satisfy: row.get("is_satisfy"),
        comment: row.get("comment"),
    }
}

fn memory_from_row(row: &tokio_postgres::Row) -> MemoryRecord {
    let status_raw: String = row.get("status");
    let start: i32 = row.get("start_sequence");
    let end: i32 = row.get("end_sequence");
    MemoryRecord {
        memory_id: row.get("memory_id"),
        conversation_id: row.get("conversation_id"),
        memory_text: row.get("memory_text"),
        start_sequence: start as u32,
        end_sequence: end as u32,
        base_memory_id: row.get("base_memory_id"),
        status: MemoryStatus::parse(&status_raw).unwrap_or(MemoryStatus::Failed),
        created_at: row.get("created_at"),
        generation_time_ms: row.get("generation_time_ms"),
    }
}

#[async_trait]
impl DurableBackend for PostgresBackend {
    async fn list_conversations(
        &self,
        user_id: &str,
        days: i64,
    ) -> AppResult<Vec<ConversationMeta>> {
        let client = self.pool.get().await.map_err(pg_err)?;
        let cutoff = (chrono::Utc::now() - chrono::Duration::days(days)).to_rfc3339();
        let rows = client
            .query(
                "SELECT conversation_id, user_client_id, title, model,
                        agent_level_llm_overwrite, created_at, last_modified
                 FROM conversations
                 WHERE user_client_id = $1 AND last_modified >= $2
                 ORDER BY last_modified DESC",
                &[&user_id, &cutoff],
            )
            .await
            .map_err(pg_err)?;
        Ok(rows.iter().map(meta_from_row).collect())
    }

    async fn get_conversation(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> AppResult<Option<Conversation>> {
        let client = self.pool.get().await.map_err(pg_err)?;
        let row = client
            .query_opt(
                "SELECT conversation_id, user_client_id, title, model,
                        agent_level_llm_overwrite, created_at, last_modified
                 FROM conversations
                 WHERE conversation_id = $1 AND user_client_id = $2",
                &[&conversation_id, &user_id],
            )
            .await
            .map_err(pg_err)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let meta = meta_from_row(&row);

        let rows = client
            .query(
                "SELECT sequence_number, role, content, timestamp, is_satisfy, comment
                 FROM messages
                 WHERE conversation_id = $1
                 ORDER BY sequence_number ASC",
                &[&conversation_id],
            )
            .await
            .map_err(pg_err)?;

        Ok(Some(Conversation {
            meta,
            messages: rows.iter().map(message_from_row).collect(),
        }))
    }

    async fn save_conversation(&self, conversation: &Conversation) -> AppResult<()> {
        let mut client = self.pool.get().await.map_err(pg_err)?;
        let tx = client.transaction().await.map_err(pg_err)?;

        let overrides = conversation
            .meta
            .agent_level_llm_overwrite
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;

        tx.execute(
            "INSERT INTO conversations
                (conversation_id, user_client_id, title, model,
                 agent_level_llm_overwrite, created_at, last_modified)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (conversation_id) DO UPDATE SET
                title = EXCLUDED.title,
                model = EXCLUDED.model,
                agent_level_llm_overwrite = EXCLUDED.agent_level_llm_overwrite,
                last_modified = EXCLUDED.last_modified",
            &[
                &conversation.meta.conversation_id,
                &conversation.meta.user_id,
                &conversation.meta.title,
                &conversation.meta.model,
                &overrides,
                &conversation.meta.created_at,
                &conversation.meta.last_modified,
            ],
        )
        .await
        .map_err(pg_err)?;

        tx.execute(
            "DELETE FROM messages WHERE conversation_id = $1",
            &[&conversation.meta.conversation_id],
        )
        .await
        .map_err(pg_err)?;

        let insert = tx
            .prepare(
                "INSERT INTO messages
                    (conversation_id, sequence_number, role, content,
                     timestamp, is_satisfy, comment)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .await
            .map_err(pg_err)?;
        for message in &conversation.messages {
            tx.execute(
                &insert,
                &[
                    &conversation.meta.conversation_id,
                    &(message.sequence_number as i32),
                    &message.role.as_str(),
                    &message.content,
                    &message.timestamp,
                    &message.is_satisfy,
                    &message.comment,
                ],
            )
            .await
            .map_err(pg_err)?;
        }

        tx.commit().await.map_err(pg_err)?;
        Ok(())
    }

    async fn delete_conversation(&self, conversation_id: &str, user_id: &str) -> AppResult<()> {
        let client = self.pool.get().await.map_err(pg_err)?;
        client
            .execute(
                "DELETE FROM conversations
                 WHERE conversation_id = $1 AND user_client_id = $2",
                &[&conversation_id, &user_id],
            )
            .await
            .map_err(pg_err)?;
        Ok(())
    }

    async fn set_evaluation(
        &self,
        conversation_id: &str,
        sequence_number: u32,
        is_satisfy: Option<bool>,
        comment: Option<String>,
    ) -> AppResult<()> {
        let client = self.pool.get().await.map_err(pg_err)?;
        let updated = client
            .execute(
                "UPDATE messages SET is_satisfy = $1, comment = $2
                 WHERE conversation_id = $3 AND sequence_number = $4",
                &[
                    &is_satisfy,
                    &comment,
                    &conversation_id,
                    &(sequence_number as i32),
                ],
            )
            .await
            .map_err(pg_err)?;
        if updated == 0 {
            return Err(AppError::not_found(format!(
                "message {} in conversation {}",
                sequence_number, conversation_id
            )));
        }
        Ok(())
    }

    async fn latest_completed_memory(
        &self,
        conversation_id: &str,
    ) -> AppResult<Option<MemoryRecord>> {
        let client = self.pool.get().await.map_err(pg_err)?;
        let row = client
            .query_opt(
                "SELECT memory_id, conversation_id, memory_text, start_sequence,
                        end_sequence, base_memory_id, status, created_at, generation_time_ms
                 FROM memory
                 WHERE conversation_id = $1 AND status = 'completed'
                 ORDER BY end_sequence DESC
                 LIMIT 1",
                &[&conversation_id],
            )
            .await
            .map_err(pg_err)?;
        Ok(row.as_ref().map(memory_from_row))
    }

    async fn memory_by_id(&self, memory_id: i64) -> AppResult<Option<MemoryRecord>> {
        let client = self.pool.get().await.map_err(pg_err)?;
        let row = client
            .query_opt(
                "SELECT memory_id, conversation_id, memory_text, start_sequence,
                        end_sequence, base_memory_id, status, created_at, generation_time_ms
                 FROM memory
                 WHERE memory_id = $1",
                &[&memory_id],
            )
            .await
            .map_err(pg_err)?;
        Ok(row.as_ref().map(memory_from_row))
    }

    async fn insert_processing_memory(
        &self,
        conversation_id: &str,
        start_sequence: u32,
        end_sequence: u32,
        base_memory_id: Option<i64>,
    ) -> AppResult<Option<i64>> {
        let mut client = self.pool.get().await.map_err(pg_err)?;
        let tx = client.transaction().await.map_err(pg_err)?;

        let exists: bool = tx
            .query_one(
                "SELECT EXISTS(
                    SELECT 1 FROM memory
                    WHERE conversation_id = $1 AND status = 'processing')",
                &[&conversation_id],
            )
            .await
            .map_err(pg_err)?
            .get(0);
        if exists {
            return Ok(None);
        }

        let row = tx
            .query_one(
                "INSERT INTO memory
                    (conversation_id, memory_text, start_sequence, end_sequence,
                     base_memory_id, status, created_at)
                 VALUES ($1, '', $2, $3, $4, 'processing', $5)
                 RETURNING memory_id",
                &[
                    &conversation_id,
                    &(start_sequence as i32),
                    &(end_sequence as i32),
                    &base_memory_id,
                    &crate::utils::now_rfc3339(),
                ],
            )
            .await
            .map_err(pg_err)?;
        let memory_id: i64 = row.get(0);
        tx.commit().await.map_err(pg_err)?;
        Ok(Some(memory_id))
    }

    async fn complete_memory(
        &self,
        memory_id: i64,
        memory_text: &str,
        generation_time_ms: i64,
    ) -> AppResult<()> {
        let client = self.pool.get().await.map_err(pg_err)?;
        client
            .execute(
                "UPDATE memory
                 SET status = 'completed', memory_text = $1, generation_time_ms = $2
                 WHERE memory_id = $3 AND status = 'processing'",
                &[&memory_text, &generation_time_ms, &memory_id],
            )
            .await
            .map_err(pg_err)?;
        Ok(())
    }

    async fn fail_memory(&self, memory_id: i64) -> AppResult<()> {
        let client = self.pool.get().await.map_err(pg_err)?;
        client
            .execute(
                "UPDATE memory SET status = 'failed' WHERE memory_id = $1",
                &[&memory_id],
            )
            .await
            .map_err(pg_err)?;
        Ok(())
    }
}
