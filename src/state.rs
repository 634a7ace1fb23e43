//! Application State
//!
//! Shared service graph built once at startup and handed to every request
//! handler.

use std::sync::Arc;
use std::time::Duration;

use crate::config::{ChatHistoryMode, Settings};
use crate::services::agents::SubAgentRegistry;
use crate::services::llm::{ClientProvider, ModelRegistry};
use crate::services::memory::MemoryService;
use crate::services::orchestrator::MessageOrchestrator;
use crate::services::tools::ToolRegistry;
use crate::storage::{ChatHistoryStore, DurableBackend, PostgresBackend, SqliteBackend};
use crate::utils::error::AppResult;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub settings: Settings,
    pub store: Arc<ChatHistoryStore>,
    pub memory: Arc<MemoryService>,
    pub subagents: Arc<SubAgentRegistry>,
    pub orchestrator: Arc<MessageOrchestrator>,
}

impl AppStateInner {
    /// Wire up storage, model registry, agents, memory, and the
    /// orchestrator from settings.
    pub async fn initialize(settings: Settings) -> AppResult<AppState> {
        let durable: Arc<dyn DurableBackend> = match settings.chat_history_mode {
            ChatHistoryMode::Local => Arc::new(SqliteBackend::new(&settings.database_path)?),
            ChatHistoryMode::Postgres => Arc::new(PostgresBackend::new(&settings).await?),
        };

        let store = Arc::new(ChatHistoryStore::new(
            Arc::clone(&durable),
            Duration::from_secs(settings.cache_ttl_seconds),
            settings.conversation_history_days,
        ));

        let provider: Arc<dyn ClientProvider> =
            Arc::new(ModelRegistry::from_settings(&settings)?);

        let subagents = Arc::new(SubAgentRegistry::default_ops(ToolRegistry::shared_permits()));

        let memory = Arc::new(MemoryService::new(
            durable,
            Arc::clone(&provider),
            settings.memory_model.clone(),
            settings.memory_rolling_window,
            settings.memory_summarize_after_seq,
        ));

        let orchestrator = Arc::new(MessageOrchestrator::new(
            settings.clone(),
            Arc::clone(&store),
            Arc::clone(&memory),
            provider,
            Arc::clone(&subagents),
        ));

        Ok(Arc::new(Self {
            settings,
            store,
            memory,
            subagents,
            orchestrator,
        }))
    }
}
