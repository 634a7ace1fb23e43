//! Service Configuration
//!
//! Environment-driven settings with defaults suitable for local development.

use std::env;

use crate::utils::error::{AppError, AppResult};

/// Chat history durable backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatHistoryMode {
    /// Embedded SQLite database
    Local,
    /// PostgreSQL server
    Postgres,
}

impl ChatHistoryMode {
    fn parse(value: &str) -> AppResult<Self> {
        match value {
            "local" => Ok(Self::Local),
            "postgres" => Ok(Self::Postgres),
            other => Err(AppError::config(format!(
                "Unsupported CHAT_HISTORY_MODE '{}' (expected 'local' or 'postgres')",
                other
            ))),
        }
    }
}

/// Application settings loaded from environment variables
#[derive(Debug, Clone)]
pub struct Settings {
    /// HTTP bind host
    pub host: String,
    /// HTTP bind port
    pub port: u16,

    /// Durable storage backend
    pub chat_history_mode: ChatHistoryMode,
    /// SQLite database path (local mode)
    pub database_path: String,
    /// PostgreSQL connection settings (postgres mode)
    pub postgres_host: String,
    pub postgres_port: u16,
    pub postgres_user: String,
    pub postgres_password: String,
    pub postgres_database: String,
    /// Days of conversation history surfaced in listings
    pub conversation_history_days: i64,
    /// Cache TTL in seconds
    pub cache_ttl_seconds: u64,

    /// Use the dynamic (plan/review) workflow by default
    pub dynamic_plan: bool,
    /// Whether the UI renders tool results in the thinking flyout
    pub show_func_result: bool,

    /// Default chat model
    pub default_model: String,
    /// Chat completions endpoint (OpenAI-compatible)
    pub llm_endpoint: String,
    /// API key for the chat completions endpoint
    pub llm_api_key: String,

    /// Sliding-window size for memory summarization (messages)
    pub memory_rolling_window: u32,
    /// Minimum end sequence before summarization starts
    pub memory_summarize_after_seq: u32,
    /// Model used for memory summarization
    pub memory_model: String,
    /// Memory feature default (overridable per request)
    pub memory_enabled: bool,
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> AppResult<T> {
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| AppError::config(format!("Invalid value for {}: '{}'", key, raw))),
        Err(_) => Ok(default),
    }
}

fn env_bool(key: &str, default: bool) -> AppResult<bool> {
    match env::var(key) {
        Ok(raw) => match raw.to_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            other => Err(AppError::config(format!(
                "Invalid boolean for {}: '{}'",
                key, other
            ))),
        },
        Err(_) => Ok(default),
    }
}

impl Settings {
    /// Load settings from the process environment.
    ///
    /// Fails with a configuration error when a selected mode is missing its
    /// required settings, so startup fails fast instead of at first request.
    pub fn from_env() -> AppResult<Self> {
        let chat_history_mode = ChatHistoryMode::parse(&env_or("CHAT_HISTORY_MODE", "local"))?;

        let settings = Self {
            host: env_or("HOST", "127.0.0.1"),
            port: env_parse("PORT", 8080)?,
            chat_history_mode,
            database_path: env_or("DATABASE_PATH", "opschat.db"),
            postgres_host: env_or("POSTGRES_HOST", ""),
            postgres_port: env_parse("POSTGRES_PORT", 5432)?,
            postgres_user: env_or("POSTGRES_USER", "pgadmin"),
            postgres_password: env_or("POSTGRES_PASSWORD", ""),
            postgres_database: env_or("POSTGRES_DATABASE", "chat_history"),
            conversation_history_days: env_parse("CONVERSATION_HISTORY_DAYS", 7)?,
            cache_ttl_seconds: env_parse("CACHE_TTL_SECONDS", 1800)?,
            dynamic_plan: env_bool("DYNAMIC_PLAN", false)?,
            show_func_result: env_bool("SHOW_FUNC_RESULT", true)?,
            default_model: env_or("DEFAULT_MODEL", "gpt-4.1"),
            llm_endpoint: env_or("LLM_ENDPOINT", "https://api.openai.com/v1"),
            llm_api_key: env_or("LLM_API_KEY", ""),
            memory_rolling_window: env_parse("MEMORY_ROLLING_WINDOW", 14)?,
            memory_summarize_after_seq: env_parse("MEMORY_SUMMARIZE_AFTER_SEQ", 5)?,
            memory_model: env_or("MEMORY_MODEL", "gpt-4.1-mini"),
            memory_enabled: env_bool("MEMORY_ENABLED", true)?,
        };

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> AppResult<()> {
        if self.chat_history_mode == ChatHistoryMode::Postgres && self.postgres_host.is_empty() {
            return Err(AppError::config(
                "CHAT_HISTORY_MODE=postgres requires POSTGRES_HOST",
            ));
        }
        if self.memory_rolling_window == 0 || self.memory_rolling_window % 2 != 0 {
            return Err(AppError::config(
                "MEMORY_ROLLING_WINDOW must be a positive even number",
            ));
        }
        Ok(())
    }

    /// PostgreSQL connection config for deadpool.
    pub fn postgres_config(&self) -> deadpool_postgres::Config {
        let mut cfg = deadpool_postgres::Config::new();
        cfg.host = Some(self.postgres_host.clone());
        cfg.port = Some(self.postgres_port);
        cfg.user = Some(self.postgres_user.clone());
        cfg.password = Some(self.postgres_password.clone());
        cfg.dbname = Some(self.postgres_database.clone());
        cfg
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            chat_history_mode: ChatHistoryMode::Local,
            database_path: ":memory:".into(),
            postgres_host: String::new(),
            postgres_port: 5432,
            postgres_user: String::new(),
            postgres_password: String::new(),
            postgres_database: String::new(),
            conversation_history_days: 7,
            cache_ttl_seconds: 1800,
            dynamic_plan: false,
            show_func_result: true,
            default_model: "gpt-4.1".into(),
            llm_endpoint: "http://localhost:0".into(),
            llm_api_key: "test-key".into(),
            memory_rolling_window: 14,
            memory_summarize_after_seq: 5,
            memory_model: "gpt-4.1-mini".into(),
            memory_enabled: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parse() {
        assert_eq!(
            ChatHistoryMode::parse("local").unwrap(),
            ChatHistoryMode::Local
        );
        assert_eq!(
            ChatHistoryMode::parse("postgres").unwrap(),
            ChatHistoryMode::Postgres
        );
        assert!(ChatHistoryMode::parse("redis").is_err());
    }

    #[test]
    fn test_validate_rejects_odd_window() {
        let mut settings = Settings::for_tests();
        settings.memory_rolling_window = 13;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validate_postgres_requires_host() {
        let mut settings = Settings::for_tests();
        settings.chat_history_mode = ChatHistoryMode::Postgres;
        assert!(settings.validate().is_err());
        settings.postgres_host = "db.example.com".into();
        assert!(settings.validate().is_ok());
    }
}
