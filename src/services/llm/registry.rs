//! Model Registry
//!
//! Centralized, typed model definitions and credential resolution.
//! Per-request model resolution follows a fixed priority chain:
//! per-agent override for this request, then the workflow-level model,
//! then the process default.

use std::collections::HashMap;
use std::sync::Arc;

use super::openai::OpenAiCompatClient;
use super::provider::{ChatClient, ClientProvider};
use crate::config::Settings;
use crate::utils::error::{AppError, AppResult};

/// Immutable model configuration
#[derive(Debug, Clone, Copy)]
pub struct ModelDefinition {
    pub name: &'static str,
    pub display_name: &'static str,
    pub deployment_name: &'static str,
}

/// Models this deployment exposes
pub const AVAILABLE_MODELS: [ModelDefinition; 2] = [
    ModelDefinition {
        name: "gpt-4.1",
        display_name: "GPT 4.1",
        deployment_name: "gpt-4.1",
    },
    ModelDefinition {
        name: "gpt-4.1-mini",
        display_name: "GPT 4.1 Mini",
        deployment_name: "gpt-4.1-mini",
    },
];

/// Resolved model configuration with API credentials
#[derive(Debug, Clone)]
pub struct ResolvedModelConfig {
    pub deployment_name: String,
    pub endpoint: String,
    pub api_key: String,
}

/// Registry that holds credentials and resolves model configurations.
/// Initialize once at startup and share via the app state.
#[derive(Debug)]
pub struct ModelRegistry {
    endpoint: String,
    api_key: String,
    models: HashMap<&'static str, ModelDefinition>,
}

impl ModelRegistry {
    pub fn from_settings(settings: &Settings) -> AppResult<Self> {
        if settings.llm_api_key.is_empty() {
            return Err(AppError::permanent(
                "LLM_API_KEY is not configured; cannot start",
            ));
        }
        Ok(Self {
            endpoint: settings.llm_endpoint.clone(),
            api_key: settings.llm_api_key.clone(),
            models: AVAILABLE_MODELS.iter().map(|m| (m.name, *m)).collect(),
        })
    }

    /// Resolve a model name to a deployment with credentials.
    pub fn resolve(&self, model_name: &str) -> AppResult<ResolvedModelConfig> {
        let model = self
            .models
            .get(model_name)
            .ok_or_else(|| AppError::validation(format!("Unknown model '{}'", model_name)))?;
        Ok(ResolvedModelConfig {
            deployment_name: model.deployment_name.to_string(),
            endpoint: self.endpoint.clone(),
            api_key: self.api_key.clone(),
        })
    }

    pub fn model_names() -> Vec<&'static str> {
        AVAILABLE_MODELS.iter().map(|m| m.name).collect()
    }

    pub fn is_known_model(name: &str) -> bool {
        AVAILABLE_MODELS.iter().any(|m| m.name == name)
    }
}

impl ClientProvider for ModelRegistry {
    fn client_for(&self, model: &str) -> AppResult<Arc<dyn ChatClient>> {
        let config = self.resolve(model)?;
        Ok(Arc::new(OpenAiCompatClient::new(config)))
    }
}

/// Per-agent model override mapping (agent key -> model name).
pub type AgentModelMapping = HashMap<String, String>;

/// Validate a per-agent mapping against the known agent keys and models.
pub fn validate_agent_mapping(
    mapping: &AgentModelMapping,
    agent_keys: &[String],
) -> AppResult<()> {
    for (agent, model) in mapping {
        if !agent_keys.iter().any(|k| k == agent) {
            return Err(AppError::validation(format!(
                "Unknown agent key '{}' in model mapping",
                agent
            )));
        }
        if !ModelRegistry::is_known_model(model) {
            return Err(AppError::validation(format!(
                "Unknown model '{}' for agent '{}'",
                model, agent
            )));
        }
    }
    Ok(())
}

/// Resolve the model for an agent: per-agent override, then workflow model.
/// The workflow model itself defaults to the process default upstream.
pub fn model_for<'a>(
    agent_key: &str,
    mapping: Option<&'a AgentModelMapping>,
    workflow_model: &'a str,
) -> &'a str {
    mapping
        .and_then(|m| m.get(agent_key))
        .map(String::as_str)
        .unwrap_or(workflow_model)
}
