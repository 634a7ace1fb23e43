//! Model, agent, and settings listing endpoints.

use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::services::agents::{dynamic_agent_keys, triage_agent_keys};
use crate::services::llm::ModelRegistry;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    pub models: Vec<&'static str>,
}

pub async fn list_models(State(_state): State<AppState>) -> Json<ModelsResponse> {
    Json(ModelsResponse {
        models: ModelRegistry::model_names(),
    })
}

#[derive(Debug, Deserialize)]
pub struct AgentsQuery {
    #[serde(default)]
    pub react_mode: bool,
}

#[derive(Debug, Serialize)]
pub struct AgentsResponse {
    pub agents: Vec<String>,
}

/// Agent keys of the selected workflow set: triage by default, the
/// dynamic (plan/review) set with `react_mode=true`.
pub async fn list_agents(
    State(state): State<AppState>,
    Query(query): Query<AgentsQuery>,
) -> Json<AgentsResponse> {
    let agents = if query.react_mode {
        dynamic_agent_keys(&state.subagents)
    } else {
        triage_agent_keys(&state.subagents)
    };
    Json(AgentsResponse { agents })
}

#[derive(Debug, Serialize)]
pub struct SettingsResponse {
    pub show_func_result: bool,
}

pub async fn get_settings(State(state): State<AppState>) -> Json<SettingsResponse> {
    Json(SettingsResponse {
        show_func_result: state.settings.show_func_result,
    })
}
