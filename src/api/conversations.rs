//! Conversation CRUD endpoints.

use std::collections::HashMap;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use super::user::LOCAL_USER_ID;
use crate::models::{Conversation, ConversationMeta, StoredMessage};
use crate::state::AppState;
use crate::utils::error::{AppError, AppResult};

#[derive(Debug, Serialize)]
pub struct ConversationResponse {
    pub id: String,
    pub title: String,
    pub model: String,
    pub messages: Vec<StoredMessage>,
    pub created_at: String,
    pub last_modified: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_level_llm_overwrite: Option<HashMap<String, String>>,
}

impl ConversationResponse {
    fn from_meta(meta: ConversationMeta) -> Self {
        Self {
            id: meta.conversation_id,
            title: meta.title,
            model: meta.model,
            messages: Vec::new(),
            created_at: meta.created_at,
            last_modified: meta.last_modified,
            agent_level_llm_overwrite: meta.agent_level_llm_overwrite,
        }
    }

    fn from_conversation(conversation: Conversation) -> Self {
        let mut response = Self::from_meta(conversation.meta);
        response.messages = conversation.messages;
        response
    }
}

/// Conversations for the current user, newest activity first.
/// Message lists stay empty here for lazy loading.
pub async fn list(State(state): State<AppState>) -> AppResult<Json<Vec<ConversationResponse>>> {
    let metas = state.store.list_conversations(LOCAL_USER_ID).await?;
    Ok(Json(
        metas.into_iter().map(ConversationResponse::from_meta).collect(),
    ))
}

#[derive(Debug, Deserialize)]
pub struct ConversationCreate {
    pub model: Option<String>,
}

pub async fn create(
    State(state): State<AppState>,
    Json(body): Json<ConversationCreate>,
) -> AppResult<(StatusCode, Json<ConversationResponse>)> {
    let model = body
        .model
        .unwrap_or_else(|| state.settings.default_model.clone());
    let conversation = Conversation::new(ConversationMeta::new(LOCAL_USER_ID, model));
    state.store.save_conversation(&conversation).await?;
    Ok((
        StatusCode::CREATED,
        Json(ConversationResponse::from_conversation(conversation)),
    ))
}

pub async fn get_one(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> AppResult<Json<ConversationResponse>> {
    let conversation = state
        .store
        .get_conversation(&conversation_id, LOCAL_USER_ID)
        .await?
        .ok_or_else(|| AppError::not_found("Conversation not found"))?;
    Ok(Json(ConversationResponse::from_conversation(conversation)))
}

#[derive(Debug, Deserialize)]
pub struct ConversationUpdate {
    pub title: Option<String>,
    pub model: Option<String>,
    pub agent_level_llm_overwrite: Option<HashMap<String, String>>,
}

pub async fn update(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Json(body): Json<ConversationUpdate>,
) -> AppResult<Json<ConversationResponse>> {
    if let Some(mapping) = &body.agent_level_llm_overwrite {
        crate::services::llm::validate_agent_mapping(mapping, &state.subagents.agent_keys())?;
    }
    let conversation = state
        .store
        .update_metadata(
            &conversation_id,
            LOCAL_USER_ID,
            body.title,
            body.model,
            body.agent_level_llm_overwrite,
        )
        .await?;
    Ok(Json(ConversationResponse::from_conversation(conversation)))
}

pub async fn delete(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> AppResult<StatusCode> {
    state
        .store
        .delete_conversation(&conversation_id, LOCAL_USER_ID)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
