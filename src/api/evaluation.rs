//! Message evaluation endpoints (satisfaction flag + comment).

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

use super::user::LOCAL_USER_ID;
use crate::state::AppState;
use crate::utils::error::AppResult;

#[derive(Debug, Deserialize)]
pub struct EvaluationRequest {
    pub is_satisfy: bool,
    pub comment: Option<String>,
}

pub async fn set_evaluation(
    State(state): State<AppState>,
    Path((conversation_id, seq)): Path<(String, u32)>,
    Json(body): Json<EvaluationRequest>,
) -> AppResult<StatusCode> {
    state
        .store
        .set_evaluation(
            &conversation_id,
            LOCAL_USER_ID,
            seq,
            Some(body.is_satisfy),
            body.comment,
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn clear_evaluation(
    State(state): State<AppState>,
    Path((conversation_id, seq)): Path<(String, u32)>,
) -> AppResult<StatusCode> {
    state
        .store
        .set_evaluation(&conversation_id, LOCAL_USER_ID, seq, None, None)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
