//! HTTP adapter: axum routes over the service layer.

pub mod conversations;
pub mod evaluation;
pub mod messages;
pub mod models;
pub mod user;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};

use crate::state::AppState;
use crate::utils::error::AppError;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Transient(_) | AppError::Timeout(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("request failed: {}", self);
        }
        (
            status,
            Json(serde_json::json!({ "detail": self.to_string() })),
        )
            .into_response()
    }
}

/// Assemble the `/api` router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/user", get(user::get_user))
        .route("/api/models", get(models::list_models))
        .route("/api/agents", get(models::list_agents))
        .route("/api/settings", get(models::get_settings))
        .route(
            "/api/conversations",
            get(conversations::list).post(conversations::create),
        )
        .route(
            "/api/conversations/:conversation_id",
            get(conversations::get_one)
                .put(conversations::update)
                .delete(conversations::delete),
        )
        .route(
            "/api/conversations/:conversation_id/messages",
            post(messages::send_message),
        )
        .route(
            "/api/conversations/:conversation_id/messages/:seq/evaluation",
            patch(evaluation::set_evaluation),
        )
        .route(
            "/api/conversations/:conversation_id/messages/:seq/evaluation/clear",
            patch(evaluation::clear_evaluation),
        )
}
