//! Current-user endpoint.
//!
//! Authentication-header parsing is an external collaborator; this service
//! runs behind it and reports the local development identity otherwise.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::state::AppState;

/// Identity used when no auth proxy sits in front of the service.
pub const LOCAL_USER_ID: &str = "00000000-0000-0000-0000-000000000001";
pub const LOCAL_USER_NAME: &str = "local_user";

#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub user_id: String,
    pub user_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub principal_name: Option<String>,
    pub is_authenticated: bool,
    pub mode: String,
}

pub async fn get_user(State(_state): State<AppState>) -> Json<UserResponse> {
    Json(UserResponse {
        user_id: LOCAL_USER_ID.to_string(),
        user_name: LOCAL_USER_NAME.to_string(),
        first_name: None,
        principal_name: None,
        is_authenticated: false,
        mode: "local".to_string(),
    })
}
