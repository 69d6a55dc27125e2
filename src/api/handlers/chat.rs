//! Azure OpenAI chat pass-through handler.

use axum::{Json, extract::State};
use serde::Deserialize;
use tracing::instrument;

use crate::api::error::{ApiError, ApiResult};
use crate::api::state::AppState;
use crate::auth::middleware::{CurrentUser, USER_ROLES};
use crate::chat::ChatReply;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
}

#[instrument(skip(state, user, request))]
pub async fn chat(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<ChatRequest>,
) -> ApiResult<Json<ChatReply>> {
    user.require_any_role(USER_ROLES)?;

    if request.message.trim().is_empty() {
        return Err(ApiError::bad_request("Message must not be empty"));
    }

    let user_identifier = user
        .0
        .user_identifier
        .as_deref()
        .ok_or_else(|| ApiError::bad_request("No credential cache bound to this session"))?;

    let reply = state
        .chat
        .complete(user_identifier, user.0.tenant_id.as_deref(), &request.message)
        .await?;

    Ok(Json(reply))
}
