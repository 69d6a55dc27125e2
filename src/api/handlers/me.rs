//! Session-holder endpoints.

use axum::{Json, extract::State, http::HeaderMap};
use serde::Serialize;
use serde_json::json;

use crate::api::error::ApiResult;
use crate::api::state::AppState;
use crate::auth::cookies::{self, CSRF_COOKIE, SESSION_COOKIE};
use crate::auth::middleware::{CurrentUser, USER_ROLES};

/// Profile shape returned by `/api/me` and `/api/check-auth`.
#[derive(Debug, Serialize)]
pub struct Profile {
    pub email: Option<String>,
    pub username: Option<String>,
    pub roles: Vec<String>,
    pub tenant_id: Option<String>,
}

impl Profile {
    fn from_session(session: &crate::session::SessionRecord) -> Self {
        Self {
            email: session.email.clone(),
            username: session.username.clone(),
            roles: session.roles.iter().cloned().collect(),
            tenant_id: session.tenant_id.clone(),
        }
    }
}

pub async fn me(user: CurrentUser) -> ApiResult<Json<Profile>> {
    user.require_any_role(USER_ROLES)?;
    Ok(Json(Profile::from_session(&user.0)))
}

/// Bootstrap endpoint for clients: profile plus the CSRF token echo.
pub async fn check_auth(
    State(state): State<AppState>,
    headers: HeaderMap,
    user: CurrentUser,
) -> ApiResult<Json<serde_json::Value>> {
    user.require_any_role(USER_ROLES)?;
    let csrf_token = cookies::find_cookie(&headers, &state.config.security, CSRF_COOKIE);
    Ok(Json(json!({
        "authenticated": true,
        "user": Profile::from_session(&user.0),
        "csrf_token": csrf_token,
    })))
}

pub async fn session_info(user: CurrentUser) -> ApiResult<Json<serde_json::Value>> {
    user.require_any_role(USER_ROLES)?;
    let session = &user.0;
    Ok(Json(json!({
        "email": session.email,
        "username": session.username,
        "roles": session.roles,
        "tenant_id": session.tenant_id,
        "user_identifier": session.user_identifier,
        "created_at": session.created_at,
        "last_seen_at": session.last_seen_at,
    })))
}

/// The caller's other sessions, i.e. the devices they are signed in on.
pub async fn my_devices(
    State(state): State<AppState>,
    headers: HeaderMap,
    user: CurrentUser,
) -> ApiResult<Json<serde_json::Value>> {
    user.require_any_role(USER_ROLES)?;

    let current_id = cookies::find_cookie(&headers, &state.config.security, SESSION_COOKIE);
    let devices: Vec<serde_json::Value> = match &user.0.object_id {
        Some(object_id) => state
            .sessions
            .list_for_user(object_id)
            .into_iter()
            .map(|session| {
                json!({
                    "created_at": session.created_at,
                    "last_seen_at": session.last_seen_at,
                    "current": current_id.as_deref() == Some(session.session_id.as_str()),
                })
            })
            .collect(),
        None => Vec::new(),
    };

    Ok(Json(json!({
        "total": devices.len(),
        "devices": devices,
    })))
}
