//! Device-code authorization handlers.

use std::time::Duration;

use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderMap, header::SET_COOKIE},
    response::{AppendHeaders, IntoResponse},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::api::error::{ApiError, ApiResult};
use crate::api::state::AppState;
use crate::auth::attempt::AttemptState;
use crate::auth::cookies::{
    self, CSRF_COOKIE, FINGERPRINT_COOKIE, SESSION_COOKIE, build_cookie, clear_cookie,
};
use crate::security::random_token;
use crate::session::SessionIdentity;

/// Response for a successfully started authorization. Only produced once
/// both halves of the device prompt have been observed; a user code
/// without a link to enter it at is useless to the client.
#[derive(Debug, Serialize)]
pub struct StartResponse {
    pub attempt_id: String,
    pub user_code: String,
    pub verification_uri: String,
}

/// Attempt status as seen by the polling client.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub state: AttemptState,
    pub authorized: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    pub attempt_id: String,
    pub fingerprint: Option<String>,
}

/// Kick off a login attempt and wait briefly for its device prompt.
///
/// The background task keeps running past the polling window; a 500 here
/// only means the prompt was not observed in time, and the client can
/// fall back to polling the status endpoint.
#[instrument(skip(state))]
pub async fn start(State(state): State<AppState>) -> ApiResult<Json<StartResponse>> {
    let attempt_id = state
        .orchestrator
        .clone()
        .start()
        .await
        .map_err(|e| ApiError::internal(format!("Failed to start authorization: {e}")))?;

    let interval = Duration::from_millis(state.config.azure.start_poll_interval_ms);
    for _ in 0..state.config.azure.start_poll_attempts {
        let Some(attempt) = state.attempts.get(&attempt_id) else {
            break;
        };
        if let (Some(user_code), Some(verification_uri)) =
            (attempt.user_code, attempt.verification_uri)
        {
            return Ok(Json(StartResponse {
                attempt_id,
                user_code,
                verification_uri,
            }));
        }
        // A terminal attempt without a device prompt will never produce one.
        if attempt.state.is_terminal() {
            break;
        }
        tokio::time::sleep(interval).await;
    }

    warn!(attempt_id = %attempt_id, "Device prompt not observed within polling window");
    Err(ApiError::internal("Failed to start authorization"))
}

/// Poll the state of a login attempt.
pub async fn status(
    State(state): State<AppState>,
    Path(attempt_id): Path<String>,
) -> ApiResult<Json<StatusResponse>> {
    let attempt = state
        .attempts
        .get(&attempt_id)
        .ok_or_else(|| ApiError::not_found("Authorization attempt not found"))?;

    Ok(Json(StatusResponse {
        state: attempt.state,
        authorized: attempt.authorized,
        user_code: attempt.user_code,
        verification_uri: attempt.verification_uri,
        email: attempt.email,
        username: attempt.username,
        message: attempt.message,
    }))
}

/// Exchange a completed, authorized attempt for a session.
///
/// The attempt is consumed: a second completion with the same id fails
/// with 400 regardless of how the first one went.
#[instrument(skip(state, request))]
pub async fn complete(
    State(state): State<AppState>,
    Json(request): Json<CompleteRequest>,
) -> ApiResult<impl IntoResponse> {
    let attempt = state
        .attempts
        .get(&request.attempt_id)
        .ok_or_else(|| ApiError::bad_request("Invalid or incomplete authorization attempt"))?;

    if attempt.state != AttemptState::Completed {
        return Err(ApiError::bad_request(
            "Invalid or incomplete authorization attempt",
        ));
    }
    if !attempt.authorized {
        return Err(ApiError::forbidden(
            attempt
                .message
                .unwrap_or_else(|| "User not authorized for any roles".to_string()),
        ));
    }

    let fingerprint = request
        .fingerprint
        .filter(|fp| !fp.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("Device fingerprint is required"))?;

    // Consume the attempt; losing the race means someone else already did.
    let attempt = state
        .attempts
        .remove(&request.attempt_id)
        .ok_or_else(|| ApiError::bad_request("Invalid or incomplete authorization attempt"))?;

    let csrf_token = random_token();
    let session = state.sessions.create(
        SessionIdentity {
            object_id: attempt.object_id,
            email: attempt.email,
            username: attempt.username,
            roles: attempt.roles,
            tenant_id: attempt.tenant_id,
            user_identifier: attempt.user_identifier,
        },
        fingerprint.clone(),
    );

    let security = &state.config.security;
    let max_age = security.cookie_max_age_secs;
    let cookies = AppendHeaders([
        (
            SET_COOKIE,
            build_cookie(security, SESSION_COOKIE, &session.session_id, max_age, true),
        ),
        (
            SET_COOKIE,
            build_cookie(security, FINGERPRINT_COOKIE, &fingerprint, max_age, true),
        ),
        (
            SET_COOKIE,
            build_cookie(security, CSRF_COOKIE, &csrf_token, max_age, false),
        ),
    ]);

    info!(email = ?session.email, "Authorization completed");
    Ok((
        cookies,
        Json(json!({
            "success": true,
            "message": "Login successful",
            "csrf_token": csrf_token,
        })),
    ))
}

/// End the caller's session and clear the auth cookies.
///
/// Works best-effort: with a session cookie that session is deleted; with
/// only a fingerprint cookie every session bound to that device goes.
#[instrument(skip(state, headers))]
pub async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let security = &state.config.security;

    if let Some(session_id) = cookies::find_cookie(&headers, security, SESSION_COOKIE) {
        if let Some(session) = state.sessions.delete(&session_id) {
            info!(email = ?session.email, "Session logged out");
        }
    } else if let Some(fingerprint) = cookies::find_cookie(&headers, security, FINGERPRINT_COOKIE) {
        let purged = state.sessions.delete_by_fingerprint(&fingerprint);
        if purged > 0 {
            info!(count = purged, "Sessions purged by device fingerprint");
        }
    }

    let cleared = AppendHeaders([
        (SET_COOKIE, clear_cookie(security, SESSION_COOKIE)),
        (SET_COOKIE, clear_cookie(security, FINGERPRINT_COOKIE)),
        (SET_COOKIE, clear_cookie(security, CSRF_COOKIE)),
    ]);

    Ok((cleared, Json(json!({"success": true}))))
}
