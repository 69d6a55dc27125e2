//! Admin endpoints.

use axum::{Json, extract::State};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::api::error::ApiResult;
use crate::api::state::AppState;
use crate::auth::middleware::RequireAdmin;
use crate::session::SessionRecord;

/// Session overview without the secret material (ids, fingerprints).
#[derive(Debug, Serialize)]
pub struct SessionOverview {
    pub email: Option<String>,
    pub username: Option<String>,
    pub roles: Vec<String>,
    pub object_id: Option<String>,
    pub tenant_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl From<SessionRecord> for SessionOverview {
    fn from(session: SessionRecord) -> Self {
        Self {
            email: session.email,
            username: session.username,
            roles: session.roles.into_iter().collect(),
            object_id: session.object_id,
            tenant_id: session.tenant_id,
            created_at: session.created_at,
            last_seen_at: session.last_seen_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SessionListResponse {
    pub total_sessions: usize,
    pub sessions: Vec<SessionOverview>,
}

pub async fn list_sessions(
    State(state): State<AppState>,
    _admin: RequireAdmin,
) -> ApiResult<Json<SessionListResponse>> {
    let sessions: Vec<SessionOverview> = state
        .sessions
        .list()
        .into_iter()
        .map(SessionOverview::from)
        .collect();

    Ok(Json(SessionListResponse {
        total_sessions: sessions.len(),
        sessions,
    }))
}
