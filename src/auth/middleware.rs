//! Request-time authentication extractors.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::api::error::ApiError;
use crate::api::state::AppState;
use crate::auth::cookies::{self, FINGERPRINT_COOKIE, SESSION_COOKIE};
use crate::session::SessionRecord;

pub const ADMIN_ROLES: &[&str] = &["admin"];
pub const USER_ROLES: &[&str] = &["user", "admin"];

/// The authenticated caller, resolved from the session cookie.
///
/// Rejects with 401 when the session cookie is missing or stale, and when
/// the fingerprint cookie no longer matches the one the session was bound
/// to. Resolving the session slides its idle window.
#[derive(Debug, Clone)]
pub struct CurrentUser(pub SessionRecord);

impl CurrentUser {
    /// Require at least one of `roles`, or reject with 403.
    pub fn require_any_role(&self, roles: &[&str]) -> Result<(), ApiError> {
        if roles.iter().any(|role| self.0.has_role(role)) {
            Ok(())
        } else {
            Err(ApiError::forbidden(format!(
                "Insufficient permissions. Required roles: {}",
                roles.join(", ")
            )))
        }
    }
}

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let security = &state.config.security;

        let session_id = cookies::find_cookie(&parts.headers, security, SESSION_COOKIE)
            .ok_or_else(|| ApiError::unauthorized("Not authenticated"))?;

        let session = state
            .sessions
            .get(&session_id)
            .ok_or_else(|| ApiError::unauthorized("Invalid or expired session"))?;

        // The fingerprint check only applies when the client presents one;
        // its absence alone does not invalidate an otherwise valid session.
        if let Some(fingerprint) = cookies::find_cookie(&parts.headers, security, FINGERPRINT_COOKIE)
        {
            if !crate::security::constant_time_eq(&fingerprint, &session.fingerprint) {
                tracing::warn!(
                    email = ?session.email,
                    "Session presented with mismatching device fingerprint"
                );
                return Err(ApiError::unauthorized("Device fingerprint mismatch"));
            }
        }

        Ok(CurrentUser(session))
    }
}

/// An authenticated caller holding the admin role.
#[derive(Debug, Clone)]
pub struct RequireAdmin(pub SessionRecord);

impl FromRequestParts<AppState> for RequireAdmin {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let user = CurrentUser::from_request_parts(parts, state).await?;
        user.require_any_role(ADMIN_ROLES)?;
        Ok(RequireAdmin(user.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeSet;

    fn session_with_roles(roles: &[&str]) -> SessionRecord {
        SessionRecord {
            session_id: "s".to_string(),
            object_id: Some("oid".to_string()),
            email: Some("jane@example.com".to_string()),
            username: Some("jane".to_string()),
            roles: roles.iter().map(|r| r.to_string()).collect::<BTreeSet<_>>(),
            tenant_id: None,
            user_identifier: Some("jane-abc".to_string()),
            fingerprint: "fp".to_string(),
            created_at: Utc::now(),
            last_seen_at: Utc::now(),
        }
    }

    #[test]
    fn test_require_any_role() {
        let user = CurrentUser(session_with_roles(&["user"]));
        assert!(user.require_any_role(USER_ROLES).is_ok());
        assert!(user.require_any_role(ADMIN_ROLES).is_err());

        let admin = CurrentUser(session_with_roles(&["admin"]));
        assert!(admin.require_any_role(USER_ROLES).is_ok());
        assert!(admin.require_any_role(ADMIN_ROLES).is_ok());

        let nobody = CurrentUser(session_with_roles(&[]));
        assert!(nobody.require_any_role(USER_ROLES).is_err());
    }
}
