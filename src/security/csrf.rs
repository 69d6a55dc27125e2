//! CSRF protection using the double-submit cookie pattern.
//!
//! A mutating request is trusted only when the CSRF cookie and the
//! `X-CSRF-Token` header carry the same value, proving the caller could
//! read both. Safe methods and the public authorization endpoints are
//! exempt; everything else is rejected with 403 on a missing or
//! mismatching pair.

use axum::body::Body;
use axum::extract::State;
use axum::http::{Method, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::warn;

use crate::api::error::ApiError;
use crate::api::state::AppState;
use crate::auth::cookies::{self, CSRF_COOKIE, CSRF_HEADER};
use crate::security::constant_time_eq;

/// Endpoints reachable before a session (and thus a token) exists.
const EXEMPT_PATHS: &[&str] = &[
    "/api/authorize/start",
    "/api/authorize/status",
    "/api/authorize/complete",
];

fn is_safe_method(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE
    )
}

fn is_exempt_path(path: &str) -> bool {
    EXEMPT_PATHS.iter().any(|exempt| path.starts_with(exempt))
}

/// Axum middleware enforcing the double-submit check.
pub async fn csrf_middleware(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if is_safe_method(req.method()) || is_exempt_path(req.uri().path()) {
        return next.run(req).await;
    }

    let cookie = cookies::find_cookie(req.headers(), &state.config.security, CSRF_COOKIE);
    let header = req
        .headers()
        .get(CSRF_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let (Some(cookie), Some(header)) = (cookie, header) else {
        warn!(
            path = %req.uri().path(),
            "CSRF validation failed - missing token"
        );
        return ApiError::forbidden("CSRF validation failed - missing token").into_response();
    };

    if !constant_time_eq(&cookie, &header) {
        warn!(path = %req.uri().path(), "CSRF validation failed - token mismatch");
        return ApiError::forbidden("CSRF validation failed - invalid token").into_response();
    }

    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_methods_exempt() {
        assert!(is_safe_method(&Method::GET));
        assert!(is_safe_method(&Method::HEAD));
        assert!(is_safe_method(&Method::OPTIONS));
        assert!(is_safe_method(&Method::TRACE));
        assert!(!is_safe_method(&Method::POST));
        assert!(!is_safe_method(&Method::DELETE));
    }

    #[test]
    fn test_public_auth_endpoints_exempt() {
        assert!(is_exempt_path("/api/authorize/start"));
        assert!(is_exempt_path("/api/authorize/status"));
        assert!(is_exempt_path("/api/authorize/complete"));
        assert!(!is_exempt_path("/api/auth/logout"));
        assert!(!is_exempt_path("/api/chat"));
    }
}
