//! Router assembly: routes, CORS, security headers, middleware layers.

use axum::http::{HeaderValue, Method, header};
use axum::routing::{get, post};
use axum::{Router, middleware};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use super::handlers;
use super::state::AppState;
use crate::security::csrf::csrf_middleware;
use crate::security::rate_limit::rate_limit_middleware;

/// Build the full application router.
pub fn create_router(state: AppState) -> Router {
    let cors = build_cors_layer(&state);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::DEBUG))
        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
        .on_response(DefaultOnResponse::new().level(Level::DEBUG));

    // Public routes (no session required)
    let public_routes = Router::new()
        .route("/api/health", get(handlers::misc::health))
        .route("/api/authorize/start", post(handlers::authorize::start))
        .route(
            "/api/authorize/status/{attempt_id}",
            get(handlers::authorize::status),
        )
        .route("/api/authorize/complete", post(handlers::authorize::complete))
        .route("/api/auth/logout", post(handlers::authorize::logout));

    // Protected routes (session cookie + fingerprint via extractors)
    let protected_routes = Router::new()
        .route("/api/me", get(handlers::me::me))
        .route("/api/check-auth", get(handlers::me::check_auth))
        .route("/api/session/info", get(handlers::me::session_info))
        .route("/api/me/devices", get(handlers::me::my_devices))
        .route("/api/admin/sessions", get(handlers::admin::list_sessions))
        .route("/api/chat", post(handlers::chat::chat));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(middleware::from_fn_with_state(state.clone(), csrf_middleware))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ))
        .layer(security_headers())
        .layer(cors)
        .layer(trace_layer)
        .with_state(state)
}

/// Fixed security response headers, applied to every response.
fn security_headers() -> (
    SetResponseHeaderLayer<HeaderValue>,
    SetResponseHeaderLayer<HeaderValue>,
    SetResponseHeaderLayer<HeaderValue>,
    SetResponseHeaderLayer<HeaderValue>,
    SetResponseHeaderLayer<HeaderValue>,
) {
    (
        SetResponseHeaderLayer::overriding(
            header::STRICT_TRANSPORT_SECURITY,
            HeaderValue::from_static("max-age=31536000; includeSubDomains"),
        ),
        SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ),
        SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ),
        SetResponseHeaderLayer::overriding(
            header::REFERRER_POLICY,
            HeaderValue::from_static("strict-origin-when-cross-origin"),
        ),
        SetResponseHeaderLayer::overriding(
            header::CONTENT_SECURITY_POLICY,
            HeaderValue::from_static(
                "default-src 'self'; script-src 'self'; style-src 'self' 'unsafe-inline'; \
                 img-src 'self' data:; connect-src 'self'; frame-ancestors 'none'",
            ),
        ),
    )
}

/// Build the CORS layer based on configuration.
///
/// Credentials are always allowed (the session rides on cookies), which
/// rules out a wildcard origin; dev mode with no configured origins
/// mirrors the request origin instead.
fn build_cors_layer(state: &AppState) -> CorsLayer {
    let allowed_origins = &state.config.server.allowed_origins;
    let dev_mode = !state.config.security.production;

    let methods = [Method::GET, Method::POST, Method::OPTIONS];
    let headers = [
        header::CONTENT_TYPE,
        header::ACCEPT,
        header::ORIGIN,
        header::COOKIE,
        header::HeaderName::from_static("x-csrf-token"),
    ];
    let exposed = [header::HeaderName::from_static("x-csrf-token")];

    let mut origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| {
            origin.parse::<HeaderValue>().ok().or_else(|| {
                tracing::warn!("CORS: Invalid origin in config: {}", origin);
                None
            })
        })
        .collect();

    if origins.is_empty() {
        if dev_mode {
            // allow_origin(any()) is incompatible with allow_credentials(true),
            // so mirror the request's Origin header instead.
            tracing::warn!("CORS: No origins configured in dev mode, mirroring request origin");
            CorsLayer::new()
                .allow_origin(AllowOrigin::mirror_request())
                .allow_methods(methods)
                .allow_headers(headers)
                .expose_headers(exposed)
                .allow_credentials(true)
        } else {
            tracing::warn!(
                "CORS: No origins configured in production mode, denying all cross-origin requests"
            );
            CorsLayer::new().allow_origin(AllowOrigin::exact(HeaderValue::from_static("null")))
        }
    } else {
        if dev_mode {
            for origin in ["http://localhost:3000", "http://127.0.0.1:3000"] {
                if let Ok(value) = origin.parse::<HeaderValue>()
                    && !origins.contains(&value)
                {
                    origins.push(value);
                }
            }
        }
        tracing::info!("CORS: Allowing {} origin(s)", origins.len());
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(methods)
            .allow_headers(headers)
            .expose_headers(exposed)
            .allow_credentials(true)
    }
}
