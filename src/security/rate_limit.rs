//! Sliding-window rate limiter.
//!
//! Per-client request timestamps in a concurrent map; each check prunes
//! entries older than the window before deciding. State is per-process, so
//! a multi-instance deployment needs an external shared counter instead.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use tracing::warn;

use crate::api::error::ApiError;
use crate::api::state::AppState;

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited,
}

/// Sliding-window counter keyed by client identity.
#[derive(Debug)]
pub struct RateLimiter {
    max_per_window: usize,
    window: Duration,
    hits: DashMap<String, Vec<Instant>>,
}

impl RateLimiter {
    pub fn new(max_per_window: usize) -> Self {
        Self::with_window(max_per_window, Duration::from_secs(60))
    }

    pub fn with_window(max_per_window: usize, window: Duration) -> Self {
        Self {
            max_per_window,
            window,
            hits: DashMap::new(),
        }
    }

    /// Check and record a request for `key` at the current instant.
    pub fn check(&self, key: &str) -> RateLimitDecision {
        self.check_at(key, Instant::now())
    }

    /// Check and record a request for `key` at `now`.
    ///
    /// Prunes timestamps older than the window first; rejects when the
    /// pruned count has already reached the limit, otherwise records `now`.
    pub fn check_at(&self, key: &str, now: Instant) -> RateLimitDecision {
        let mut entry = self.hits.entry(key.to_string()).or_default();
        entry.retain(|stamp| now.duration_since(*stamp) < self.window);
        if entry.len() >= self.max_per_window {
            return RateLimitDecision::Limited;
        }
        entry.push(now);
        RateLimitDecision::Allowed
    }

    /// Drop clients whose recorded hits have all aged out of the window.
    /// `check_at` only prunes the key it touches, so one-off clients would
    /// otherwise accumulate in the map forever.
    pub fn prune(&self) {
        self.prune_at(Instant::now());
    }

    fn prune_at(&self, now: Instant) {
        self.hits.retain(|_, stamps| {
            stamps.retain(|stamp| now.duration_since(*stamp) < self.window);
            !stamps.is_empty()
        });
    }
}

/// Identify the client: first `X-Forwarded-For` entry if present, else the
/// peer socket address.
fn client_key(req: &Request<Body>) -> String {
    if let Some(forwarded) = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }

    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Axum middleware applying the shared limiter to every request.
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let key = client_key(&req);
    if state.rate_limiter.check(&key) == RateLimitDecision::Limited {
        warn!(client = %key, "Rate limit exceeded");
        return ApiError::too_many_requests("Rate limit exceeded. Please try again later.")
            .into_response();
    }
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admits_up_to_limit_then_rejects() {
        let limiter = RateLimiter::new(3);
        let now = Instant::now();
        for _ in 0..3 {
            assert_eq!(limiter.check_at("1.2.3.4", now), RateLimitDecision::Allowed);
        }
        assert_eq!(limiter.check_at("1.2.3.4", now), RateLimitDecision::Limited);
    }

    #[test]
    fn test_admits_again_after_window_expires() {
        let limiter = RateLimiter::new(2);
        let start = Instant::now();
        assert_eq!(limiter.check_at("client", start), RateLimitDecision::Allowed);
        assert_eq!(limiter.check_at("client", start), RateLimitDecision::Allowed);
        assert_eq!(limiter.check_at("client", start), RateLimitDecision::Limited);

        // Just before the oldest timestamp ages out: still limited.
        let almost = start + Duration::from_secs(59);
        assert_eq!(limiter.check_at("client", almost), RateLimitDecision::Limited);

        // The oldest two entries age past 60s: admitted again.
        let later = start + Duration::from_secs(60);
        assert_eq!(limiter.check_at("client", later), RateLimitDecision::Allowed);
    }

    #[test]
    fn test_prune_drops_expired_clients() {
        let limiter = RateLimiter::new(5);
        let start = Instant::now();
        limiter.check_at("old-client", start);
        limiter.check_at("old-client", start + Duration::from_secs(10));
        limiter.check_at("fresh-client", start + Duration::from_secs(50));
        assert_eq!(limiter.hits.len(), 2);

        limiter.prune_at(start + Duration::from_secs(75));
        assert_eq!(limiter.hits.len(), 1);
        assert!(limiter.hits.contains_key("fresh-client"));

        limiter.prune_at(start + Duration::from_secs(120));
        assert!(limiter.hits.is_empty());
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = RateLimiter::new(1);
        let now = Instant::now();
        assert_eq!(limiter.check_at("a", now), RateLimitDecision::Allowed);
        assert_eq!(limiter.check_at("b", now), RateLimitDecision::Allowed);
        assert_eq!(limiter.check_at("a", now), RateLimitDecision::Limited);
    }
}
