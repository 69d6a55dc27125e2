//! Authentication cookie helpers.
//!
//! Three cookies make up a session: the session id and fingerprint
//! (HttpOnly) and the CSRF token (readable by client script). In
//! production all three carry the `__Host-` prefix, the Secure flag and
//! SameSite=Strict; in development they stay unprefixed with SameSite=Lax
//! so http://localhost works.

use axum::http::HeaderMap;
use axum::http::header::COOKIE;

use crate::config::SecurityConfig;

pub const SESSION_COOKIE: &str = "session_id";
pub const FINGERPRINT_COOKIE: &str = "fingerprint";
pub const CSRF_COOKIE: &str = "csrf_token";

/// Header carrying the CSRF double-submit value.
pub const CSRF_HEADER: &str = "x-csrf-token";

/// Effective cookie name for the current environment.
pub fn cookie_name(config: &SecurityConfig, base: &str) -> String {
    if config.production {
        format!("__Host-{base}")
    } else {
        base.to_string()
    }
}

/// Extract a cookie value by exact name from the request headers.
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    for header in headers.get_all(COOKIE) {
        let raw = header.to_str().ok()?;
        for pair in raw.split(';') {
            if let Some((key, value)) = pair.trim().split_once('=') {
                if key == name {
                    return Some(value.to_string());
                }
            }
        }
    }
    None
}

/// Extract a cookie by base name, trying the environment-prefixed name
/// first and falling back to the bare name (pre-hardening clients).
pub fn find_cookie(headers: &HeaderMap, config: &SecurityConfig, base: &str) -> Option<String> {
    cookie_value(headers, &cookie_name(config, base))
        .or_else(|| cookie_value(headers, base))
}

/// Build a Set-Cookie header value.
pub fn build_cookie(
    config: &SecurityConfig,
    base: &str,
    value: &str,
    max_age_secs: u64,
    http_only: bool,
) -> String {
    let name = cookie_name(config, base);
    let mut cookie = format!("{name}={value}; Path=/; Max-Age={max_age_secs}");
    if http_only {
        cookie.push_str("; HttpOnly");
    }
    if config.production {
        cookie.push_str("; SameSite=Strict; Secure");
    } else {
        cookie.push_str("; SameSite=Lax");
    }
    cookie
}

/// Build a Set-Cookie header value that removes the cookie.
///
/// `__Host-` cookies are only accepted with the Secure flag, including on
/// removal, so the production attributes are repeated here.
pub fn clear_cookie(config: &SecurityConfig, base: &str) -> String {
    let mut cookie = format!("{}=; Path=/; Max-Age=0", cookie_name(config, base));
    if config.production {
        cookie.push_str("; SameSite=Strict; Secure");
    }
    cookie
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn dev_config() -> SecurityConfig {
        SecurityConfig::default()
    }

    fn prod_config() -> SecurityConfig {
        SecurityConfig {
            production: true,
            ..SecurityConfig::default()
        }
    }

    #[test]
    fn test_cookie_name_prefixing() {
        assert_eq!(cookie_name(&dev_config(), SESSION_COOKIE), "session_id");
        assert_eq!(
            cookie_name(&prod_config(), SESSION_COOKIE),
            "__Host-session_id"
        );
    }

    #[test]
    fn test_cookie_value_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_static("session_id=abc; csrf_token=xyz ; other=1"),
        );
        assert_eq!(cookie_value(&headers, "session_id").as_deref(), Some("abc"));
        assert_eq!(cookie_value(&headers, "csrf_token").as_deref(), Some("xyz"));
        assert_eq!(cookie_value(&headers, "missing"), None);
    }

    #[test]
    fn test_find_cookie_prefers_prefixed_name() {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_static("__Host-session_id=hardened; session_id=legacy"),
        );
        assert_eq!(
            find_cookie(&headers, &prod_config(), SESSION_COOKIE).as_deref(),
            Some("hardened")
        );
        // Falls back to the bare name when the prefixed one is absent.
        let mut legacy_only = HeaderMap::new();
        legacy_only.insert(COOKIE, HeaderValue::from_static("session_id=legacy"));
        assert_eq!(
            find_cookie(&legacy_only, &prod_config(), SESSION_COOKIE).as_deref(),
            Some("legacy")
        );
    }

    #[test]
    fn test_build_cookie_flags() {
        let dev = build_cookie(&dev_config(), SESSION_COOKIE, "v", 3600, true);
        assert_eq!(dev, "session_id=v; Path=/; Max-Age=3600; HttpOnly; SameSite=Lax");

        let prod = build_cookie(&prod_config(), CSRF_COOKIE, "v", 3600, false);
        assert_eq!(
            prod,
            "__Host-csrf_token=v; Path=/; Max-Age=3600; SameSite=Strict; Secure"
        );
    }

    #[test]
    fn test_clear_cookie() {
        assert_eq!(
            clear_cookie(&dev_config(), FINGERPRINT_COOKIE),
            "fingerprint=; Path=/; Max-Age=0"
        );
    }
}
