//! End-to-end tests against the full router, with the Azure CLI replaced
//! by a shell script.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use axum::http::header::{COOKIE, HeaderName, HeaderValue, SET_COOKIE};
use axum_test::TestServer;
use serde_json::Value;
use tempfile::TempDir;

use azgate::api::{AppState, create_router};
use azgate::config::AppConfig;

const HAPPY_CLI: &str = r##"#!/bin/sh
case "$1" in
  login)
    echo "To sign in, use a web browser to open the page https://microsoft.com/devicelogin and enter the code TEST-CODE to authenticate." >&2
    sleep 0.2
    echo '[{"tenantId": "tenant-1", "homeTenantId": "tenant-1"}]'
    ;;
  ad)
    echo '{"id": "object-1234-5678", "userPrincipalName": "jane@example.com", "mailNickname": "jane"}'
    ;;
  rest)
    echo '{"value": [{"@odata.type": "#microsoft.graph.group", "id": "group-admin"}]}'
    ;;
  account)
    echo '{"accessToken": "fake-token"}'
    ;;
esac
"##;

/// Same flow, but group membership matches nothing.
const UNAUTHORIZED_CLI: &str = r#"#!/bin/sh
case "$1" in
  login)
    echo "open https://microsoft.com/devicelogin and enter the code TEST-CODE to authenticate" >&2
    sleep 0.2
    echo '[{"tenantId": "tenant-1"}]'
    ;;
  ad)
    echo '{"id": "object-1234-5678", "userPrincipalName": "jane@example.com", "mailNickname": "jane"}'
    ;;
  rest)
    echo '{"value": []}'
    ;;
esac
"#;

/// Login succeeds but the group membership query fails outright.
const GRAPH_DOWN_CLI: &str = r#"#!/bin/sh
case "$1" in
  login)
    echo "open https://microsoft.com/devicelogin and enter the code TEST-CODE to authenticate" >&2
    sleep 0.2
    echo '[{"tenantId": "tenant-1"}]'
    ;;
  ad)
    echo '{"id": "object-1234-5678", "userPrincipalName": "jane@example.com", "mailNickname": "jane"}'
    ;;
  rest)
    echo "Graph request failed" >&2
    exit 1
    ;;
esac
"#;

/// Prints a user code but never the verification URL.
const CODE_ONLY_CLI: &str = r#"#!/bin/sh
case "$1" in
  login)
    echo "enter the code TEST-CODE to authenticate" >&2
    sleep 30
    ;;
esac
"#;

/// Prompts normally, then reports an empty account list.
const NO_ACCOUNTS_CLI: &str = r#"#!/bin/sh
case "$1" in
  login)
    echo "open https://microsoft.com/devicelogin and enter the code TEST-CODE to authenticate" >&2
    sleep 0.2
    echo '[]'
    ;;
esac
"#;

/// Prints the prompt, then hangs well past the configured login timeout.
const HANGING_CLI: &str = r#"#!/bin/sh
case "$1" in
  login)
    echo "open https://microsoft.com/devicelogin and enter the code TEST-CODE to authenticate" >&2
    sleep 30
    ;;
esac
"#;

fn write_fake_cli(dir: &Path, script: &str) -> String {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("az");
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.to_string_lossy().into_owned()
}

fn test_config(dir: &TempDir, script: &str) -> AppConfig {
    let mut config = AppConfig::default();
    config.azure.binary = write_fake_cli(dir.path(), script);
    config.azure.config_base_dir = dir.path().join("azure-caches");
    config.azure.login_timeout_secs = 5;
    config.azure.start_poll_attempts = 50;
    config.azure.start_poll_interval_ms = 20;
    // Keep status polling clear of the limiter in these tests.
    config.security.requests_per_minute = 1000;
    config.roles.mappings = BTreeMap::from([
        ("admin".to_string(), vec!["group-admin".to_string()]),
        ("user".to_string(), vec!["group-user".to_string()]),
    ]);
    config
}

fn server_for(config: AppConfig) -> TestServer {
    let state = AppState::from_config(config);
    TestServer::new(create_router(state)).unwrap()
}

/// Extract `name=value` pairs from the Set-Cookie response headers.
fn set_cookies(response: &axum_test::TestResponse) -> BTreeMap<String, String> {
    response
        .headers()
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|header| {
            let raw = header.to_str().ok()?;
            let (pair, _) = raw.split_once(';')?;
            let (name, value) = pair.split_once('=')?;
            Some((name.to_string(), value.to_string()))
        })
        .collect()
}

fn cookie_header(cookies: &BTreeMap<String, String>) -> HeaderValue {
    let joined = cookies
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join("; ");
    HeaderValue::from_str(&joined).unwrap()
}

fn csrf_header(token: &str) -> (HeaderName, HeaderValue) {
    (
        HeaderName::from_static("x-csrf-token"),
        HeaderValue::from_str(token).unwrap(),
    )
}

/// Poll the status endpoint until the attempt leaves its pending states.
async fn wait_for_terminal(server: &TestServer, attempt_id: &str) -> Value {
    for _ in 0..100 {
        let response = server
            .get(&format!("/api/authorize/status/{attempt_id}"))
            .await;
        response.assert_status_ok();
        let body: Value = response.json();
        let state = body["state"].as_str().unwrap().to_string();
        if state != "starting" && state != "waiting_for_user" {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("attempt {attempt_id} never reached a terminal state");
}

/// Run start + approval wait + complete; returns the cookie jar contents
/// and the CSRF token from the completion response.
async fn login(server: &TestServer, fingerprint: &str) -> (BTreeMap<String, String>, String) {
    let start: Value = server.post("/api/authorize/start").await.json();
    let attempt_id = start["attempt_id"].as_str().unwrap().to_string();
    assert_eq!(start["user_code"], "TEST-CODE");
    assert_eq!(start["verification_uri"], "https://microsoft.com/devicelogin");

    let status = wait_for_terminal(server, &attempt_id).await;
    assert_eq!(status["state"], "completed");
    assert_eq!(status["authorized"], true);

    let response = server
        .post("/api/authorize/complete")
        .json(&serde_json::json!({
            "attempt_id": attempt_id,
            "fingerprint": fingerprint,
        }))
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["success"], true);

    let cookies = set_cookies(&response);
    let csrf_token = body["csrf_token"].as_str().unwrap().to_string();
    assert_eq!(cookies["csrf_token"], csrf_token);
    (cookies, csrf_token)
}

#[tokio::test]
async fn test_full_login_flow() {
    let dir = TempDir::new().unwrap();
    let server = server_for(test_config(&dir, HAPPY_CLI));

    let (cookies, csrf_token) = login(&server, "device-fp-1").await;
    assert!(cookies.contains_key("session_id"));
    assert_eq!(cookies["fingerprint"], "device-fp-1");

    // The promoted per-user credential cache exists on disk.
    let user_cache = dir.path().join("azure-caches/users/jane-object123456");
    assert!(user_cache.is_dir(), "missing {}", user_cache.display());

    let me = server
        .get("/api/me")
        .add_header(COOKIE, cookie_header(&cookies))
        .await;
    me.assert_status_ok();
    let profile: Value = me.json();
    assert_eq!(profile["email"], "jane@example.com");
    assert_eq!(profile["username"], "jane");
    assert_eq!(profile["roles"], serde_json::json!(["admin"]));

    // Admin role grants the session overview.
    let admin = server
        .get("/api/admin/sessions")
        .add_header(COOKIE, cookie_header(&cookies))
        .await;
    admin.assert_status_ok();
    let listing: Value = admin.json();
    assert_eq!(listing["total_sessions"], 1);

    // Logout invalidates the session.
    let (csrf_name, csrf_value) = csrf_header(&csrf_token);
    let logout = server
        .post("/api/auth/logout")
        .add_header(COOKIE, cookie_header(&cookies))
        .add_header(csrf_name, csrf_value)
        .await;
    logout.assert_status_ok();

    let after = server
        .get("/api/me")
        .add_header(COOKIE, cookie_header(&cookies))
        .await;
    after.assert_status_unauthorized();
}

#[tokio::test]
async fn test_fingerprint_mismatch_rejected() {
    let dir = TempDir::new().unwrap();
    let server = server_for(test_config(&dir, HAPPY_CLI));

    let (mut cookies, _) = login(&server, "device-fp-1").await;
    cookies.insert("fingerprint".to_string(), "stolen-device".to_string());

    let response = server
        .get("/api/me")
        .add_header(COOKIE, cookie_header(&cookies))
        .await;
    response.assert_status_unauthorized();
    let body: Value = response.json();
    assert!(body["error"].as_str().unwrap().contains("fingerprint"));
}

#[tokio::test]
async fn test_csrf_double_submit() {
    let dir = TempDir::new().unwrap();
    let server = server_for(test_config(&dir, HAPPY_CLI));

    let (cookies, csrf_token) = login(&server, "device-fp-1").await;

    // Mutating request without the header: rejected.
    let missing = server
        .post("/api/auth/logout")
        .add_header(COOKIE, cookie_header(&cookies))
        .await;
    missing.assert_status_forbidden();

    // Header present but wrong: rejected.
    let (name, value) = csrf_header("not-the-token");
    let wrong = server
        .post("/api/auth/logout")
        .add_header(COOKIE, cookie_header(&cookies))
        .add_header(name, value)
        .await;
    wrong.assert_status_forbidden();

    // Cookie and header agree: admitted.
    let (name, value) = csrf_header(&csrf_token);
    let ok = server
        .post("/api/auth/logout")
        .add_header(COOKIE, cookie_header(&cookies))
        .add_header(name, value)
        .await;
    ok.assert_status_ok();
}

#[tokio::test]
async fn test_complete_consumes_attempt() {
    let dir = TempDir::new().unwrap();
    let server = server_for(test_config(&dir, HAPPY_CLI));

    let start: Value = server.post("/api/authorize/start").await.json();
    let attempt_id = start["attempt_id"].as_str().unwrap().to_string();
    wait_for_terminal(&server, &attempt_id).await;

    let body = serde_json::json!({
        "attempt_id": attempt_id,
        "fingerprint": "device-fp-1",
    });
    let first = server.post("/api/authorize/complete").json(&body).await;
    first.assert_status_ok();

    let second = server.post("/api/authorize/complete").json(&body).await;
    second.assert_status_bad_request();
}

#[tokio::test]
async fn test_complete_requires_fingerprint() {
    let dir = TempDir::new().unwrap();
    let server = server_for(test_config(&dir, HAPPY_CLI));

    let start: Value = server.post("/api/authorize/start").await.json();
    let attempt_id = start["attempt_id"].as_str().unwrap().to_string();
    wait_for_terminal(&server, &attempt_id).await;

    let response = server
        .post("/api/authorize/complete")
        .json(&serde_json::json!({"attempt_id": attempt_id}))
        .await;
    response.assert_status_bad_request();
}

#[tokio::test]
async fn test_unmatched_groups_complete_unauthorized() {
    let dir = TempDir::new().unwrap();
    let server = server_for(test_config(&dir, UNAUTHORIZED_CLI));

    let start: Value = server.post("/api/authorize/start").await.json();
    let attempt_id = start["attempt_id"].as_str().unwrap().to_string();

    let status = wait_for_terminal(&server, &attempt_id).await;
    assert_eq!(status["state"], "completed");
    assert_eq!(status["authorized"], false);
    assert_eq!(status["message"], "User not authorized for any roles");

    let response = server
        .post("/api/authorize/complete")
        .json(&serde_json::json!({
            "attempt_id": attempt_id,
            "fingerprint": "device-fp-1",
        }))
        .await;
    response.assert_status_forbidden();
}

#[tokio::test]
async fn test_group_lookup_failure_errors_attempt() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir, GRAPH_DOWN_CLI);
    // A default role must not rescue a failed membership query.
    config.roles.default_role = Some("user".to_string());
    let server = server_for(config);

    let start: Value = server.post("/api/authorize/start").await.json();
    let attempt_id = start["attempt_id"].as_str().unwrap().to_string();

    let status = wait_for_terminal(&server, &attempt_id).await;
    assert_eq!(status["state"], "error");
    assert_eq!(status["authorized"], false);

    // No durable credential cache was promoted for the user.
    let users_dir = dir.path().join("azure-caches/users");
    assert!(!users_dir.exists() || users_dir.read_dir().unwrap().next().is_none());

    let response = server
        .post("/api/authorize/complete")
        .json(&serde_json::json!({
            "attempt_id": attempt_id,
            "fingerprint": "device-fp-1",
        }))
        .await;
    response.assert_status_bad_request();
}

#[tokio::test]
async fn test_start_fails_without_verification_url() {
    let dir = TempDir::new().unwrap();
    let server = server_for(test_config(&dir, CODE_ONLY_CLI));

    // A user code with no link to enter it at never satisfies the start
    // polling window.
    let response = server.post("/api/authorize/start").await;
    assert_eq!(
        response.status_code(),
        axum::http::StatusCode::INTERNAL_SERVER_ERROR
    );
}

#[tokio::test]
async fn test_empty_account_list_errors_attempt() {
    let dir = TempDir::new().unwrap();
    let server = server_for(test_config(&dir, NO_ACCOUNTS_CLI));

    let start: Value = server.post("/api/authorize/start").await.json();
    let attempt_id = start["attempt_id"].as_str().unwrap().to_string();

    let status = wait_for_terminal(&server, &attempt_id).await;
    assert_eq!(status["state"], "error");
}

#[tokio::test]
async fn test_login_timeout() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir, HANGING_CLI);
    config.azure.login_timeout_secs = 1;
    let server = server_for(config);

    let start: Value = server.post("/api/authorize/start").await.json();
    let attempt_id = start["attempt_id"].as_str().unwrap().to_string();
    assert_eq!(start["user_code"], "TEST-CODE");

    let status = wait_for_terminal(&server, &attempt_id).await;
    assert_eq!(status["state"], "timed_out");
}

#[tokio::test]
async fn test_unknown_attempt_status_is_404() {
    let dir = TempDir::new().unwrap();
    let server = server_for(test_config(&dir, HAPPY_CLI));

    let response = server.get("/api/authorize/status/no-such-attempt").await;
    response.assert_status_not_found();
}

#[tokio::test]
async fn test_rate_limit() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir, HAPPY_CLI);
    config.security.requests_per_minute = 3;
    let server = server_for(config);

    for _ in 0..3 {
        server.get("/api/health").await.assert_status_ok();
    }
    let limited = server.get("/api/health").await;
    assert_eq!(
        limited.status_code(),
        axum::http::StatusCode::TOO_MANY_REQUESTS
    );
}

#[tokio::test]
async fn test_protected_routes_require_session() {
    let dir = TempDir::new().unwrap();
    let server = server_for(test_config(&dir, HAPPY_CLI));

    server.get("/api/me").await.assert_status_unauthorized();
    server
        .get("/api/admin/sessions")
        .await
        .assert_status_unauthorized();

    // A fabricated session id is not honored.
    let response = server
        .get("/api/me")
        .add_header(COOKIE, HeaderValue::from_static("session_id=forged; fingerprint=fp"))
        .await;
    response.assert_status_unauthorized();
}
