//! Application configuration.
//!
//! Loaded from a TOML file with `AZGATE`-prefixed environment overrides
//! (e.g. `AZGATE_SECURITY__PRODUCTION=true`). Every section has working
//! defaults so a bare `azgate serve` runs in development mode.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub security: SecurityConfig,
    pub azure: AzureConfig,
    pub roles: RolesConfig,
    pub chat: ChatConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host address to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    /// Allowed CORS origins. Empty means no cross-origin access.
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            allowed_origins: vec!["http://localhost:3000".to_string()],
        }
    }
}

/// Security gate settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Production hardening: `__Host-` cookie prefix, Secure flag,
    /// SameSite=Strict. Leave off for http://localhost development.
    pub production: bool,
    /// Sliding-window rate limit per client, per 60 seconds.
    pub requests_per_minute: usize,
    /// Max-Age for session/fingerprint/csrf cookies, in seconds.
    pub cookie_max_age_secs: u64,
    /// Sessions idle longer than this are evicted by the sweep task.
    pub session_idle_ttl_secs: u64,
    /// Terminal (or abandoned) login attempts older than this are evicted.
    pub attempt_ttl_secs: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            production: false,
            requests_per_minute: 100,
            cookie_max_age_secs: 60 * 60 * 24,
            session_idle_ttl_secs: 60 * 60 * 24,
            attempt_ttl_secs: 15 * 60,
        }
    }
}

/// Azure CLI integration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AzureConfig {
    /// Azure CLI binary. A full path may be given; tests substitute a fake.
    pub binary: String,
    /// Base directory for isolated `AZURE_CONFIG_DIR` credential caches.
    pub config_base_dir: PathBuf,
    /// Overall bound for one device-code login attempt, in seconds.
    pub login_timeout_secs: u64,
    /// Microsoft Graph resource base used for the memberOf query.
    pub graph_resource: String,
    /// How many times the start handler polls for the device code.
    pub start_poll_attempts: u32,
    /// Interval between start-handler polls, in milliseconds.
    pub start_poll_interval_ms: u64,
}

impl Default for AzureConfig {
    fn default() -> Self {
        Self {
            binary: "az".to_string(),
            config_base_dir: PathBuf::from("/tmp/azgate"),
            login_timeout_secs: 300,
            graph_resource: "https://graph.microsoft.com".to_string(),
            start_poll_attempts: 50,
            start_poll_interval_ms: 200,
        }
    }
}

/// Role resolution settings.
///
/// `mappings` takes role names to the Entra ID group object ids that grant
/// them. `default_role` is assigned when no mapping matches; leave it unset
/// to keep unmapped users unauthorized.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RolesConfig {
    pub mappings: BTreeMap<String, Vec<String>>,
    pub default_role: Option<String>,
}

impl Default for RolesConfig {
    fn default() -> Self {
        Self {
            mappings: BTreeMap::new(),
            default_role: None,
        }
    }
}

/// Azure OpenAI pass-through settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Azure OpenAI endpoint, e.g. `https://myresource.openai.azure.com`.
    /// Unset disables the `/api/chat` endpoint.
    pub endpoint: Option<String>,
    /// Deployment (model) name.
    pub deployment: Option<String>,
    /// API version query parameter.
    pub api_version: String,
    /// Tenant override for token acquisition.
    pub tenant_id: Option<String>,
    /// Resource scope for `az account get-access-token`.
    pub token_resource: String,
    /// Sampling temperature.
    pub temperature: f32,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            deployment: None,
            api_version: "2024-06-01".to_string(),
            tenant_id: None,
            token_resource: "https://cognitiveservices.azure.com".to_string(),
            temperature: 0.2,
        }
    }
}

impl AppConfig {
    /// Validate settings that would otherwise fail at an awkward moment.
    pub fn validate(&self) -> Result<(), String> {
        if self.security.requests_per_minute == 0 {
            return Err("security.requests_per_minute must be at least 1".to_string());
        }
        if self.azure.login_timeout_secs == 0 {
            return Err("azure.login_timeout_secs must be at least 1".to_string());
        }
        if self.chat.endpoint.is_some() && self.chat.deployment.is_none() {
            return Err("chat.deployment is required when chat.endpoint is set".to_string());
        }
        Ok(())
    }
}
