//! Application state shared across handlers.

use std::sync::Arc;

use crate::auth::attempt::AuthAttemptStore;
use crate::auth::credentials::CredentialCache;
use crate::auth::orchestrator::DeviceLoginOrchestrator;
use crate::auth::roles::RoleResolver;
use crate::azcli::AzCli;
use crate::chat::ChatService;
use crate::config::AppConfig;
use crate::security::RateLimiter;
use crate::session::SessionStore;

/// Shared state for the API layer.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub attempts: Arc<AuthAttemptStore>,
    pub sessions: Arc<SessionStore>,
    pub orchestrator: Arc<DeviceLoginOrchestrator>,
    pub rate_limiter: Arc<RateLimiter>,
    pub chat: Arc<ChatService>,
}

impl AppState {
    /// Wire up the stores and services from configuration.
    pub fn from_config(config: AppConfig) -> Self {
        let config = Arc::new(config);
        let attempts = Arc::new(AuthAttemptStore::new());
        let sessions = Arc::new(SessionStore::new());
        let credentials = CredentialCache::new(config.azure.config_base_dir.clone());
        let roles = RoleResolver::new(config.roles.clone());

        let orchestrator = Arc::new(DeviceLoginOrchestrator::new(
            config.azure.clone(),
            Arc::clone(&attempts),
            credentials.clone(),
            roles,
        ));
        let chat = Arc::new(ChatService::new(
            config.chat.clone(),
            AzCli::new(config.azure.binary.clone()),
            credentials,
        ));
        let rate_limiter = Arc::new(RateLimiter::new(config.security.requests_per_minute));

        Self {
            config,
            attempts,
            sessions,
            orchestrator,
            rate_limiter,
            chat,
        }
    }
}
