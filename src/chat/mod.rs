//! Azure OpenAI pass-through.
//!
//! Chat requests are forwarded to an Azure OpenAI deployment using a
//! bearer token minted from the calling user's own promoted credential
//! cache, so every upstream call is attributable to that user. Tokens
//! are cached briefly per user to keep chat latency off the CLI path.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::auth::credentials::CredentialCache;
use crate::azcli::AzCli;
use crate::config::ChatConfig;

const TOKEN_CACHE_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("chat endpoint is not configured")]
    NotConfigured,
    #[error("unable to acquire access token: {0}")]
    Credential(String),
    #[error("upstream chat request failed: {0}")]
    Upstream(String),
}

/// Reply returned to the chat handler.
#[derive(Debug, Clone, Serialize)]
pub struct ChatReply {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<ChatUsage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct CompletionsResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: String,
}

struct CachedToken {
    token: String,
    fetched: Instant,
}

pub struct ChatService {
    config: ChatConfig,
    cli: AzCli,
    credentials: CredentialCache,
    http: reqwest::Client,
    tokens: DashMap<String, CachedToken>,
}

impl ChatService {
    pub fn new(config: ChatConfig, cli: AzCli, credentials: CredentialCache) -> Self {
        Self {
            config,
            cli,
            credentials,
            http: reqwest::Client::new(),
            tokens: DashMap::new(),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.config.endpoint.is_some() && self.config.deployment.is_some()
    }

    /// Forward one user message to the configured deployment.
    pub async fn complete(
        &self,
        user_identifier: &str,
        tenant_id: Option<&str>,
        message: &str,
    ) -> Result<ChatReply, ChatError> {
        let (Some(endpoint), Some(deployment)) =
            (self.config.endpoint.as_deref(), self.config.deployment.as_deref())
        else {
            return Err(ChatError::NotConfigured);
        };

        let token = self.user_token(user_identifier, tenant_id).await?;
        let url = format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            endpoint.trim_end_matches('/'),
            deployment,
            self.config.api_version
        );

        let body = json!({
            "messages": [{"role": "user", "content": message}],
            "temperature": self.config.temperature,
        });

        let response = self
            .http
            .post(&url)
            .bearer_auth(&token)
            .header("x-ms-client-request-id", Uuid::new_v4().to_string())
            .json(&body)
            .send()
            .await
            .map_err(|e| ChatError::Upstream(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            // A rejected token may simply have aged out upstream.
            if status.as_u16() == 401 {
                self.tokens.remove(user_identifier);
            }
            let detail = response.text().await.unwrap_or_default();
            warn!(%status, "Chat upstream returned an error");
            return Err(ChatError::Upstream(format!("{status}: {detail}")));
        }

        let completions: CompletionsResponse = response
            .json()
            .await
            .map_err(|e| ChatError::Upstream(format!("invalid completions payload: {e}")))?;

        let content = completions
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| ChatError::Upstream("completions response had no choices".to_string()))?;

        Ok(ChatReply {
            content,
            usage: completions.usage,
        })
    }

    /// Access token for the user's cache, reusing a recent one when fresh.
    async fn user_token(
        &self,
        user_identifier: &str,
        tenant_id: Option<&str>,
    ) -> Result<String, ChatError> {
        if let Some(cached) = self.tokens.get(user_identifier) {
            if cached.fetched.elapsed() < TOKEN_CACHE_TTL {
                debug!(user = %user_identifier, "Reusing cached access token");
                return Ok(cached.token.clone());
            }
        }

        let config_dir = self.credentials.user_dir(user_identifier);
        if !config_dir.is_dir() {
            return Err(ChatError::Credential(format!(
                "no credential cache for user {user_identifier}"
            )));
        }

        let token = self
            .cli
            .access_token(&self.config.token_resource, tenant_id, &config_dir)
            .await
            .map_err(|e| ChatError::Credential(e.to_string()))?;

        self.tokens.insert(
            user_identifier.to_string(),
            CachedToken {
                token: token.clone(),
                fetched: Instant::now(),
            },
        );
        Ok(token)
    }
}
