//! Device-code login orchestration.
//!
//! Each login attempt spawns `az login --use-device-code` with an
//! attempt-scoped `AZURE_CONFIG_DIR`, scrapes the device code and
//! verification URL from the CLI's streamed output, and waits for the
//! account JSON the CLI prints once the user approves in the browser.
//! The whole drive (spawn, stream scan, process exit) runs under a single
//! timeout; identity resolution and credential promotion follow.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, error, info};

use crate::auth::attempt::{AttemptState, AuthAttempt, AuthAttemptStore};
use crate::auth::credentials::{build_user_identifier, CredentialCache};
use crate::auth::error::LoginError;
use crate::auth::roles::RoleResolver;
use crate::azcli::{AzAccount, AzCli};
use crate::config::AzureConfig;

static DEVICE_CODE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"code\s+([A-Z0-9\-]+)").expect("valid device code regex"));
static VERIFICATION_URL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(https?://\S+)").expect("valid verification url regex"));

/// Device prompt scraped from the CLI's progress lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevicePrompt {
    pub user_code: String,
    pub verification_uri: String,
}

/// Line-by-line scanner over the CLI's merged output.
///
/// Progress lines are matched for the device code and verification URL.
/// The first line opening a JSON value flips the scanner into payload
/// mode; from then on every line is buffered verbatim and prompt matching
/// stops, so URLs inside the account JSON are never mistaken for the
/// verification link.
#[derive(Debug, Default)]
struct OutputScanner {
    seen_json: bool,
    payload: Vec<String>,
    user_code: Option<String>,
    verification_uri: Option<String>,
    prompt_emitted: bool,
}

impl OutputScanner {
    fn new() -> Self {
        Self::default()
    }

    /// Feed one output line; returns the device prompt once both the user
    /// code and the verification URL are known. A code without a URL (or
    /// vice versa) is not a usable prompt, so nothing is emitted until the
    /// pair is complete.
    fn observe(&mut self, line: &str) -> Option<DevicePrompt> {
        if self.seen_json {
            self.payload.push(line.to_string());
            return None;
        }

        let trimmed = line.trim_start();
        if trimmed.starts_with('[') || trimmed.starts_with('{') {
            self.seen_json = true;
            self.payload.push(line.to_string());
            return None;
        }

        if self.verification_uri.is_none() {
            if let Some(caps) = VERIFICATION_URL_PATTERN.captures(line) {
                self.verification_uri = Some(caps[1].trim_end_matches('.').to_string());
            }
        }
        if self.user_code.is_none() {
            if let Some(caps) = DEVICE_CODE_PATTERN.captures(line) {
                self.user_code = Some(caps[1].to_string());
            }
        }

        if !self.prompt_emitted {
            if let (Some(code), Some(uri)) = (&self.user_code, &self.verification_uri) {
                self.prompt_emitted = true;
                return Some(DevicePrompt {
                    user_code: code.clone(),
                    verification_uri: uri.clone(),
                });
            }
        }
        None
    }

    fn payload(&self) -> String {
        self.payload.join("\n")
    }
}

/// Identity resolved from a successful login.
#[derive(Debug)]
struct LoginOutcome {
    email: Option<String>,
    username: Option<String>,
    object_id: Option<String>,
    tenant_id: Option<String>,
    roles: std::collections::BTreeSet<String>,
}

/// Drives device-code logins end to end.
pub struct DeviceLoginOrchestrator {
    azure: AzureConfig,
    cli: AzCli,
    attempts: Arc<AuthAttemptStore>,
    credentials: CredentialCache,
    roles: RoleResolver,
}

impl DeviceLoginOrchestrator {
    pub fn new(
        azure: AzureConfig,
        attempts: Arc<AuthAttemptStore>,
        credentials: CredentialCache,
        roles: RoleResolver,
    ) -> Self {
        let cli = AzCli::new(azure.binary.clone());
        Self {
            azure,
            cli,
            attempts,
            credentials,
            roles,
        }
    }

    /// Begin a new login attempt. Returns the attempt id; the login itself
    /// runs on a detached task tracked by the attempt store.
    pub async fn start(self: Arc<Self>) -> Result<String, LoginError> {
        let attempt = AuthAttempt::new();
        let attempt_id = attempt.id.clone();
        let config_dir = self.credentials.create_attempt_dir(&attempt_id).await.map_err(
            |e| LoginError::Protocol(format!("unable to create credential cache: {e}")),
        )?;

        self.attempts.insert(attempt);
        info!(attempt_id = %attempt_id, "Starting device code login");

        let orchestrator = Arc::clone(&self);
        let task_id = attempt_id.clone();
        let task = tokio::spawn(async move {
            orchestrator.run_login(task_id, config_dir).await;
        });
        self.attempts.attach_task(&attempt_id, task);

        Ok(attempt_id)
    }

    /// Evict expired attempts and remove the attempt-scoped caches they
    /// leave behind. Eviction aborts a still-running orchestration task
    /// before it reaches its own discard, so the sweep discards for it.
    /// Promoted attempts no longer own their attempt directory.
    pub async fn sweep_expired(&self, ttl: chrono::Duration) -> usize {
        let swept = self.attempts.sweep(ttl);
        for attempt in &swept {
            if attempt.user_identifier.is_none() {
                let dir = self.credentials.attempt_dir(&attempt.id);
                self.credentials.discard(&dir).await;
            }
        }
        swept.len()
    }

    /// Full lifecycle of one attempt: drive the CLI, resolve identity,
    /// promote or discard the credential cache, record the terminal state.
    async fn run_login(&self, attempt_id: String, config_dir: PathBuf) {
        let timeout = Duration::from_secs(self.azure.login_timeout_secs);
        let mut promoted = false;

        let result = match tokio::time::timeout(
            timeout,
            self.drive_login(&attempt_id, &config_dir),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(LoginError::Timeout),
        };

        let result = match result {
            Ok(accounts) => match self.finalize_login(&accounts, &config_dir).await {
                Ok(outcome) => {
                    // Missing email means the identity never resolved; both
                    // cases are protocol successes that end unauthorized.
                    if outcome.email.is_none() || outcome.roles.is_empty() {
                        info!(
                            attempt_id = %attempt_id,
                            email = ?outcome.email,
                            "Login completed but user matched no roles"
                        );
                        self.attempts.advance(&attempt_id, AttemptState::Completed, |a| {
                            a.authorized = false;
                            a.email = outcome.email.clone();
                            a.username = outcome.username.clone();
                            a.object_id = outcome.object_id.clone();
                            a.tenant_id = outcome.tenant_id.clone();
                            a.message = Some(if outcome.email.is_none() {
                                "Unable to resolve signed-in user identity".to_string()
                            } else {
                                "User not authorized for any roles".to_string()
                            });
                        });
                        Ok(())
                    } else {
                        let identifier = build_user_identifier(
                            outcome.email.as_deref(),
                            outcome.username.as_deref(),
                            outcome.object_id.as_deref(),
                        );
                        match self.credentials.promote(&config_dir, &identifier).await {
                            Ok(_) => {
                                promoted = true;
                                info!(
                                    attempt_id = %attempt_id,
                                    user = %identifier,
                                    roles = ?outcome.roles,
                                    "Login completed and authorized"
                                );
                                self.attempts.advance(
                                    &attempt_id,
                                    AttemptState::Completed,
                                    |a| {
                                        a.authorized = true;
                                        a.email = outcome.email.clone();
                                        a.username = outcome.username.clone();
                                        a.object_id = outcome.object_id.clone();
                                        a.tenant_id = outcome.tenant_id.clone();
                                        a.roles = outcome.roles.clone();
                                        a.user_identifier = Some(identifier.clone());
                                        a.message = Some("Login successful".to_string());
                                    },
                                );
                                Ok(())
                            }
                            Err(e) => Err(LoginError::Protocol(format!(
                                "failed to persist credentials: {e}"
                            ))),
                        }
                    }
                }
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            let state = match e {
                LoginError::Timeout => AttemptState::TimedOut,
                _ => AttemptState::Error,
            };
            error!(attempt_id = %attempt_id, error = %e, "Login attempt failed");
            let message = match &e {
                LoginError::Timeout => "Login timed out".to_string(),
                other => other.to_string(),
            };
            self.attempts.advance(&attempt_id, state, |a| {
                a.message = Some(message.clone());
            });
        }

        if !promoted {
            self.credentials.discard(&config_dir).await;
        }
    }

    /// Spawn the CLI and scan its output until the account JSON arrives.
    async fn drive_login(
        &self,
        attempt_id: &str,
        config_dir: &Path,
    ) -> Result<Vec<AzAccount>, LoginError> {
        let mut child = Command::new(self.cli.binary())
            .args(["login", "--use-device-code", "--output", "json"])
            .env("AZURE_CONFIG_DIR", config_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let scan = self.scan_output(attempt_id, &mut child).await;
        let scanner = match scan {
            Ok(scanner) => scanner,
            Err(e) => {
                let _ = child.kill().await;
                return Err(e);
            }
        };

        let status = child.wait().await?;
        if !status.success() {
            let detail = scanner
                .payload
                .last()
                .cloned()
                .unwrap_or_else(|| format!("az login exited with {status}"));
            return Err(LoginError::Protocol(detail));
        }

        let payload = scanner.payload();
        if payload.trim().is_empty() {
            return Err(LoginError::Protocol(
                "No JSON payload returned from az login".to_string(),
            ));
        }
        let accounts: Vec<AzAccount> = serde_json::from_str(&payload)
            .map_err(|e| LoginError::Protocol(format!("unable to parse login payload: {e}")))?;
        if accounts.is_empty() {
            return Err(LoginError::Protocol(
                "Unexpected login response: no accounts returned".to_string(),
            ));
        }
        Ok(accounts)
    }

    /// Merge stdout and stderr line streams through one scanner; the CLI
    /// prints the device prompt on stderr and the account JSON on stdout.
    async fn scan_output(
        &self,
        attempt_id: &str,
        child: &mut Child,
    ) -> Result<OutputScanner, LoginError> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LoginError::Protocol("login stdout unavailable".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| LoginError::Protocol("login stderr unavailable".to_string()))?;

        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();
        let mut stdout_done = false;
        let mut stderr_done = false;
        let mut scanner = OutputScanner::new();

        while !(stdout_done && stderr_done) {
            let line = tokio::select! {
                line = stdout_lines.next_line(), if !stdout_done => match line? {
                    Some(line) => line,
                    None => {
                        stdout_done = true;
                        continue;
                    }
                },
                line = stderr_lines.next_line(), if !stderr_done => match line? {
                    Some(line) => line,
                    None => {
                        stderr_done = true;
                        continue;
                    }
                },
            };

            debug!(attempt_id = %attempt_id, line = %line, "az login output");
            if let Some(prompt) = scanner.observe(&line) {
                info!(
                    attempt_id = %attempt_id,
                    user_code = %prompt.user_code,
                    "Device code received, waiting for user"
                );
                self.attempts
                    .advance(attempt_id, AttemptState::WaitingForUser, |a| {
                        a.user_code = Some(prompt.user_code.clone());
                        a.verification_uri = Some(prompt.verification_uri.clone());
                    });
            }
        }

        Ok(scanner)
    }

    /// Resolve the identity and roles behind a freshly logged-in cache.
    async fn finalize_login(
        &self,
        accounts: &[AzAccount],
        config_dir: &Path,
    ) -> Result<LoginOutcome, LoginError> {
        let user = self.cli.signed_in_user(config_dir).await?;
        let object_id = user.resolved_object_id().map(str::to_string);
        let email = user.resolved_email().map(str::to_string);
        let username = user.resolved_username();

        let tenant_id = accounts
            .iter()
            .find_map(|a| a.tenant_id.clone().or_else(|| a.home_tenant_id.clone()))
            .or_else(|| user.tenant_id.clone());

        // A failed membership query must not fall through to the default
        // role; the attempt ends in error instead.
        let group_ids = match &object_id {
            Some(oid) => {
                self.cli
                    .member_group_ids(&self.azure.graph_resource, oid, config_dir)
                    .await?
            }
            None => Vec::new(),
        };

        let roles = self.roles.resolve(group_ids.iter().map(String::as_str));

        Ok(LoginOutcome {
            email,
            username,
            object_id,
            tenant_id,
            roles,
        })
    }
}
