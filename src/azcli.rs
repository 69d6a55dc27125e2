//! Thin runner for Azure CLI invocations against an isolated config dir.
//!
//! The CLI itself is the external collaborator: it owns the device-code
//! protocol, the Graph calls, and the token cache. This module only
//! spawns it with `AZURE_CONFIG_DIR` pointed at the right cache and
//! parses the JSON it prints.

use std::path::Path;
use std::process::Stdio;

use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Failure of a single CLI invocation.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("failed to spawn '{binary}': {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },
    #[error("command failed: {0}")]
    Failed(String),
    #[error("unable to parse Azure CLI response: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Azure CLI invoker bound to a binary path.
#[derive(Debug, Clone)]
pub struct AzCli {
    binary: String,
}

impl AzCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Run a CLI command to completion and return its stdout.
    pub async fn run(&self, args: &[&str], config_dir: &Path) -> Result<String, CliError> {
        debug!(binary = %self.binary, ?args, "Executing Azure CLI command");
        let output = Command::new(&self.binary)
            .args(args)
            .env("AZURE_CONFIG_DIR", config_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| CliError::Spawn {
                binary: self.binary.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let message = if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            return Err(CliError::Failed(message));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Resolve the signed-in user's identity from the CLI cache.
    pub async fn signed_in_user(&self, config_dir: &Path) -> Result<SignedInUser, CliError> {
        let raw = self
            .run(&["ad", "signed-in-user", "show", "--output", "json"], config_dir)
            .await?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Resolve group memberships via Graph, filtered to group entries.
    pub async fn member_group_ids(
        &self,
        graph_resource: &str,
        object_id: &str,
        config_dir: &Path,
    ) -> Result<Vec<String>, CliError> {
        let uri = format!("{graph_resource}/v1.0/users/{object_id}/memberOf");
        let raw = self
            .run(
                &[
                    "rest",
                    "--method",
                    "GET",
                    "--uri",
                    &uri,
                    "--headers",
                    "ConsistencyLevel=eventual",
                ],
                config_dir,
            )
            .await?;
        let response: MemberOfResponse = serde_json::from_str(&raw)?;
        Ok(response
            .value
            .into_iter()
            .filter(|entry| entry.odata_type.as_deref() == Some("#microsoft.graph.group"))
            .filter_map(|entry| entry.id)
            .collect())
    }

    /// Mint an access token for `resource` from the given credential cache.
    pub async fn access_token(
        &self,
        resource: &str,
        tenant_id: Option<&str>,
        config_dir: &Path,
    ) -> Result<String, CliError> {
        let mut args = vec![
            "account",
            "get-access-token",
            "--resource",
            resource,
            "--output",
            "json",
        ];
        if let Some(tenant) = tenant_id {
            args.push("--tenant");
            args.push(tenant);
        }
        let raw = self.run(&args, config_dir).await?;
        let token: AccessToken = serde_json::from_str(&raw)?;
        Ok(token.access_token)
    }
}

/// `az ad signed-in-user show` payload (the fields we consume).
#[derive(Debug, Clone, Deserialize)]
pub struct SignedInUser {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, rename = "objectId")]
    pub object_id: Option<String>,
    #[serde(default, rename = "userPrincipalName")]
    pub user_principal_name: Option<String>,
    #[serde(default)]
    pub mail: Option<String>,
    #[serde(default, rename = "mailNickname")]
    pub mail_nickname: Option<String>,
    #[serde(default, rename = "tenantId")]
    pub tenant_id: Option<String>,
}

impl SignedInUser {
    /// Object id, tolerating both Graph and legacy field names.
    pub fn resolved_object_id(&self) -> Option<&str> {
        self.id.as_deref().or(self.object_id.as_deref())
    }

    pub fn resolved_email(&self) -> Option<&str> {
        self.user_principal_name.as_deref().or(self.mail.as_deref())
    }

    /// Display name, falling back to the email local part.
    pub fn resolved_username(&self) -> Option<String> {
        self.mail_nickname.clone().or_else(|| {
            self.resolved_email()
                .and_then(|mail| mail.split('@').next())
                .map(str::to_string)
        })
    }
}

/// One entry of a login's account list (`az login` output).
#[derive(Debug, Clone, Deserialize)]
pub struct AzAccount {
    #[serde(default, rename = "tenantId")]
    pub tenant_id: Option<String>,
    #[serde(default, rename = "homeTenantId")]
    pub home_tenant_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MemberOfResponse {
    #[serde(default)]
    value: Vec<MemberOfEntry>,
}

#[derive(Debug, Deserialize)]
struct MemberOfEntry {
    #[serde(default)]
    id: Option<String>,
    #[serde(default, rename = "@odata.type")]
    odata_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AccessToken {
    #[serde(rename = "accessToken")]
    access_token: String,
}
