//! Isolated Azure CLI credential caches.
//!
//! Every login attempt gets its own `AZURE_CONFIG_DIR` under
//! `<base>/attempts/<attempt-id>` so concurrent logins can never observe
//! each other's tokens. A successful, authorized attempt promotes its
//! cache to the durable per-user location `<base>/users/<identifier>`;
//! anything else is discarded.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::fs;
use tracing::{debug, warn};

static SANITIZE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9_.-]+").expect("valid sanitize regex"));

/// Return a filesystem-safe identifier string.
pub fn sanitize_identifier(identifier: &str) -> String {
    if identifier.is_empty() {
        return "anonymous".to_string();
    }
    let sanitized = SANITIZE_PATTERN
        .replace_all(identifier.trim().to_lowercase().as_str(), "_")
        .to_string();
    if sanitized.is_empty() {
        "anonymous".to_string()
    } else {
        sanitized
    }
}

/// Derive the durable per-user identifier from whichever identity fields
/// resolved, suffixed with a prefix of the object id to keep identifiers
/// distinct across users with colliding display names.
pub fn build_user_identifier(
    email: Option<&str>,
    username: Option<&str>,
    object_id: Option<&str>,
) -> String {
    let base = username
        .filter(|name| !name.trim().is_empty())
        .map(str::to_string)
        .or_else(|| {
            email
                .and_then(|mail| mail.split('@').next())
                .filter(|local| !local.is_empty())
                .map(str::to_string)
        })
        .or_else(|| object_id.map(str::to_string))
        .unwrap_or_else(|| "user".to_string());

    let suffix: String = object_id
        .unwrap_or_default()
        .replace('-', "")
        .chars()
        .take(12)
        .collect();

    let identifier = if suffix.is_empty() {
        base
    } else {
        format!("{}-{}", base.trim(), suffix)
    };
    sanitize_identifier(&identifier)
}

/// On-disk credential-cache manager.
#[derive(Debug, Clone)]
pub struct CredentialCache {
    base_dir: PathBuf,
}

impl CredentialCache {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Attempt-scoped cache directory for `attempt_id`.
    pub fn attempt_dir(&self, attempt_id: &str) -> PathBuf {
        self.base_dir
            .join("attempts")
            .join(sanitize_identifier(attempt_id))
    }

    /// Durable per-user cache directory for `identifier`.
    pub fn user_dir(&self, identifier: &str) -> PathBuf {
        self.base_dir.join("users").join(sanitize_identifier(identifier))
    }

    /// Create (and permission-restrict) the attempt-scoped directory.
    pub async fn create_attempt_dir(&self, attempt_id: &str) -> Result<PathBuf> {
        let dir = self.attempt_dir(attempt_id);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating attempt config dir {}", dir.display()))?;
        restrict_permissions(&dir).await;
        Ok(dir)
    }

    /// Promote an attempt-scoped cache to the per-user location.
    ///
    /// Any previous cache at the target is removed first; the move itself
    /// is a single rename, so readers only ever see a complete cache.
    /// Concurrent promotions to the same identifier are last-writer-wins.
    pub async fn promote(&self, attempt_dir: &Path, identifier: &str) -> Result<PathBuf> {
        let target = self.user_dir(identifier);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating user cache base {}", parent.display()))?;
        }
        if target.exists() {
            fs::remove_dir_all(&target)
                .await
                .with_context(|| format!("retiring previous cache {}", target.display()))?;
        }
        fs::rename(attempt_dir, &target).await.with_context(|| {
            format!(
                "promoting credential cache {} -> {}",
                attempt_dir.display(),
                target.display()
            )
        })?;
        restrict_permissions(&target).await;
        debug!(identifier = %identifier, "Promoted credential cache");
        Ok(target)
    }

    /// Best-effort removal of an attempt-scoped cache.
    pub async fn discard(&self, dir: &Path) {
        if !dir.exists() {
            return;
        }
        if let Err(e) = fs::remove_dir_all(dir).await {
            warn!(dir = %dir.display(), error = %e, "Failed to remove credential cache");
        }
    }
}

/// Restrict a cache directory to the current user. Some filesystems refuse
/// mode changes; that is not fatal.
async fn restrict_permissions(dir: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)).await {
            warn!(dir = %dir.display(), error = %e, "Failed to restrict cache permissions");
        }
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
}
