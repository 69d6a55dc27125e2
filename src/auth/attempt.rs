//! Login attempt records and their ephemeral store.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::security::random_token;

/// Lifecycle of one device-code login attempt.
///
/// Transitions are monotonic: `Starting -> WaitingForUser -> terminal`,
/// where `WaitingForUser` may be skipped when the CLI starts printing JSON
/// before a device code was observed. Terminal states never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    Starting,
    WaitingForUser,
    Completed,
    TimedOut,
    Error,
}

impl AttemptState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::TimedOut | Self::Error)
    }

    fn rank(self) -> u8 {
        match self {
            Self::Starting => 0,
            Self::WaitingForUser => 1,
            Self::Completed | Self::TimedOut | Self::Error => 2,
        }
    }

    /// Whether advancing to `next` preserves monotonicity.
    pub fn can_advance_to(self, next: Self) -> bool {
        next.rank() > self.rank()
    }
}

impl std::fmt::Display for AttemptState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Starting => "starting",
            Self::WaitingForUser => "waiting_for_user",
            Self::Completed => "completed",
            Self::TimedOut => "timed_out",
            Self::Error => "error",
        };
        write!(f, "{name}")
    }
}

/// One in-flight or finished login attempt.
///
/// Written exclusively by the orchestrator task; the completion handler
/// only reads it and finally consumes it via [`AuthAttemptStore::remove`].
#[derive(Debug, Clone, Serialize)]
pub struct AuthAttempt {
    pub id: String,
    pub state: AttemptState,
    pub user_code: Option<String>,
    pub verification_uri: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Set when the attempt reaches a terminal state; drives the sweep.
    pub finished_at: Option<DateTime<Utc>>,
    /// Only meaningful in `Completed`.
    pub authorized: bool,
    pub email: Option<String>,
    pub username: Option<String>,
    pub roles: BTreeSet<String>,
    pub object_id: Option<String>,
    pub tenant_id: Option<String>,
    /// Durable credential-cache handle, set once promotion succeeded.
    pub user_identifier: Option<String>,
    pub message: Option<String>,
}

impl AuthAttempt {
    pub fn new() -> Self {
        Self {
            id: random_token(),
            state: AttemptState::Starting,
            user_code: None,
            verification_uri: None,
            created_at: Utc::now(),
            finished_at: None,
            authorized: false,
            email: None,
            username: None,
            roles: BTreeSet::new(),
            object_id: None,
            tenant_id: None,
            user_identifier: None,
            message: None,
        }
    }
}

impl Default for AuthAttempt {
    fn default() -> Self {
        Self::new()
    }
}

struct AttemptEntry {
    attempt: AuthAttempt,
    /// Handle of the detached orchestration task, retained so eviction can
    /// act on the task and not just the spawned OS process.
    task: Option<JoinHandle<()>>,
}

/// Ephemeral keyed store of login attempts.
///
/// Written by the orchestrator background tasks, read by the status and
/// completion handlers. Entries are consumed by a successful completion or
/// evicted by [`AuthAttemptStore::sweep`].
#[derive(Default)]
pub struct AuthAttemptStore {
    entries: DashMap<String, AttemptEntry>,
}

impl AuthAttemptStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, attempt: AuthAttempt) {
        self.entries.insert(
            attempt.id.clone(),
            AttemptEntry {
                attempt,
                task: None,
            },
        );
    }

    /// Attach the orchestration task handle to an existing attempt.
    pub fn attach_task(&self, id: &str, task: JoinHandle<()>) {
        if let Some(mut entry) = self.entries.get_mut(id) {
            entry.task = Some(task);
        } else {
            // Attempt vanished before the task was registered; nothing to
            // track, let the task run to its own cleanup.
            warn!(attempt_id = %id, "Attempt removed before task handle attach");
            task.abort();
        }
    }

    pub fn get(&self, id: &str) -> Option<AuthAttempt> {
        self.entries.get(id).map(|entry| entry.attempt.clone())
    }

    /// Advance an attempt to `next`, applying `f` to the record under the
    /// same lock. Regressions (and transitions out of a terminal state)
    /// are refused.
    pub fn advance<F>(&self, id: &str, next: AttemptState, f: F) -> bool
    where
        F: FnOnce(&mut AuthAttempt),
    {
        let Some(mut entry) = self.entries.get_mut(id) else {
            return false;
        };
        let current = entry.attempt.state;
        if !current.can_advance_to(next) {
            warn!(
                attempt_id = %id,
                %current,
                requested = %next,
                "Refusing non-monotonic attempt state transition"
            );
            return false;
        }
        entry.attempt.state = next;
        if next.is_terminal() {
            entry.attempt.finished_at = Some(Utc::now());
        }
        f(&mut entry.attempt);
        debug!(attempt_id = %id, from = %current, to = %next, "Attempt state advanced");
        true
    }

    /// Remove and return an attempt, aborting its task if still attached.
    pub fn remove(&self, id: &str) -> Option<AuthAttempt> {
        let (_, entry) = self.entries.remove(id)?;
        if let Some(task) = entry.task {
            task.abort();
        }
        Some(entry.attempt)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Evict attempts whose terminal state is older than `ttl`, plus any
    /// attempt (terminal or not) created more than `ttl` before now.
    /// The latter covers orchestration tasks that died without finishing.
    /// Returns the evicted records so the caller can release whatever
    /// resources they still hold.
    pub fn sweep(&self, ttl: Duration) -> Vec<AuthAttempt> {
        let cutoff = Utc::now() - ttl;
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| match entry.attempt.finished_at {
                Some(finished) => finished < cutoff,
                None => entry.attempt.created_at < cutoff,
            })
            .map(|entry| entry.attempt.id.clone())
            .collect();

        let mut swept = Vec::with_capacity(expired.len());
        for id in expired {
            if let Some(attempt) = self.remove(&id) {
                debug!(attempt_id = %id, "Swept expired login attempt");
                swept.push(attempt);
            }
        }
        swept
    }
}
