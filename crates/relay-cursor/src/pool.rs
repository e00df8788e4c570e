//! Shared pool of scraped Cursor browser sessions.
//!
//! Mutations are serialised behind one lock; reads may proceed concurrently.
//! Eviction is counter-driven: a session whose failure count reaches the
//! threshold stops being selectable until an admin reload replaces it.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::RwLock;

use relay_core::{current_unix_timestamp, current_unix_timestamp_ms, is_expired_unix, mix64};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

/// Consecutive-failure budget before a session is demoted.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `SessionStatus` values.
pub enum SessionStatus {
    Valid,
    Invalid,
}

fn default_status() -> SessionStatus {
    SessionStatus::Valid
}

/// One scraped browser session. Email and token are the stable identity;
/// only the counters mutate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CursorSession {
    pub email: String,
    pub token: String,
    #[serde(default)]
    pub extra_cookies: BTreeMap<String, String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default = "default_status")]
    pub status: SessionStatus,
    #[serde(default)]
    pub success_count: u32,
    #[serde(default)]
    pub failure_count: u32,
    #[serde(default)]
    pub last_used_unix_ms: u64,
    #[serde(default)]
    pub expires_at_unix: Option<u64>,
}

impl CursorSession {
    pub fn new(email: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            token: token.into(),
            extra_cookies: BTreeMap::new(),
            user_agent: None,
            status: SessionStatus::Valid,
            success_count: 0,
            failure_count: 0,
            last_used_unix_ms: 0,
            expires_at_unix: None,
        }
    }

    fn selectable(&self, now_unix: u64) -> bool {
        self.status == SessionStatus::Valid && !is_expired_unix(self.expires_at_unix, now_unix)
    }
}

#[derive(Debug, Error)]
#[error("no valid cursor session available")]
pub struct NoSessionError;

/// Failures reloading the session file.
#[derive(Debug, Error)]
pub enum ReloadError {
    #[error("no sessions file configured")]
    NotConfigured,
    #[error("failed to read sessions file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse sessions file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Thread-safe `email → session` pool.
pub struct SessionPool {
    sessions: RwLock<HashMap<String, CursorSession>>,
    failure_threshold: u32,
    sessions_file: Option<PathBuf>,
}

impl SessionPool {
    pub fn new(failure_threshold: u32, sessions_file: Option<PathBuf>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            failure_threshold: failure_threshold.max(1),
            sessions_file,
        }
    }

    pub fn has_valid_sessions(&self) -> bool {
        let now = current_unix_timestamp();
        self.sessions
            .read()
            .expect("session pool lock poisoned")
            .values()
            .any(|session| session.selectable(now))
    }

    /// Counts `(selectable, total)` for the status plane.
    pub fn counts(&self) -> (usize, usize) {
        let now = current_unix_timestamp();
        let sessions = self.sessions.read().expect("session pool lock poisoned");
        let valid = sessions
            .values()
            .filter(|session| session.selectable(now))
            .count();
        (valid, sessions.len())
    }

    /// Picks a selectable session: lowest failure count first, then oldest
    /// last use, randomised among exact ties.
    pub fn get_valid_session(&self) -> Result<CursorSession, NoSessionError> {
        let now = current_unix_timestamp();
        let sessions = self.sessions.read().expect("session pool lock poisoned");
        let best_key = sessions
            .values()
            .filter(|session| session.selectable(now))
            .map(|session| (session.failure_count, session.last_used_unix_ms))
            .min();
        let Some(best_key) = best_key else {
            return Err(NoSessionError);
        };
        let ties: Vec<&CursorSession> = sessions
            .values()
            .filter(|session| {
                session.selectable(now)
                    && (session.failure_count, session.last_used_unix_ms) == best_key
            })
            .collect();
        let pick = (mix64() % ties.len() as u64) as usize;
        Ok(ties[pick].clone())
    }

    /// Records a successful call through `email`.
    pub fn mark_success(&self, email: &str) {
        let mut sessions = self.sessions.write().expect("session pool lock poisoned");
        if let Some(session) = sessions.get_mut(email) {
            session.success_count = session.success_count.saturating_add(1);
            session.last_used_unix_ms = current_unix_timestamp_ms();
        }
    }

    /// Records a failed call through `email`, demoting at the threshold.
    pub fn mark_failed(&self, email: &str) {
        let mut sessions = self.sessions.write().expect("session pool lock poisoned");
        if let Some(session) = sessions.get_mut(email) {
            session.failure_count = session.failure_count.saturating_add(1);
            if session.failure_count >= self.failure_threshold {
                session.status = SessionStatus::Invalid;
                warn!(
                    email,
                    failures = session.failure_count,
                    "cursor session demoted"
                );
            }
        }
    }

    pub fn add(&self, session: CursorSession) {
        let mut sessions = self.sessions.write().expect("session pool lock poisoned");
        sessions.insert(session.email.clone(), session);
    }

    pub fn remove(&self, email: &str) -> bool {
        let mut sessions = self.sessions.write().expect("session pool lock poisoned");
        sessions.remove(email).is_some()
    }

    /// Replaces the pool contents from the configured JSON file.
    ///
    /// Counters restart from the file's values (usually zero), which is the
    /// admin-plane recovery path for demoted sessions.
    pub fn reload(&self) -> Result<usize, ReloadError> {
        let path = self
            .sessions_file
            .as_ref()
            .ok_or(ReloadError::NotConfigured)?;
        let raw = std::fs::read_to_string(path)?;
        let loaded: Vec<CursorSession> = serde_json::from_str(&raw)?;
        let count = loaded.len();

        let mut sessions = self.sessions.write().expect("session pool lock poisoned");
        sessions.clear();
        for session in loaded {
            sessions.insert(session.email.clone(), session);
        }
        info!(count, path = %path.display(), "cursor sessions reloaded");
        Ok(count)
    }

    /// Snapshot of one session's counters, for tests and the admin plane.
    pub fn snapshot(&self, email: &str) -> Option<CursorSession> {
        self.sessions
            .read()
            .expect("session pool lock poisoned")
            .get(email)
            .cloned()
    }
}
