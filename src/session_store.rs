//! Multi-turn session persistence.
//!
//! Sessions record the rolling history of `(goal, response)` turns, the
//! declared budget, and how much of it is spent. One JSON file per
//! session id, written after every turn whether the turn succeeded or
//! failed, so a crash never loses the ledger.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RlmError;

/// One persisted conversation session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    /// `[goal, response]` pairs in turn order.
    pub history: Vec<(String, String)>,
    pub budget_limit: f64,
    pub budget_used: f64,
    pub budget_remaining: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl SessionState {
    pub fn new(session_id: String, budget: f64) -> Self {
        let now = Utc::now();
        SessionState {
            session_id,
            history: Vec::new(),
            budget_limit: budget,
            budget_used: 0.0,
            budget_remaining: budget,
            created_at: now,
            updated_at: now,
            metadata: serde_json::Map::new(),
        }
    }

    /// Record one turn and charge its cost against the budget.
    pub fn add_turn(&mut self, goal: &str, response: &str, cost: f64) {
        self.history.push((goal.to_string(), response.to_string()));
        self.budget_used += cost;
        self.budget_remaining = self.budget_limit - self.budget_used;
        self.updated_at = Utc::now();
    }
}

/// Summary row for session listings.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub turns: usize,
    pub budget_used: f64,
    pub budget_remaining: f64,
}

/// Directory of per-session JSON files.
pub struct SessionStore {
    sessions_dir: PathBuf,
}

impl SessionStore {
    pub fn new(sessions_dir: impl Into<PathBuf>) -> Result<Self, RlmError> {
        let sessions_dir = sessions_dir.into();
        std::fs::create_dir_all(&sessions_dir).map_err(|e| {
            RlmError::Storage(format!(
                "cannot create session directory {}: {}",
                sessions_dir.display(),
                e
            ))
        })?;
        Ok(SessionStore { sessions_dir })
    }

    /// Default location: `~/.rlm-harness/sessions`, falling back to the
    /// temp directory when no home is known.
    pub fn default_dir() -> PathBuf {
        match std::env::var_os("HOME") {
            Some(home) => Path::new(&home).join(".rlm-harness").join("sessions"),
            None => std::env::temp_dir().join("rlm_sessions"),
        }
    }

    pub fn create(&self, budget: f64) -> SessionState {
        let session_id = format!("session_{}", Utc::now().format("%Y%m%d_%H%M%S"));
        SessionState::new(session_id, budget)
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        self.sessions_dir.join(format!("{}.json", session_id))
    }

    pub fn save(&self, session: &SessionState) -> Result<PathBuf, RlmError> {
        let path = self.path_for(&session.session_id);
        let json = serde_json::to_string_pretty(session)
            .map_err(|e| RlmError::Storage(format!("session serialize: {}", e)))?;
        std::fs::write(&path, json)
            .map_err(|e| RlmError::Storage(format!("session write {}: {}", path.display(), e)))?;
        Ok(path)
    }

    pub fn load(&self, session_id: &str) -> Result<Option<SessionState>, RlmError> {
        let path = self.path_for(session_id);
        match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).map(Some).map_err(|e| {
                RlmError::Storage(format!("session {} is corrupt: {}", session_id, e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(RlmError::Storage(format!(
                "session read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// All sessions, most recently updated first. Unreadable files are
    /// skipped.
    pub fn list(&self) -> Vec<SessionSummary> {
        let Ok(entries) = std::fs::read_dir(&self.sessions_dir) else {
            return Vec::new();
        };

        let mut sessions: Vec<SessionSummary> = entries
            .flatten()
            .filter_map(|entry| {
                let raw = std::fs::read_to_string(entry.path()).ok()?;
                let session: SessionState = serde_json::from_str(&raw).ok()?;
                Some(SessionSummary {
                    session_id: session.session_id,
                    created_at: session.created_at,
                    updated_at: session.updated_at,
                    turns: session.history.len(),
                    budget_used: session.budget_used,
                    budget_remaining: session.budget_remaining,
                })
            })
            .collect();

        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        sessions
    }

    pub fn delete(&self, session_id: &str) -> bool {
        std::fs::remove_file(self.path_for(session_id)).is_ok()
    }
}
