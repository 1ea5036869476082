//! Session correlation: one opaque id per logical conversation
//!
//! Sessions carry no protocol state. The id is attached to every outbound call
//! and every tracked task; the record itself only exists for idle collection.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use relay_a2a::RelayError;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Maximum session ID length
const MAX_SESSION_ID_LEN: usize = 256;

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub request_count: u64,
}

/// Tracks live sessions; cloning shares the same table.
#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<DashMap<String, Session>>,
    max_sessions: usize,
    idle_timeout: Duration,
}

/// Validate a caller-supplied session id. Ids are opaque, so case is preserved.
fn normalize_session_id(id: &str) -> Result<&str, &'static str> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        return Err("Session ID cannot be empty");
    }
    if trimmed.len() > MAX_SESSION_ID_LEN {
        return Err("Session ID too long");
    }
    if trimmed.chars().any(|c| c.is_control()) {
        return Err("Session ID contains control characters");
    }
    Ok(trimmed)
}

impl SessionManager {
    pub fn new(max_sessions: usize, idle_timeout: Duration) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            max_sessions,
            idle_timeout,
        }
    }

    /// Use the caller's session id when present, otherwise mint one.
    /// Either way the session is recorded as active.
    pub fn resolve(&self, supplied: Option<&str>) -> Result<String, RelayError> {
        let id = match supplied {
            Some(raw) => normalize_session_id(raw)
                .map_err(|e| RelayError::InvalidRequest(e.to_string()))?
                .to_string(),
            None => uuid::Uuid::new_v4().to_string(),
        };

        if let Some(mut session) = self.sessions.get_mut(&id) {
            session.last_activity = Utc::now();
            session.request_count += 1;
            return Ok(id);
        }

        if self.sessions.len() >= self.max_sessions {
            let swept = self.sweep_idle();
            if swept == 0 && self.sessions.len() >= self.max_sessions {
                warn!("Session table full ({} sessions)", self.max_sessions);
                return Err(RelayError::Internal(
                    "maximum number of sessions reached".into(),
                ));
            }
        }

        let now = Utc::now();
        self.sessions
            .entry(id.clone())
            .and_modify(|s| {
                s.last_activity = now;
                s.request_count += 1;
            })
            .or_insert_with(|| {
                debug!("Opened session {}", id);
                Session {
                    id: id.clone(),
                    created_at: now,
                    last_activity: now,
                    request_count: 1,
                }
            });
        Ok(id)
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.sessions.get(id).map(|s| s.clone())
    }

    /// Drop sessions idle longer than the timeout. Returns how many went.
    pub fn sweep_idle(&self) -> usize {
        let now = Utc::now();
        let before = self.sessions.len();
        self.sessions.retain(|_, session| {
            let idle = (now - session.last_activity).to_std().unwrap_or_default();
            idle <= self.idle_timeout
        });
        let removed = before.saturating_sub(self.sessions.len());
        if removed > 0 {
            info!("Expired {} idle session(s)", removed);
        }
        removed
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }
}
