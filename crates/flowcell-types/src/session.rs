//! Sandbox session lifecycle types.
//!
//! Sessions are owned exclusively by the supervisor. Callers and tests see
//! them only through [`SessionInfo`] snapshots.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::step::TrustTier;

/// Lifecycle state of one isolation unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Spawning,
    Ready,
    Executing,
    Terminating,
    Dead,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Spawning => "spawning",
            Self::Ready => "ready",
            Self::Executing => "executing",
            Self::Terminating => "terminating",
            Self::Dead => "dead",
        };
        f.write_str(name)
    }
}

/// Read-only snapshot of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub trust_tier: TrustTier,
    pub state: SessionState,
    pub assigned_request_id: Option<String>,
    /// Number of requests this session has completed.
    pub reuse_count: u32,
    pub spawned_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl SessionInfo {
    /// A freshly spawning session for the given tier.
    pub fn spawning(trust_tier: TrustTier) -> Self {
        let now = Utc::now();
        Self {
            session_id: Uuid::now_v7(),
            trust_tier,
            state: SessionState::Spawning,
            assigned_request_id: None,
            reuse_count: 0,
            spawned_at: now,
            last_activity_at: now,
        }
    }
}
