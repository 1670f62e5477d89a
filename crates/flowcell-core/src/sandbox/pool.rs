//! Idle session pool.
//!
//! The pool is the only shared mutable structure in the supervisor. Checkout
//! and checkin happen under one mutex so a session is handed to at most one
//! request at a time.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use chrono::{TimeDelta, Utc};
use flowcell_types::config::PoolConfig;
use flowcell_types::session::{SessionInfo, SessionState};
use flowcell_types::step::TrustTier;

use super::backend::WorkerLink;

/// A live isolation unit together with its bookkeeping.
#[derive(Debug)]
pub struct Session {
    pub info: SessionInfo,
    pub link: WorkerLink,
}

impl Session {
    pub fn new(info: SessionInfo, link: WorkerLink) -> Self {
        Self { info, link }
    }
}

/// Idle sessions keyed by trust tier.
#[derive(Debug)]
pub struct SessionPool {
    config: PoolConfig,
    idle_timeout: TimeDelta,
    idle: Mutex<HashMap<TrustTier, VecDeque<Session>>>,
}

impl SessionPool {
    pub fn new(config: PoolConfig) -> Self {
        let idle_timeout = TimeDelta::from_std(config.idle_timeout()).unwrap_or(TimeDelta::MAX);
        Self {
            config,
            idle_timeout,
            idle: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TrustTier, VecDeque<Session>>> {
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_usable(&self, session: &Session) -> bool {
        let idle_for = Utc::now() - session.info.last_activity_at;
        session.link.is_alive()
            && session.info.reuse_count < self.config.max_reuse_count
            && idle_for <= self.idle_timeout
    }

    /// Take an idle session for `tier`, discarding any that went stale.
    pub fn checkout(&self, tier: TrustTier) -> Option<Session> {
        let mut idle = self.lock();
        let queue = idle.get_mut(&tier)?;
        while let Some(session) = queue.pop_back() {
            if self.is_usable(&session) {
                return Some(session);
            }
            tracing::debug!(
                session_id = %session.info.session_id,
                trust_tier = %tier,
                reuse_count = session.info.reuse_count,
                "discarding stale pooled session"
            );
        }
        None
    }

    /// Return a clean session to the pool.
    ///
    /// Hands the session back when pooling is disabled, the session is
    /// spent, or the tier's idle queue is full; the caller destroys it.
    pub fn checkin(&self, mut session: Session) -> Result<(), Session> {
        if !self.config.enabled || !self.is_usable(&session) {
            return Err(session);
        }
        let mut idle = self.lock();
        let queue = idle.entry(session.info.trust_tier).or_default();
        if queue.len() >= self.config.max_idle_per_tier {
            return Err(session);
        }
        session.info.state = SessionState::Ready;
        session.info.assigned_request_id = None;
        queue.push_back(session);
        Ok(())
    }

    /// Destroy idle sessions past the idle timeout or reuse limit.
    pub fn evict_idle(&self) -> usize {
        let mut idle = self.lock();
        let mut evicted = 0;
        for queue in idle.values_mut() {
            let before = queue.len();
            queue.retain(|session| self.is_usable(session));
            evicted += before - queue.len();
        }
        evicted
    }

    /// Remove every idle session.
    pub fn drain(&self) -> Vec<Session> {
        let mut idle = self.lock();
        idle.drain().flat_map(|(_, queue)| queue).collect()
    }

    pub fn idle_count(&self, tier: TrustTier) -> usize {
        self.lock().get(&tier).map_or(0, VecDeque::len)
    }

    /// Snapshots of all idle sessions.
    pub fn snapshot(&self) -> Vec<SessionInfo> {
        self.lock()
            .values()
            .flat_map(|queue| queue.iter().map(|session| session.info.clone()))
            .collect()
    }
}
