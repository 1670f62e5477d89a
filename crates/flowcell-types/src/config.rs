//! Executor configuration types.
//!
//! `ExecutorConfig` represents `flowcell.toml`: platform policy limits, the
//! session pool, and sandbox backend settings. Every field has a default, so
//! an empty file (or no file) is a valid configuration.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::policy::PolicyLimits;

/// Top-level executor configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default)]
    pub limits: PolicyLimits,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub sandbox: SandboxSettings,
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

/// Session pool settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Whether clean sessions are kept for reuse at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Idle sessions kept per trust tier.
    #[serde(default = "default_max_idle_per_tier")]
    pub max_idle_per_tier: usize,
    /// Requests a session may serve before it is recycled.
    #[serde(default = "default_max_reuse_count")]
    pub max_reuse_count: u32,
    /// Idle sessions older than this are destroyed.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Sessions pre-spawned per sandboxed tier at startup.
    #[serde(default)]
    pub warm_sessions: usize,
}

fn default_true() -> bool {
    true
}

fn default_max_idle_per_tier() -> usize {
    4
}

fn default_max_reuse_count() -> u32 {
    32
}

fn default_idle_timeout_secs() -> u64 {
    300
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_idle_per_tier: default_max_idle_per_tier(),
            max_reuse_count: default_max_reuse_count(),
            idle_timeout_secs: default_idle_timeout_secs(),
            warm_sessions: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Sandbox
// ---------------------------------------------------------------------------

/// Which isolation mechanism backs sandbox sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// One OS thread with its own wasmtime engine per session.
    #[default]
    Thread,
    /// One restricted child process per session.
    Process,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Thread => write!(f, "thread"),
            Self::Process => write!(f, "process"),
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "thread" => Ok(Self::Thread),
            "process" => Ok(Self::Process),
            other => Err(format!("unknown sandbox backend '{other}'")),
        }
    }
}

/// Sandbox backend and worker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxSettings {
    #[serde(default)]
    pub backend: BackendKind,
    /// How long a new session may take to report ready.
    #[serde(default = "default_spawn_timeout_ms")]
    pub spawn_timeout_ms: u64,
    /// Log lines kept per request; the rest are dropped.
    #[serde(default = "default_max_log_lines")]
    pub max_log_lines: usize,
    /// Fuel units granted per second of timeout at 100% CPU.
    #[serde(default = "default_fuel_per_second")]
    pub fuel_per_second: u64,
    /// Response bodies larger than this are truncated by `http.fetch`.
    #[serde(default = "default_http_max_response_bytes")]
    pub http_max_response_bytes: usize,
}

fn default_spawn_timeout_ms() -> u64 {
    10_000
}

fn default_max_log_lines() -> usize {
    1_000
}

fn default_fuel_per_second() -> u64 {
    400_000_000
}

fn default_http_max_response_bytes() -> usize {
    1024 * 1024 // 1 MB
}

impl SandboxSettings {
    pub fn spawn_timeout(&self) -> Duration {
        Duration::from_millis(self.spawn_timeout_ms)
    }
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            spawn_timeout_ms: default_spawn_timeout_ms(),
            max_log_lines: default_max_log_lines(),
            fuel_per_second: default_fuel_per_second(),
            http_max_response_bytes: default_http_max_response_bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config: ExecutorConfig = toml::from_str("").unwrap();
        assert_eq!(config, ExecutorConfig::default());
        assert!(config.pool.enabled);
        assert_eq!(config.pool.max_reuse_count, 32);
        assert_eq!(config.sandbox.backend, BackendKind::Thread);
        assert_eq!(config.sandbox.max_log_lines, 1_000);
    }

    #[test]
    fn sections_deserialize_independently() {
        let toml_str = r#"
[pool]
enabled = false
warm_sessions = 2

[sandbox]
backend = "process"
spawn_timeout_ms = 500
"#;
        let config: ExecutorConfig = toml::from_str(toml_str).unwrap();
        assert!(!config.pool.enabled);
        assert_eq!(config.pool.warm_sessions, 2);
        assert_eq!(config.pool.max_idle_per_tier, 4);
        assert_eq!(config.sandbox.backend, BackendKind::Process);
        assert_eq!(config.sandbox.spawn_timeout(), Duration::from_millis(500));
        assert_eq!(config.limits, PolicyLimits::default());
    }

    #[test]
    fn backend_kind_parses() {
        assert_eq!("process".parse::<BackendKind>().unwrap(), BackendKind::Process);
        assert!("vm".parse::<BackendKind>().is_err());
    }
}
