//! Step policy types.
//!
//! A [`NodePolicy`] is the declarative contract a workflow author attaches to
//! a step. Every numeric field is optional on the wire; [`NodePolicy::resolve`]
//! turns it into an [`EffectivePolicy`] with concrete values, clamped to the
//! platform's [`PolicyLimits`]. Resolution never fails, so every request is
//! executable.

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// NodePolicy
// ---------------------------------------------------------------------------

/// Resource and security policy attached to one step invocation.
///
/// Unset fields fall back to system-wide defaults, never to "unlimited".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay_ms: Option<u64>,
    #[serde(default, rename = "maxMemoryMB", skip_serializing_if = "Option::is_none")]
    pub max_memory_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cpu_percent: Option<u32>,
    #[serde(default)]
    pub allow_network_access: bool,
}

impl NodePolicy {
    /// Policy with only a timeout set; everything else uses defaults.
    pub fn with_timeout(timeout_seconds: u64) -> Self {
        Self {
            timeout_seconds: Some(timeout_seconds),
            ..Self::default()
        }
    }

    /// Resolve this policy against the platform limits.
    ///
    /// - `timeoutSeconds` of 0 or unset resolves to the default; larger values
    ///   clamp to the ceiling. The result is always at least one second.
    /// - Memory and CPU behave the same way; CPU never exceeds 100%.
    /// - Retry count and delay default to the platform defaults and clamp to
    ///   their ceilings.
    pub fn resolve(&self, limits: &PolicyLimits) -> EffectivePolicy {
        let max_timeout = limits.max_timeout_secs.max(1);
        let timeout_secs = match self.timeout_seconds {
            Some(secs) if secs > 0 => secs.min(max_timeout),
            _ => limits.default_timeout_secs.clamp(1, max_timeout),
        };

        let max_memory = limits.max_memory_mb.max(1);
        let max_memory_mb = match self.max_memory_mb {
            Some(mb) if mb > 0 => mb.min(max_memory),
            _ => limits.default_memory_mb.clamp(1, max_memory),
        };

        let max_cpu = limits.max_cpu_percent.clamp(1, 100);
        let max_cpu_percent = match self.max_cpu_percent {
            Some(pct) if pct > 0 => pct.min(max_cpu),
            _ => limits.default_cpu_percent.clamp(1, max_cpu),
        };

        EffectivePolicy {
            timeout_secs,
            retry_count: self
                .retry_count
                .unwrap_or(limits.default_retry_count)
                .min(limits.max_retry_count),
            retry_delay_ms: self
                .retry_delay_ms
                .unwrap_or(limits.default_retry_delay_ms)
                .min(limits.max_retry_delay_ms),
            max_memory_mb,
            max_cpu_percent,
            allow_network_access: self.allow_network_access,
        }
    }
}

// ---------------------------------------------------------------------------
// EffectivePolicy
// ---------------------------------------------------------------------------

/// A [`NodePolicy`] with every field resolved to a concrete, bounded value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectivePolicy {
    pub timeout_secs: u64,
    pub retry_count: u32,
    pub retry_delay_ms: u64,
    pub max_memory_mb: u64,
    pub max_cpu_percent: u32,
    pub allow_network_access: bool,
}

impl EffectivePolicy {
    /// Wall-clock timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Delay between caller-side retry attempts.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

// ---------------------------------------------------------------------------
// PolicyLimits
// ---------------------------------------------------------------------------

/// Platform-wide defaults and ceilings applied to every [`NodePolicy`].
///
/// Loaded from the `[limits]` section of the executor configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyLimits {
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    #[serde(default = "max_timeout_secs")]
    pub max_timeout_secs: u64,
    #[serde(default = "default_memory_mb")]
    pub default_memory_mb: u64,
    #[serde(default = "max_memory_mb")]
    pub max_memory_mb: u64,
    #[serde(default = "default_cpu_percent")]
    pub default_cpu_percent: u32,
    #[serde(default = "max_cpu_percent")]
    pub max_cpu_percent: u32,
    #[serde(default)]
    pub default_retry_count: u32,
    #[serde(default = "max_retry_count")]
    pub max_retry_count: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub default_retry_delay_ms: u64,
    #[serde(default = "max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

fn max_timeout_secs() -> u64 {
    300 // 5 min
}

fn default_memory_mb() -> u64 {
    128
}

fn max_memory_mb() -> u64 {
    512
}

fn default_cpu_percent() -> u32 {
    50
}

fn max_cpu_percent() -> u32 {
    100
}

fn max_retry_count() -> u32 {
    10
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

fn max_retry_delay_ms() -> u64 {
    300_000
}

impl Default for PolicyLimits {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_timeout_secs(),
            max_timeout_secs: max_timeout_secs(),
            default_memory_mb: default_memory_mb(),
            max_memory_mb: max_memory_mb(),
            default_cpu_percent: default_cpu_percent(),
            max_cpu_percent: max_cpu_percent(),
            default_retry_count: 0,
            max_retry_count: max_retry_count(),
            default_retry_delay_ms: default_retry_delay_ms(),
            max_retry_delay_ms: max_retry_delay_ms(),
        }
    }
}
