//! Capability types.
//!
//! A [`CapabilitySet`] is the concrete set of operations one execution may
//! perform. It is derived from `(trust tier, policy)` by the capability gate
//! in `flowcell-core` and never mutated afterwards.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A host module that sandboxed code can import from.
///
/// The set is closed: guest imports naming any other module (`fs`, `process`,
/// `env`, WASI, ...) have no counterpart here and are always denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostModule {
    /// Parameter/input accessors, output, logging, explicit failure.
    Step,
    Math,
    String,
    Date,
    /// SHA-256 and HMAC-SHA256 helpers.
    Hash,
    /// Capability-checked network fetch.
    Http,
}

impl HostModule {
    /// Side-effect-free modules every sandboxed tier receives.
    pub const UTILITY: [HostModule; 5] = [
        HostModule::Step,
        HostModule::Math,
        HostModule::String,
        HostModule::Date,
        HostModule::Hash,
    ];

    /// The import namespace guests use to reach this module.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Step => "step",
            Self::Math => "math",
            Self::String => "string",
            Self::Date => "date",
            Self::Hash => "hash",
            Self::Http => "http",
        }
    }

    /// Look up a module by import namespace. Matching is exact.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "step" => Some(Self::Step),
            "math" => Some(Self::Math),
            "string" => Some(Self::String),
            "date" => Some(Self::Date),
            "hash" => Some(Self::Hash),
            "http" => Some(Self::Http),
            _ => None,
        }
    }
}

impl fmt::Display for HostModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Permitted operations and resource ceilings for one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilitySet {
    pub allowed_modules: BTreeSet<HostModule>,
    pub network_allowed: bool,
    pub memory_limit_bytes: u64,
    pub cpu_quota_percent: u32,
}

impl CapabilitySet {
    /// Whether the import namespace `name` is reachable.
    pub fn allows(&self, name: &str) -> bool {
        HostModule::from_name(name).is_some_and(|m| self.allowed_modules.contains(&m))
    }

    pub fn contains(&self, module: HostModule) -> bool {
        self.allowed_modules.contains(&module)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utility_only() -> CapabilitySet {
        CapabilitySet {
            allowed_modules: HostModule::UTILITY.into_iter().collect(),
            network_allowed: false,
            memory_limit_bytes: 1 << 20,
            cpu_quota_percent: 50,
        }
    }

    #[test]
    fn allows_only_exact_module_names() {
        let caps = utility_only();
        assert!(caps.allows("step"));
        assert!(caps.allows("hash"));
        assert!(!caps.allows("http"));
        assert!(!caps.allows("fs"));
        assert!(!caps.allows("STEP"));
        assert!(!caps.allows("step "));
        assert!(!caps.allows("wasi_snapshot_preview1"));
    }

    #[test]
    fn module_names_round_trip_through_from_name() {
        for module in HostModule::UTILITY.into_iter().chain([HostModule::Http]) {
            assert_eq!(HostModule::from_name(module.as_str()), Some(module));
        }
    }

    #[test]
    fn capability_set_serializes_modules_in_stable_order() {
        let json = serde_json::to_string(&utility_only()).unwrap();
        assert!(json.contains(r#""allowedModules":["step","math","string","date","hash"]"#));
    }
}
