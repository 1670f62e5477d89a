//! Capability gate.
//!
//! Resolves, for one step, which host modules are reachable and which
//! resource ceilings apply. Derivation is pure and total: invalid policy
//! values are clamped by [`NodePolicy::resolve`], never rejected.

use std::collections::BTreeSet;

use flowcell_types::capability::{CapabilitySet, HostModule};
use flowcell_types::policy::{EffectivePolicy, NodePolicy, PolicyLimits};
use flowcell_types::step::TrustTier;

const MIB: u64 = 1024 * 1024;

/// Derive the capability set for a resolved policy.
///
/// Sandboxed tiers get the side-effect-free utility modules plus `http` iff
/// the policy allows network access. No filesystem, process-spawning or
/// process-control module exists in [`HostModule`], so none can be granted
/// to any tier regardless of policy.
pub fn derive_capabilities(trust_tier: TrustTier, policy: &EffectivePolicy) -> CapabilitySet {
    // Built-in handlers run with host privileges and never consult the set;
    // it is still derived so every request carries one.
    if !trust_tier.is_sandboxed() {
        tracing::trace!("capability set derived for built-in tier is informational");
    }

    let mut allowed_modules: BTreeSet<HostModule> = HostModule::UTILITY.into_iter().collect();
    if policy.allow_network_access {
        allowed_modules.insert(HostModule::Http);
    }

    CapabilitySet {
        allowed_modules,
        network_allowed: policy.allow_network_access,
        memory_limit_bytes: policy.max_memory_mb.saturating_mul(MIB),
        cpu_quota_percent: policy.max_cpu_percent.clamp(1, 100),
    }
}

/// Resolves policies against platform limits and derives capability sets.
#[derive(Debug, Clone, Default)]
pub struct CapabilityGate {
    limits: PolicyLimits,
}

impl CapabilityGate {
    pub fn new(limits: PolicyLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &PolicyLimits {
        &self.limits
    }

    pub fn resolve(&self, policy: &NodePolicy) -> EffectivePolicy {
        policy.resolve(&self.limits)
    }

    /// Resolve `policy` and derive the capability set for `trust_tier`.
    pub fn derive(&self, trust_tier: TrustTier, policy: &NodePolicy) -> CapabilitySet {
        derive_capabilities(trust_tier, &self.resolve(policy))
    }
}
