//! Landlock filesystem restriction for process-backed workers.
//!
//! The worker child calls [`restrict_filesystem`] before it reads its first
//! request. After that the process can read system libraries and the TLS and
//! resolver files `http.fetch` needs, and nothing else. Guest code never sees
//! the filesystem either way; this guards the worker's own host code.

use std::path::Path;

use landlock::{
    ABI, Access, AccessFs, Ruleset, RulesetAttr, RulesetCreatedAttr, RulesetStatus,
    path_beneath_rules,
};

/// Paths a worker may read.
const READABLE_PATHS: &[&str] = &[
    "/usr/lib",
    "/lib",
    "/lib64",
    "/etc/ssl",
    "/etc/resolv.conf",
    "/etc/hosts",
    "/etc/nsswitch.conf",
    "/usr/share/ca-certificates",
];

/// Restrict the current process to read-only access on [`READABLE_PATHS`].
///
/// Best effort on kernels without Landlock: the status is logged and the
/// call still succeeds. Fails only when the ruleset cannot be built.
pub fn restrict_filesystem() -> anyhow::Result<RulesetStatus> {
    let abi = ABI::V3;
    let read_access = AccessFs::from_read(abi);

    let mut ruleset = Ruleset::default()
        .handle_access(AccessFs::from_all(abi))?
        .create()?;

    for path in READABLE_PATHS.iter().map(Path::new).filter(|p| p.exists()) {
        for rule in path_beneath_rules([path], read_access) {
            ruleset = ruleset.add_rule(rule?)?;
        }
    }

    let status = ruleset.restrict_self()?;
    match status.ruleset {
        RulesetStatus::FullyEnforced => tracing::debug!("landlock restrictions fully enforced"),
        RulesetStatus::PartiallyEnforced => {
            tracing::warn!("landlock restrictions partially enforced (older kernel ABI)")
        }
        RulesetStatus::NotEnforced => {
            tracing::warn!("landlock restrictions not enforced (kernel lacks support)")
        }
    }
    Ok(status.ruleset)
}
