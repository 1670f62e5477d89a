//! Read-only commands: `capabilities` and `handlers`.

use anyhow::Result;
use console::style;
use flowcell_core::capability::derive_capabilities;
use flowcell_types::policy::NodePolicy;
use flowcell_types::step::TrustTier;

use crate::state::AppState;

/// Print the capability set `tier` resolves to under the given policy.
pub fn capabilities(
    state: &AppState,
    tier: TrustTier,
    network: bool,
    memory_mb: Option<u64>,
    cpu: Option<u32>,
    json: bool,
) -> Result<()> {
    let policy = NodePolicy {
        allow_network_access: network,
        max_memory_mb: memory_mb,
        max_cpu_percent: cpu,
        ..NodePolicy::default()
    }
    .resolve(&state.config.limits);
    let caps = derive_capabilities(tier, &policy);

    if json {
        println!("{}", serde_json::to_string_pretty(&caps)?);
        return Ok(());
    }

    println!();
    println!("  {} {}", style("Trust tier:").dim(), style(tier).cyan().bold());
    if !tier.is_sandboxed() {
        println!("  {}", style("runs in-process with full host privileges").yellow());
    }
    let modules: Vec<&str> = caps.allowed_modules.iter().map(|m| m.as_str()).collect();
    println!("  {} {}", style("Modules:").dim(), modules.join(", "));
    println!("  {} {}", style("Network:").dim(), caps.network_allowed);
    println!(
        "  {} {} MB",
        style("Memory:").dim(),
        caps.memory_limit_bytes / (1024 * 1024)
    );
    println!("  {} {}%", style("CPU:").dim(), caps.cpu_quota_percent);
    println!("  {} {} s", style("Timeout:").dim(), policy.timeout_secs);
    println!();
    Ok(())
}

/// Print the registered built-in node types.
pub fn handlers(state: &AppState, json: bool) -> Result<()> {
    let node_types = state.registry.node_types();
    if json {
        println!("{}", serde_json::to_string(&node_types)?);
        return Ok(());
    }
    for node_type in node_types {
        println!("  {}", style(node_type).cyan());
    }
    Ok(())
}
