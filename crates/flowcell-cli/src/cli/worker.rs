//! Hidden `flowcell worker` subcommand run by the process backend.

use flowcell_infra::sandbox::{run_stdio_worker, settings_from_env};

/// Serve the worker protocol on stdin/stdout until stdin closes.
///
/// Runs on the main thread with no async runtime.
pub fn worker() -> anyhow::Result<()> {
    let settings = settings_from_env();
    tracing::debug!(
        session_id = ?std::env::var(flowcell_infra::sandbox::process::SESSION_ENV).ok(),
        "worker process starting"
    );
    run_stdio_worker(&settings)
}
