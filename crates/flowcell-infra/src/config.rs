//! Executor configuration loader.
//!
//! Reads `flowcell.toml` and deserializes it into [`ExecutorConfig`]. Falls
//! back to defaults when the file is missing or malformed, so a bad config
//! file never prevents the executor from starting.

use std::path::Path;

use flowcell_types::config::ExecutorConfig;

/// Default config file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "flowcell.toml";

/// Load executor configuration from `path`.
///
/// - If the file does not exist, returns [`ExecutorConfig::default()`].
/// - If the file cannot be read or fails to parse, logs a warning and returns
///   the default.
/// - Otherwise returns the parsed config.
pub async fn load_config(path: &Path) -> ExecutorConfig {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config file at {}, using defaults", path.display());
            return ExecutorConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", path.display());
            return ExecutorConfig::default();
        }
    };

    match toml::from_str::<ExecutorConfig>(&content) {
        Ok(config) => {
            tracing::debug!(
                backend = %config.sandbox.backend,
                pool_enabled = config.pool.enabled,
                "loaded config from {}",
                path.display()
            );
            config
        }
        Err(err) => {
            tracing::warn!("Failed to parse {}: {err}, using defaults", path.display());
            ExecutorConfig::default()
        }
    }
}
