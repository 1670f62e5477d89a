//! Application state wiring the executor together.
//!
//! AppState holds the loaded configuration and the handler registry; the
//! executor is built from it once the backend is known.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use flowcell_core::handler::registry::HandlerRegistry;
use flowcell_core::sandbox::StepExecutor;
use flowcell_infra::builtin::register_builtins;
use flowcell_infra::config::load_config;
use flowcell_infra::sandbox::backend_for;
use flowcell_types::config::{BackendKind, ExecutorConfig};
use flowcell_types::step::TrustTier;

pub struct AppState {
    pub config: ExecutorConfig,
    pub registry: Arc<HandlerRegistry>,
}

impl AppState {
    /// Load config and register built-in handlers.
    ///
    /// A duplicate handler registration aborts startup.
    pub async fn init(config_path: &Path) -> anyhow::Result<Self> {
        let config = load_config(config_path).await;
        let mut registry = HandlerRegistry::new();
        register_builtins(&mut registry).context("failed to register built-in handlers")?;
        Ok(Self {
            config,
            registry: Arc::new(registry),
        })
    }

    /// Build an executor, overriding the configured backend if asked.
    ///
    /// Pre-spawns `pool.warm_sessions` sessions for each sandboxed tier.
    pub async fn executor(&self, backend: Option<BackendKind>) -> anyhow::Result<StepExecutor> {
        let mut config = self.config.clone();
        if let Some(kind) = backend {
            config.sandbox.backend = kind;
        }
        let backend = backend_for(config.sandbox.backend, &config.sandbox)?;
        let warm = config.pool.warm_sessions;
        let executor = StepExecutor::new(backend, Arc::clone(&self.registry), config);
        if warm > 0 {
            for tier in TrustTier::ALL.into_iter().filter(TrustTier::is_sandboxed) {
                let warmed = executor.warm_up(tier, warm).await;
                tracing::debug!(trust_tier = %tier, warmed, "warmed sandbox sessions");
            }
        }
        Ok(executor)
    }
}
