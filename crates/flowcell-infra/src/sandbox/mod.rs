//! Isolation backends for sandbox sessions.

pub mod process;
pub mod thread;

use flowcell_core::sandbox::BoxIsolationBackend;
use flowcell_types::config::{BackendKind, SandboxSettings};

pub use process::{ProcessBackend, run_stdio_worker, settings_from_env};
pub use thread::ThreadBackend;

/// Construct the configured backend.
pub fn backend_for(kind: BackendKind, settings: &SandboxSettings) -> anyhow::Result<BoxIsolationBackend> {
    let backend = match kind {
        BackendKind::Thread => BoxIsolationBackend::new(ThreadBackend::new(settings.clone())),
        BackendKind::Process => BoxIsolationBackend::new(ProcessBackend::current_exe(settings.clone())?),
    };
    tracing::debug!(backend = backend.name(), "selected isolation backend");
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_for_names_the_backend() {
        let settings = SandboxSettings::default();
        assert_eq!(backend_for(BackendKind::Thread, &settings).unwrap().name(), "thread");
        assert_eq!(backend_for(BackendKind::Process, &settings).unwrap().name(), "process");
    }
}
