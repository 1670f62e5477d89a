//! Thread isolation backend.
//!
//! Each session is one OS thread owning its own Wasmtime [`Engine`]. Killing
//! a session increments that engine's epoch, which traps the running guest
//! at its next epoch check; the thread then sees its channel closed and
//! exits. A kill that arrives while a module is still compiling is caught by
//! the worker's interrupt check once the deadline is armed.

use std::panic::{AssertUnwindSafe, catch_unwind};

use flowcell_core::sandbox::{IsolationBackend, SandboxError, WorkerEndpoint, WorkerEvent, WorkerLink};
use flowcell_types::config::SandboxSettings;
use flowcell_types::protocol::{SupervisorMessage, WorkerMessage};
use flowcell_types::session::SessionInfo;

use crate::wasm::StepWorker;
use crate::wasm::runtime;

/// Runs every session on a dedicated OS thread.
#[derive(Debug, Clone, Default)]
pub struct ThreadBackend {
    settings: SandboxSettings,
}

impl ThreadBackend {
    pub fn new(settings: SandboxSettings) -> Self {
        Self { settings }
    }
}

impl IsolationBackend for ThreadBackend {
    fn name(&self) -> &str {
        "thread"
    }

    async fn spawn(&self, session: &SessionInfo) -> Result<WorkerLink, SandboxError> {
        let engine =
            runtime::create_engine().map_err(|err| SandboxError::Spawn(format!("{err:#}")))?;
        let (link, endpoint) = WorkerLink::channel();

        // Kill watcher: the only way to stop a guest that never yields.
        let kill = endpoint.kill.clone();
        let watched = engine.clone();
        tokio::spawn(async move {
            kill.cancelled().await;
            watched.increment_epoch();
        });

        let killed = endpoint.kill.clone();
        let worker =
            StepWorker::new(engine, &self.settings).with_interrupt_check(move || killed.is_cancelled());
        let session_id = session.session_id;
        std::thread::Builder::new()
            .name(format!("flowcell-session-{}", session_id.simple()))
            .spawn(move || {
                let span = tracing::debug_span!("session", session_id = %session_id);
                let _entered = span.enter();
                run_session(worker, endpoint);
            })
            .map_err(|err| SandboxError::Spawn(format!("failed to start session thread: {err}")))?;

        Ok(link)
    }
}

fn run_session(worker: StepWorker, mut endpoint: WorkerEndpoint) {
    let served = catch_unwind(AssertUnwindSafe(|| serve(&worker, &mut endpoint)));
    match served {
        Ok(()) => endpoint.exited("session thread stopped"),
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!("session thread panicked: {reason}");
            endpoint.exited(format!("session thread panicked: {reason}"));
        }
    }
}

fn serve(worker: &StepWorker, endpoint: &mut WorkerEndpoint) {
    if !endpoint.send(WorkerMessage::Ready) {
        return;
    }
    while let Some(message) = endpoint.commands.blocking_recv() {
        let payload = match message {
            SupervisorMessage::Execute { payload } => payload,
            SupervisorMessage::Shutdown => return,
        };
        if endpoint.kill.is_cancelled() {
            return;
        }

        let events = endpoint.events.clone();
        let reply = worker.execute(&payload, move |level, text| {
            let _ = events.send(WorkerEvent::Message(WorkerMessage::Log { level, text }));
        });

        if !endpoint.send(WorkerMessage::Result(reply)) || endpoint.kill.is_cancelled() {
            return;
        }
    }
}
