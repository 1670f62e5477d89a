//! Isolation backend port.
//!
//! An [`IsolationBackend`] constructs one isolation unit per sandbox session
//! and connects it to the supervisor through a [`WorkerLink`]. Everything the
//! supervisor does (pooling, the timeout race, crash handling) is identical
//! across backends; only construction and teardown of the unit differ.
//!
//! Implemented by `flowcell-infra`:
//! - `ThreadBackend`: one OS thread with its own wasmtime engine per session
//! - `ProcessBackend`: one restricted child process per session

use std::future::Future;
use std::pin::Pin;

use flowcell_types::protocol::{SupervisorMessage, WorkerMessage};
use flowcell_types::session::SessionInfo;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from constructing or talking to an isolation unit.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("failed to spawn isolation unit: {0}")]
    Spawn(String),

    #[error("isolation unit did not report ready within {0} ms")]
    SpawnTimeout(u64),

    #[error("isolation unit exited: {0}")]
    Exited(String),

    #[error("worker channel closed")]
    ChannelClosed,
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// Something observed on a worker link.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// A protocol message from the worker.
    Message(WorkerMessage),
    /// Lifecycle event: the unit terminated (thread exit, process exit).
    Exited { reason: String },
}

/// Supervisor side of the channel to one isolation unit.
///
/// Dropping the link terminates the unit: the kill token is cancelled and
/// the command channel closes.
#[derive(Debug)]
pub struct WorkerLink {
    commands: mpsc::UnboundedSender<SupervisorMessage>,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
    kill: CancellationToken,
}

/// Worker side of the channel, handed to the backend's isolation unit.
#[derive(Debug)]
pub struct WorkerEndpoint {
    pub commands: mpsc::UnboundedReceiver<SupervisorMessage>,
    pub events: mpsc::UnboundedSender<WorkerEvent>,
    /// Cancelled when the supervisor wants the unit dead.
    pub kill: CancellationToken,
}

impl WorkerEndpoint {
    /// Send a protocol message. Returns `false` if the supervisor is gone.
    pub fn send(&self, message: WorkerMessage) -> bool {
        self.events.send(WorkerEvent::Message(message)).is_ok()
    }

    /// Report that the unit terminated.
    pub fn exited(&self, reason: impl Into<String>) {
        let _ = self.events.send(WorkerEvent::Exited {
            reason: reason.into(),
        });
    }
}

impl WorkerLink {
    /// Create a connected link/endpoint pair.
    pub fn channel() -> (WorkerLink, WorkerEndpoint) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let kill = CancellationToken::new();
        (
            WorkerLink {
                commands: command_tx,
                events: event_rx,
                kill: kill.clone(),
            },
            WorkerEndpoint {
                commands: command_rx,
                events: event_tx,
                kill,
            },
        )
    }

    pub fn send(&self, message: SupervisorMessage) -> Result<(), SandboxError> {
        self.commands
            .send(message)
            .map_err(|_| SandboxError::ChannelClosed)
    }

    /// Next event from the unit. `None` means every worker-side sender is
    /// gone, which the supervisor treats as a crash.
    pub async fn recv(&mut self) -> Option<WorkerEvent> {
        self.events.recv().await
    }

    /// Forcibly terminate the unit. It is never asked to stop cooperatively.
    pub fn terminate(&self) {
        self.kill.cancel();
    }

    pub fn is_terminated(&self) -> bool {
        self.kill.is_cancelled()
    }

    /// Whether the worker side still holds its command receiver. A unit
    /// that exited on its own is not alive even though it was never
    /// terminated.
    pub fn is_alive(&self) -> bool {
        !self.is_terminated() && !self.commands.is_closed()
    }
}

impl Drop for WorkerLink {
    fn drop(&mut self) {
        self.kill.cancel();
    }
}

// ---------------------------------------------------------------------------
// IsolationBackend trait
// ---------------------------------------------------------------------------

/// Trait for isolation mechanisms that back sandbox sessions.
///
/// Uses RPITIT for the async method; [`BoxIsolationBackend`] provides the
/// type-erased form used by the executor.
pub trait IsolationBackend: Send + Sync {
    /// Human-readable backend name.
    fn name(&self) -> &str;

    /// Start one isolation unit for `session`.
    ///
    /// The unit must send [`WorkerMessage::Ready`] once it can accept an
    /// `execute` message; the supervisor bounds that wait.
    fn spawn(
        &self,
        session: &SessionInfo,
    ) -> impl Future<Output = Result<WorkerLink, SandboxError>> + Send;
}

/// Object-safe version of [`IsolationBackend`] with boxed futures.
pub trait IsolationBackendDyn: Send + Sync {
    fn name(&self) -> &str;

    fn spawn_boxed<'a>(
        &'a self,
        session: &'a SessionInfo,
    ) -> Pin<Box<dyn Future<Output = Result<WorkerLink, SandboxError>> + Send + 'a>>;
}

impl<T: IsolationBackend> IsolationBackendDyn for T {
    fn name(&self) -> &str {
        IsolationBackend::name(self)
    }

    fn spawn_boxed<'a>(
        &'a self,
        session: &'a SessionInfo,
    ) -> Pin<Box<dyn Future<Output = Result<WorkerLink, SandboxError>> + Send + 'a>> {
        Box::pin(self.spawn(session))
    }
}

/// Type-erased isolation backend for runtime backend selection.
pub struct BoxIsolationBackend {
    inner: Box<dyn IsolationBackendDyn + Send + Sync>,
}

impl BoxIsolationBackend {
    pub fn new<T: IsolationBackend + 'static>(backend: T) -> Self {
        Self {
            inner: Box::new(backend),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub async fn spawn(&self, session: &SessionInfo) -> Result<WorkerLink, SandboxError> {
        self.inner.spawn_boxed(session).await
    }
}

impl std::fmt::Debug for BoxIsolationBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxIsolationBackend")
            .field("name", &self.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn endpoint_messages_reach_link() {
        let (mut link, endpoint) = WorkerLink::channel();
        assert!(endpoint.send(WorkerMessage::Ready));
        assert_eq!(
            link.recv().await,
            Some(WorkerEvent::Message(WorkerMessage::Ready))
        );
    }

    #[tokio::test]
    async fn dropping_endpoint_closes_link() {
        let (mut link, endpoint) = WorkerLink::channel();
        drop(endpoint);
        assert_eq!(link.recv().await, None);
    }

    #[test]
    fn link_is_dead_once_worker_side_is_gone() {
        let (link, endpoint) = WorkerLink::channel();
        assert!(link.is_alive());
        drop(endpoint);
        assert!(!link.is_alive());
        assert!(!link.is_terminated());
    }

    #[tokio::test]
    async fn dropping_link_cancels_kill_token() {
        let (link, endpoint) = WorkerLink::channel();
        assert!(!endpoint.kill.is_cancelled());
        drop(link);
        assert!(endpoint.kill.is_cancelled());
        assert!(!endpoint.send(WorkerMessage::Ready));
    }

    #[test]
    fn send_after_worker_gone_is_channel_closed() {
        let (link, endpoint) = WorkerLink::channel();
        drop(endpoint);
        assert!(matches!(
            link.send(SupervisorMessage::Shutdown),
            Err(SandboxError::ChannelClosed)
        ));
    }
}
