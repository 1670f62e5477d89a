//! Sandboxed execution: the isolation backend port, the session pool and the
//! supervisor that drives both.

pub mod backend;
pub mod pool;
pub mod supervisor;

pub use backend::{BoxIsolationBackend, IsolationBackend, SandboxError, WorkerEndpoint, WorkerEvent, WorkerLink};
pub use supervisor::StepExecutor;
