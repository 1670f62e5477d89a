//! WebAssembly step execution.
//!
//! - [`runtime`]: engine configuration, module loading, fuel budgets
//! - [`host`]: capability-gated host modules and import checks
//! - [`worker`]: one execute payload in, one result message out

pub mod host;
pub mod runtime;
pub mod worker;

pub use worker::{StepWorker, WorkerError};
