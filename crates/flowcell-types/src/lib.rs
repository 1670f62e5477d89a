//! Shared domain types for flowcell.
//!
//! Policies, step requests, capability sets, execution results, the
//! supervisor/worker protocol, session snapshots and executor configuration.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono.

pub mod capability;
pub mod config;
pub mod policy;
pub mod protocol;
pub mod result;
pub mod session;
pub mod step;
