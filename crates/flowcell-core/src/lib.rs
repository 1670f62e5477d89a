//! Execution core for flowcell.
//!
//! This crate defines the capability gate, the trusted handler registry, the
//! isolation backend port and the supervisor that drives sandbox sessions. It
//! depends only on `flowcell-types`; wasmtime and process plumbing live in
//! `flowcell-infra` behind [`sandbox::IsolationBackend`].

pub mod capability;
pub mod handler;
pub mod logs;
pub mod retry;
pub mod sandbox;
