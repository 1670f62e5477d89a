//! Infrastructure layer for flowcell.
//!
//! Contains the wasmtime step worker, the thread and process isolation
//! backends that implement `flowcell_core::sandbox::IsolationBackend`, the
//! built-in node handlers and the TOML config loader.

pub mod builtin;
pub mod config;
pub mod sandbox;
pub mod wasm;

#[cfg(target_os = "linux")]
pub mod sandbox_linux;
