//! Wasmtime engine configuration and step module loading.
//!
//! Every sandbox session owns its own [`Engine`] so that bumping the epoch to
//! kill one session never interrupts another.

use anyhow::Result;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use wasmtime::{Config, Engine, Module};

/// Prefix marking step code as base64-encoded binary WebAssembly.
pub const BASE64_PREFIX: &str = "base64:";

/// Build the Wasmtime [`Config`] used for step sessions.
///
/// All sessions get fuel consumption and epoch interruption. Threads and
/// SIMD are disabled; step code is single-threaded and scalar.
pub fn engine_config() -> Config {
    let mut config = Config::new();
    config.consume_fuel(true);
    config.epoch_interruption(true);
    config.wasm_threads(false);
    // Must disable relaxed-SIMD before SIMD (relaxed depends on SIMD).
    config.wasm_relaxed_simd(false);
    config.wasm_simd(false);
    config
}

/// Create a fresh engine for one session.
///
/// # Errors
///
/// Returns an error if engine creation fails (e.g., unsupported platform).
pub fn create_engine() -> Result<Engine> {
    Engine::new(&engine_config())
}

/// Errors turning step code into a compiled module.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("invalid base64 module encoding: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("invalid WebAssembly module: {0}")]
    Compile(String),
}

/// Decode step code into bytes Wasmtime accepts (WAT text or binary).
pub fn decode_source(code: &str) -> Result<Vec<u8>, LoadError> {
    match code.trim_start().strip_prefix(BASE64_PREFIX) {
        Some(encoded) => {
            let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
            Ok(STANDARD.decode(compact)?)
        }
        None => Ok(code.as_bytes().to_vec()),
    }
}

/// Compile step code for `engine`.
pub fn load_module(engine: &Engine, code: &str) -> Result<Module, LoadError> {
    let bytes = decode_source(code)?;
    Module::new(engine, bytes).map_err(|err| LoadError::Compile(format!("{err:#}")))
}

/// Fuel granted to one execution.
///
/// `fuel_per_second` is the budget for one second at 100% CPU; the quota
/// scales it down and the timeout scales it up.
pub fn fuel_budget(fuel_per_second: u64, timeout_ms: u64, cpu_quota_percent: u32) -> u64 {
    let per_ms = fuel_per_second / 1_000;
    let percent = u64::from(cpu_quota_percent.clamp(1, 100));
    per_ms
        .saturating_mul(timeout_ms)
        .saturating_mul(percent)
        / 100
}
