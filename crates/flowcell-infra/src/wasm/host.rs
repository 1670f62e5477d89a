//! Capability-gated host modules.
//!
//! Step code reaches the host only through imports. [`check_imports`] rejects
//! every import outside the step's capability set before instantiation, and
//! [`link_host_modules`] defines only the modules the set allows, so a name
//! that is not granted simply does not exist for the guest.
//!
//! All pointers and lengths are `i32` offsets into the guest's exported
//! `memory`.

use std::collections::BTreeMap;
use std::io::Read;
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use flowcell_types::capability::{CapabilitySet, HostModule};
use flowcell_types::result::LogLevel;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use wasmtime::{Caller, ExternType, Linker, Memory, Module, ResourceLimiter};

/// Table entries a step may grow to.
const MAX_TABLE_ELEMENTS: usize = 10_000;

/// Functions each host module exports, by import name.
pub fn host_functions(module: HostModule) -> &'static [&'static str] {
    match module {
        HostModule::Step => &["input_len", "input_read", "output", "log", "fail"],
        HostModule::Math => &["sqrt", "pow", "floor", "ceil", "round"],
        HostModule::String => &["to_upper", "to_lower", "is_utf8"],
        HostModule::Date => &["now_ms", "parse_rfc3339"],
        HostModule::Hash => &["sha256", "hmac_sha256"],
        HostModule::Http => &["fetch", "fetch_read"],
    }
}

// ---------------------------------------------------------------------------
// StepState -- per-execution Store data
// ---------------------------------------------------------------------------

/// Receives guest log lines as they are emitted.
pub type LogSink = Box<dyn FnMut(LogLevel, String) + Send>;

/// Raised by `step.fail`; carries the guest's message.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct GuestFailure(pub String);

/// Network access granted to one execution.
pub struct HttpAccess {
    client: Option<reqwest::blocking::Client>,
    timeout: Duration,
    max_response_bytes: usize,
}

impl HttpAccess {
    pub fn new(timeout: Duration, max_response_bytes: usize) -> Self {
        Self {
            client: None,
            timeout,
            max_response_bytes,
        }
    }
}

/// Data attached to each Wasmtime [`wasmtime::Store`] for one execution.
///
/// A fresh `StepState` is created per request, so nothing the guest does is
/// visible to the next request on the same session.
pub struct StepState {
    input: Vec<u8>,
    output: Option<Vec<Value>>,
    log_sink: LogSink,
    http: Option<HttpAccess>,
    fetched: Vec<u8>,
    max_memory_bytes: usize,
}

impl StepState {
    pub fn new(
        input: Vec<u8>,
        log_sink: LogSink,
        http: Option<HttpAccess>,
        max_memory_bytes: usize,
    ) -> Self {
        Self {
            input,
            output: None,
            log_sink,
            http,
            fetched: Vec::new(),
            max_memory_bytes,
        }
    }

    /// Items passed to `step.output`, if the guest called it.
    pub fn take_output(&mut self) -> Option<Vec<Value>> {
        self.output.take()
    }
}

impl ResourceLimiter for StepState {
    fn memory_growing(
        &mut self,
        current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> Result<bool> {
        if desired > self.max_memory_bytes {
            tracing::warn!(
                current_bytes = current,
                desired_bytes = desired,
                limit_bytes = self.max_memory_bytes,
                "memory growth denied by ResourceLimiter"
            );
            Ok(false)
        } else {
            Ok(true)
        }
    }

    fn table_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> Result<bool> {
        Ok(desired <= MAX_TABLE_ELEMENTS)
    }
}

// ---------------------------------------------------------------------------
// Import checks
// ---------------------------------------------------------------------------

/// Reject any import the capability set does not grant.
///
/// Imports from a module outside the set are denied whatever their name or
/// kind. Within a granted module only the listed functions exist.
pub fn check_imports(module: &Module, capabilities: &CapabilitySet) -> Result<(), String> {
    for import in module.imports() {
        let module_name = import.module();
        let name = import.name();
        let host_module = match HostModule::from_name(module_name) {
            Some(host_module) if capabilities.contains(host_module) => host_module,
            _ => {
                return Err(format!(
                    "module '{module_name}' is not available to this step (import '{module_name}.{name}')"
                ));
            }
        };
        let is_function = matches!(import.ty(), ExternType::Func(_));
        if !is_function || !host_functions(host_module).contains(&name) {
            return Err(format!(
                "module '{module_name}' has no function '{name}'"
            ));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Guest memory helpers
// ---------------------------------------------------------------------------

fn guest_memory(caller: &mut Caller<'_, StepState>) -> Result<Memory> {
    caller
        .get_export("memory")
        .and_then(|export| export.into_memory())
        .ok_or_else(|| anyhow!("step module must export its linear memory as 'memory'"))
}

fn offset(value: i32, what: &str) -> Result<usize> {
    usize::try_from(value).map_err(|_| anyhow!("negative {what}: {value}"))
}

/// The `len` bytes at `ptr`, checked against the memory's current size.
fn guest_slice(data: &[u8], ptr: usize, len: usize) -> Result<&[u8]> {
    ptr.checked_add(len)
        .and_then(|end| data.get(ptr..end))
        .ok_or_else(|| anyhow!("guest range {ptr}+{len} is outside linear memory of {} bytes", data.len()))
}

fn read_guest(caller: &mut Caller<'_, StepState>, ptr: i32, len: i32) -> Result<Vec<u8>> {
    let memory = guest_memory(caller)?;
    let (ptr, len) = (offset(ptr, "pointer")?, offset(len, "length")?);
    Ok(guest_slice(memory.data(&*caller), ptr, len)?.to_vec())
}

fn write_guest(caller: &mut Caller<'_, StepState>, ptr: i32, data: &[u8]) -> Result<()> {
    let memory = guest_memory(caller)?;
    memory.write(&mut *caller, offset(ptr, "pointer")?, data)?;
    Ok(())
}

fn guest_len(len: usize) -> i32 {
    i32::try_from(len).unwrap_or(i32::MAX)
}

/// Normalize a `step.output` document into output records.
///
/// An array must hold only objects; a single object becomes one record.
pub fn normalize_output(document: Value) -> Result<Vec<Value>, String> {
    match document {
        Value::Array(items) => {
            if let Some(position) = items.iter().position(|item| !item.is_object()) {
                return Err(format!("output item {position} is not a JSON object"));
            }
            Ok(items)
        }
        Value::Object(_) => Ok(vec![document]),
        other => Err(format!(
            "output must be a JSON array of objects or a single object, got {}",
            json_type(&other)
        )),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ---------------------------------------------------------------------------
// Linking
// ---------------------------------------------------------------------------

/// Define the host modules granted by `capabilities` on `linker`.
pub fn link_host_modules(
    linker: &mut Linker<StepState>,
    capabilities: &CapabilitySet,
) -> Result<()> {
    for module in &capabilities.allowed_modules {
        match module {
            HostModule::Step => link_step(linker)?,
            HostModule::Math => link_math(linker)?,
            HostModule::String => link_string(linker)?,
            HostModule::Date => link_date(linker)?,
            HostModule::Hash => link_hash(linker)?,
            HostModule::Http => link_http(linker)?,
        }
    }
    Ok(())
}

fn link_step(linker: &mut Linker<StepState>) -> Result<()> {
    linker.func_wrap("step", "input_len", |caller: Caller<'_, StepState>| -> i32 {
        guest_len(caller.data().input.len())
    })?;

    linker.func_wrap(
        "step",
        "input_read",
        |mut caller: Caller<'_, StepState>, ptr: i32| -> Result<()> {
            let input = caller.data().input.clone();
            write_guest(&mut caller, ptr, &input)
        },
    )?;

    linker.func_wrap(
        "step",
        "output",
        |mut caller: Caller<'_, StepState>, ptr: i32, len: i32| -> Result<()> {
            let bytes = read_guest(&mut caller, ptr, len)?;
            let document: Value = serde_json::from_slice(&bytes)
                .map_err(|err| anyhow!("malformed output JSON: {err}"))?;
            let items = normalize_output(document).map_err(|err| anyhow!(err))?;
            caller.data_mut().output = Some(items);
            Ok(())
        },
    )?;

    linker.func_wrap(
        "step",
        "log",
        |mut caller: Caller<'_, StepState>, level: i32, ptr: i32, len: i32| -> Result<()> {
            let bytes = read_guest(&mut caller, ptr, len)?;
            let text = String::from_utf8_lossy(&bytes).into_owned();
            (caller.data_mut().log_sink)(LogLevel::from_guest(level), text);
            Ok(())
        },
    )?;

    linker.func_wrap(
        "step",
        "fail",
        |mut caller: Caller<'_, StepState>, ptr: i32, len: i32| -> Result<()> {
            let bytes = read_guest(&mut caller, ptr, len)?;
            Err(GuestFailure(String::from_utf8_lossy(&bytes).into_owned()).into())
        },
    )?;
    Ok(())
}

fn link_math(linker: &mut Linker<StepState>) -> Result<()> {
    linker.func_wrap("math", "sqrt", |x: f64| x.sqrt())?;
    linker.func_wrap("math", "pow", |base: f64, exponent: f64| base.powf(exponent))?;
    linker.func_wrap("math", "floor", |x: f64| x.floor())?;
    linker.func_wrap("math", "ceil", |x: f64| x.ceil())?;
    linker.func_wrap("math", "round", |x: f64| x.round())?;
    Ok(())
}

fn link_string(linker: &mut Linker<StepState>) -> Result<()> {
    linker.func_wrap(
        "string",
        "to_upper",
        |mut caller: Caller<'_, StepState>, ptr: i32, len: i32| -> Result<()> {
            let mut bytes = read_guest(&mut caller, ptr, len)?;
            bytes.make_ascii_uppercase();
            write_guest(&mut caller, ptr, &bytes)
        },
    )?;

    linker.func_wrap(
        "string",
        "to_lower",
        |mut caller: Caller<'_, StepState>, ptr: i32, len: i32| -> Result<()> {
            let mut bytes = read_guest(&mut caller, ptr, len)?;
            bytes.make_ascii_lowercase();
            write_guest(&mut caller, ptr, &bytes)
        },
    )?;

    linker.func_wrap(
        "string",
        "is_utf8",
        |mut caller: Caller<'_, StepState>, ptr: i32, len: i32| -> Result<i32> {
            let bytes = read_guest(&mut caller, ptr, len)?;
            Ok(i32::from(std::str::from_utf8(&bytes).is_ok()))
        },
    )?;
    Ok(())
}

/// Milliseconds since the Unix epoch, or `i64::MIN` if `text` is not RFC 3339.
pub fn parse_rfc3339_ms(text: &[u8]) -> i64 {
    std::str::from_utf8(text)
        .ok()
        .and_then(|text| DateTime::parse_from_rfc3339(text.trim()).ok())
        .map_or(i64::MIN, |parsed| parsed.timestamp_millis())
}

fn link_date(linker: &mut Linker<StepState>) -> Result<()> {
    linker.func_wrap("date", "now_ms", || -> i64 { Utc::now().timestamp_millis() })?;

    linker.func_wrap(
        "date",
        "parse_rfc3339",
        |mut caller: Caller<'_, StepState>, ptr: i32, len: i32| -> Result<i64> {
            let bytes = read_guest(&mut caller, ptr, len)?;
            Ok(parse_rfc3339_ms(&bytes))
        },
    )?;
    Ok(())
}

/// HMAC-SHA256 of `message` under `key`.
pub fn hmac_sha256(key: &[u8], message: &[u8]) -> Result<[u8; 32]> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key)
        .map_err(|err| anyhow!("invalid HMAC key: {err}"))?;
    mac.update(message);
    Ok(mac.finalize().into_bytes().into())
}

fn link_hash(linker: &mut Linker<StepState>) -> Result<()> {
    linker.func_wrap(
        "hash",
        "sha256",
        |mut caller: Caller<'_, StepState>, ptr: i32, len: i32, out_ptr: i32| -> Result<()> {
            let bytes = read_guest(&mut caller, ptr, len)?;
            let digest = Sha256::digest(&bytes);
            write_guest(&mut caller, out_ptr, &digest)
        },
    )?;

    linker.func_wrap(
        "hash",
        "hmac_sha256",
        |mut caller: Caller<'_, StepState>,
         key_ptr: i32,
         key_len: i32,
         msg_ptr: i32,
         msg_len: i32,
         out_ptr: i32|
         -> Result<()> {
            let key = read_guest(&mut caller, key_ptr, key_len)?;
            let message = read_guest(&mut caller, msg_ptr, msg_len)?;
            let tag = hmac_sha256(&key, &message)?;
            write_guest(&mut caller, out_ptr, &tag)
        },
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// http
// ---------------------------------------------------------------------------

/// Request document accepted by `http.fetch`.
#[derive(Debug, Deserialize)]
pub struct FetchRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

/// Response document buffered for `http.fetch_read`.
#[derive(Debug, Serialize)]
pub struct FetchResponse {
    pub status: u16,
    pub body: String,
}

fn perform_fetch(access: &mut HttpAccess, request: FetchRequest) -> Result<FetchResponse> {
    if access.client.is_none() {
        let client = reqwest::blocking::Client::builder()
            .timeout(access.timeout)
            .build()?;
        access.client = Some(client);
    }
    let client = access
        .client
        .as_ref()
        .ok_or_else(|| anyhow!("http client unavailable"))?;

    let method = reqwest::Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())?;
    let mut builder = client.request(method, &request.url);
    for (name, value) in &request.headers {
        builder = builder.header(name, value);
    }
    if let Some(body) = request.body {
        builder = builder.body(body);
    }

    let response = builder.send()?;
    let status = response.status().as_u16();
    let limit = u64::try_from(access.max_response_bytes).unwrap_or(u64::MAX);
    let mut body = Vec::new();
    response.take(limit).read_to_end(&mut body)?;
    Ok(FetchResponse {
        status,
        body: String::from_utf8_lossy(&body).into_owned(),
    })
}

fn link_http(linker: &mut Linker<StepState>) -> Result<()> {
    linker.func_wrap(
        "http",
        "fetch",
        |mut caller: Caller<'_, StepState>, ptr: i32, len: i32| -> Result<i32> {
            let bytes = read_guest(&mut caller, ptr, len)?;
            let state = caller.data_mut();
            state.fetched.clear();
            let Some(access) = state.http.as_mut() else {
                return Err(anyhow!("network access is not granted to this step"));
            };

            let request: FetchRequest = match serde_json::from_slice(&bytes) {
                Ok(request) => request,
                Err(err) => {
                    tracing::debug!("malformed fetch request: {err}");
                    return Ok(-1);
                }
            };
            let url = request.url.clone();
            match perform_fetch(access, request).and_then(|r| Ok(serde_json::to_vec(&r)?)) {
                Ok(document) => {
                    let len = guest_len(document.len());
                    state.fetched = document;
                    Ok(len)
                }
                Err(err) => {
                    tracing::debug!(url = %url, "fetch failed: {err:#}");
                    Ok(-1)
                }
            }
        },
    )?;

    linker.func_wrap(
        "http",
        "fetch_read",
        |mut caller: Caller<'_, StepState>, ptr: i32| -> Result<()> {
            let fetched = std::mem::take(&mut caller.data_mut().fetched);
            write_guest(&mut caller, ptr, &fetched)
        },
    )?;
    Ok(())
}
