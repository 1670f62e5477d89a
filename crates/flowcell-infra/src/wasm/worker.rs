//! Step worker: runs one execute payload inside a fresh Wasmtime store.
//!
//! Every invocation gets a fresh [`Store`] to prevent state leaks, fuel
//! bounds CPU use, a [`wasmtime::ResourceLimiter`] caps memory growth, and an
//! epoch deadline lets the supervisor kill a running guest. The worker always
//! answers with exactly one [`ResultMessage`].

use std::time::Duration;

use flowcell_types::config::SandboxSettings;
use flowcell_types::protocol::{ExecutePayload, ResultMessage};
use flowcell_types::result::{ErrorKind, LogLevel};
use serde_json::{Value, json};
use wasmtime::{Engine, Linker, Store, Trap, WasmBacktrace};

use super::host::{self, GuestFailure, HttpAccess, StepState};
use super::runtime::{self, LoadError};

/// Name of the function every step module exports.
pub const ENTRY_POINT: &str = "run";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why an execution did not produce output.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("module does not export `run: [] -> []`: {0}")]
    MissingEntryPoint(String),

    #[error("{0}")]
    AccessDenied(String),

    #[error("step exhausted its CPU budget")]
    OutOfFuel,

    #[error("step was interrupted")]
    Interrupted,

    #[error("{message}")]
    Failed {
        message: String,
        stack: Option<String>,
    },

    #[error("worker setup failed: {0}")]
    Setup(String),
}

impl WorkerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Load(_) | Self::MissingEntryPoint(_) => ErrorKind::ValidationError,
            Self::AccessDenied(_) => ErrorKind::ModuleAccessDenied,
            Self::OutOfFuel | Self::Interrupted => ErrorKind::Timeout,
            Self::Failed { .. } => ErrorKind::ExecutionError,
            Self::Setup(_) => ErrorKind::SandboxCrashed,
        }
    }

    /// Terminal reply for this failure.
    pub fn into_reply(self, correlation_id: &str) -> ResultMessage {
        let kind = self.kind();
        let message = self.to_string();
        let reply = ResultMessage::failure(correlation_id, kind, message);
        match self {
            Self::Failed {
                stack: Some(stack), ..
            } => reply.with_stack(stack),
            _ => reply,
        }
    }

    /// Classify an error raised while running guest code.
    fn from_guest(err: anyhow::Error) -> Self {
        if let Some(trap) = err.downcast_ref::<Trap>() {
            match trap {
                Trap::OutOfFuel => return Self::OutOfFuel,
                Trap::Interrupt => return Self::Interrupted,
                _ => {}
            }
        }
        let stack = err
            .downcast_ref::<WasmBacktrace>()
            .map(ToString::to_string)
            .filter(|stack| !stack.trim().is_empty());
        let message = match err.downcast_ref::<GuestFailure>() {
            Some(failure) => failure.0.clone(),
            None => match err.downcast_ref::<Trap>() {
                Some(trap) => format!("wasm trap: {trap}"),
                None => err.root_cause().to_string(),
            },
        };
        Self::Failed { message, stack }
    }
}

// ---------------------------------------------------------------------------
// StepWorker
// ---------------------------------------------------------------------------

/// Reports whether the session was killed.
type InterruptCheck = Box<dyn Fn() -> bool + Send + Sync>;

/// Executes payloads on one session's engine.
pub struct StepWorker {
    engine: Engine,
    fuel_per_second: u64,
    http_max_response_bytes: usize,
    interrupted: Option<InterruptCheck>,
}

impl StepWorker {
    pub fn new(engine: Engine, settings: &SandboxSettings) -> Self {
        Self {
            engine,
            fuel_per_second: settings.fuel_per_second,
            http_max_response_bytes: settings.http_max_response_bytes,
            interrupted: None,
        }
    }

    /// Consult `check` before compiling and once the epoch deadline is armed.
    ///
    /// An epoch bump that lands before the deadline is set cannot trap the
    /// guest, so a kill raised during compilation is only seen through this
    /// check.
    pub fn with_interrupt_check(mut self, check: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.interrupted = Some(Box::new(check));
        self
    }

    fn ensure_running(&self) -> Result<(), WorkerError> {
        match &self.interrupted {
            Some(check) if check() => Err(WorkerError::Interrupted),
            _ => Ok(()),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Run `payload`, forwarding guest log lines to `log_sink`.
    pub fn execute(
        &self,
        payload: &ExecutePayload,
        log_sink: impl FnMut(LogLevel, String) + Send + 'static,
    ) -> ResultMessage {
        let span = tracing::debug_span!(
            "step.worker",
            step_id = %payload.step_id,
            correlation_id = %payload.correlation_id,
        );
        let _entered = span.enter();

        match self.run(payload, Box::new(log_sink)) {
            Ok(items) => ResultMessage::success(&payload.correlation_id, items),
            Err(err) => {
                tracing::debug!(kind = %err.kind(), "step execution failed: {err}");
                err.into_reply(&payload.correlation_id)
            }
        }
    }

    /// # Security model
    ///
    /// 1. Module compiled from the payload's code
    /// 2. Imports checked against the capability set before instantiation
    /// 3. Linker defines only the granted host modules
    /// 4. Fresh Store with fuel, epoch deadline and memory limiter
    /// 5. `run` called; output normalized or input passed through
    fn run(&self, payload: &ExecutePayload, log_sink: host::LogSink) -> Result<Vec<Value>, WorkerError> {
        let capabilities = &payload.capabilities;
        self.ensure_running()?;
        let module = runtime::load_module(&self.engine, &payload.code)?;
        host::check_imports(&module, capabilities).map_err(WorkerError::AccessDenied)?;

        let mut linker: Linker<StepState> = Linker::new(&self.engine);
        host::link_host_modules(&mut linker, capabilities)
            .map_err(|err| WorkerError::Setup(format!("{err:#}")))?;

        let input = serde_json::to_vec(&json!({
            "parameters": payload.parameters,
            "items": payload.input_items,
        }))
        .map_err(|err| WorkerError::Setup(err.to_string()))?;
        let http = capabilities.network_allowed.then(|| {
            HttpAccess::new(
                Duration::from_millis(payload.timeout_ms.max(1)),
                self.http_max_response_bytes,
            )
        });
        let max_memory_bytes = usize::try_from(capabilities.memory_limit_bytes).unwrap_or(usize::MAX);

        let mut store = Store::new(
            &self.engine,
            StepState::new(input, log_sink, http, max_memory_bytes),
        );
        store.limiter(|state| state);
        let fuel = runtime::fuel_budget(
            self.fuel_per_second,
            payload.timeout_ms,
            capabilities.cpu_quota_percent,
        );
        store
            .set_fuel(fuel)
            .map_err(|err| WorkerError::Setup(format!("failed to set fuel: {err}")))?;
        store.set_epoch_deadline(1);
        store.epoch_deadline_trap();
        self.ensure_running()?;

        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(WorkerError::from_guest)?;
        let entry = instance
            .get_typed_func::<(), ()>(&mut store, ENTRY_POINT)
            .map_err(|err| WorkerError::MissingEntryPoint(err.root_cause().to_string()))?;

        entry.call(&mut store, ()).map_err(WorkerError::from_guest)?;

        let consumed = fuel.saturating_sub(store.get_fuel().unwrap_or(0));
        tracing::trace!(fuel_consumed = consumed, "step module returned");

        Ok(store
            .data_mut()
            .take_output()
            .unwrap_or_else(|| payload.input_items.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowcell_types::capability::{CapabilitySet, HostModule};
    use flowcell_types::step::TrustTier;
    use serde_json::Map;
    use std::sync::{Arc, Mutex};

    fn payload(code: &str) -> ExecutePayload {
        ExecutePayload {
            correlation_id: "corr".to_string(),
            step_id: "step".to_string(),
            node_type: "code".to_string(),
            trust_tier: TrustTier::UserCode,
            code: code.to_string(),
            parameters: Map::new(),
            input_items: vec![json!({"n": 1})],
            capabilities: CapabilitySet {
                allowed_modules: HostModule::UTILITY.into_iter().collect(),
                network_allowed: false,
                memory_limit_bytes: 4 * 1024 * 1024,
                cpu_quota_percent: 100,
            },
            timeout_ms: 1_000,
        }
    }

    fn worker() -> StepWorker {
        StepWorker::new(runtime::create_engine().unwrap(), &SandboxSettings::default())
    }

    fn run(code: &str) -> ResultMessage {
        worker().execute(&payload(code), |_, _| {})
    }

    fn failure_kind(reply: &ResultMessage) -> Option<ErrorKind> {
        reply.error.as_ref().map(|failure| failure.kind)
    }

    #[test]
    fn killed_worker_refuses_to_start_guest() {
        let worker = worker().with_interrupt_check(|| true);
        let reply = worker.execute(&payload(r#"(module (func (export "run") (loop br 0)))"#), |_, _| {});
        assert!(!reply.success);
        assert_eq!(failure_kind(&reply), Some(ErrorKind::Timeout));
        assert_eq!(
            reply.error.map(|failure| failure.message),
            Some("step was interrupted".to_string())
        );
    }

    #[test]
    fn kill_raised_while_compiling_still_stops_guest() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        // First check passes, later ones report the kill. The epoch is never
        // bumped, so only the post-deadline check can stop the loop.
        let checks = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&checks);
        let worker = worker().with_interrupt_check(move || seen.fetch_add(1, Ordering::SeqCst) > 0);
        let reply = worker.execute(&payload(r#"(module (func (export "run") (loop br 0)))"#), |_, _| {});
        assert_eq!(failure_kind(&reply), Some(ErrorKind::Timeout));
        assert_eq!(checks.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn live_worker_runs_normally_with_check() {
        let worker = worker().with_interrupt_check(|| false);
        let reply = worker.execute(&payload(r#"(module (func (export "run")))"#), |_, _| {});
        assert!(reply.success);
    }

    #[test]
    fn module_without_output_passes_input_through() {
        let reply = run(r#"(module (memory (export "memory") 1) (func (export "run")))"#);
        assert!(reply.success);
        assert_eq!(reply.output, Some(vec![json!({"n": 1})]));
    }

    #[test]
    fn output_is_read_from_guest_memory() {
        let reply = run(
            r#"(module
                (import "step" "output" (func $output (param i32 i32)))
                (memory (export "memory") 1)
                (data (i32.const 16) "{\"greeting\":\"hi\"}")
                (func (export "run") (call $output (i32.const 16) (i32.const 17))))"#,
        );
        assert!(reply.success, "{reply:?}");
        assert_eq!(reply.output, Some(vec![json!({"greeting": "hi"})]));
    }

    #[test]
    fn input_document_is_readable() {
        // Echo the input document's length back as a log line.
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink_lines = Arc::clone(&lines);
        let reply = worker().execute(
            &payload(
                r#"(module
                    (import "step" "input_len" (func $len (result i32)))
                    (import "step" "input_read" (func $read (param i32)))
                    (import "step" "log" (func $log (param i32 i32 i32)))
                    (memory (export "memory") 1)
                    (func (export "run")
                        (call $read (i32.const 0))
                        (call $log (i32.const 2) (i32.const 0) (call $len))))"#,
            ),
            move |level, text| sink_lines.lock().unwrap().push((level, text)),
        );
        assert!(reply.success, "{reply:?}");
        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].0, LogLevel::Info);
        let document: Value = serde_json::from_str(&lines[0].1).unwrap();
        assert_eq!(document, json!({"parameters": {}, "items": [{"n": 1}]}));
    }

    #[test]
    fn fail_reports_execution_error_with_message() {
        let reply = run(
            r#"(module
                (import "step" "fail" (func $fail (param i32 i32)))
                (memory (export "memory") 1)
                (data (i32.const 0) "bad input")
                (func (export "run") (call $fail (i32.const 0) (i32.const 9))))"#,
        );
        assert!(!reply.success);
        let failure = reply.error.unwrap();
        assert_eq!(failure.kind, ErrorKind::ExecutionError);
        assert_eq!(failure.message, "bad input");
    }

    #[test]
    fn trap_is_execution_error() {
        let reply = run(r#"(module (func (export "run") unreachable))"#);
        assert_eq!(failure_kind(&reply), Some(ErrorKind::ExecutionError));
    }

    #[test]
    fn malformed_output_is_execution_error() {
        let reply = run(
            r#"(module
                (import "step" "output" (func $output (param i32 i32)))
                (memory (export "memory") 1)
                (data (i32.const 0) "[1,2]")
                (func (export "run") (call $output (i32.const 0) (i32.const 5))))"#,
        );
        assert_eq!(failure_kind(&reply), Some(ErrorKind::ExecutionError));
    }

    #[test]
    fn infinite_loop_runs_out_of_fuel() {
        let settings = SandboxSettings {
            fuel_per_second: 1_000_000,
            ..SandboxSettings::default()
        };
        let worker = StepWorker::new(runtime::create_engine().unwrap(), &settings);
        let reply = worker.execute(
            &payload(r#"(module (func (export "run") (loop br 0)))"#),
            |_, _| {},
        );
        assert_eq!(failure_kind(&reply), Some(ErrorKind::Timeout));
    }

    #[test]
    fn epoch_increment_interrupts_guest() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let worker = worker();
        let engine = worker.engine().clone();
        let done = Arc::new(AtomicBool::new(false));
        let killer_done = Arc::clone(&done);
        let killer = std::thread::spawn(move || {
            while !killer_done.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(50));
                engine.increment_epoch();
            }
        });

        let mut request = payload(r#"(module (func (export "run") (loop br 0)))"#);
        request.timeout_ms = 600_000;
        let reply = worker.execute(&request, |_, _| {});
        done.store(true, Ordering::SeqCst);
        killer.join().unwrap();

        assert_eq!(failure_kind(&reply), Some(ErrorKind::Timeout));
        assert_eq!(reply.error.unwrap().message, "step was interrupted");
    }

    #[test]
    fn denied_import_never_runs() {
        let reply = run(r#"(module (import "fs" "read" (func)) (func (export "run")))"#);
        assert_eq!(failure_kind(&reply), Some(ErrorKind::ModuleAccessDenied));
    }

    #[test]
    fn http_requires_network_capability() {
        let reply = run(
            r#"(module (import "http" "fetch" (func (param i32 i32) (result i32))) (func (export "run")))"#,
        );
        assert_eq!(failure_kind(&reply), Some(ErrorKind::ModuleAccessDenied));
    }

    #[test]
    fn invalid_code_is_validation_error() {
        assert_eq!(failure_kind(&run("while(true){}")), Some(ErrorKind::ValidationError));
        assert_eq!(
            failure_kind(&run(r#"(module (func (export "main")))"#)),
            Some(ErrorKind::ValidationError)
        );
    }

    #[test]
    fn memory_growth_beyond_limit_fails() {
        // 4 MiB limit; growing by 100 pages (6.25 MiB) returns -1 and the
        // module traps on that result.
        let reply = run(
            r#"(module
                (memory (export "memory") 1)
                (func (export "run")
                    (if (i32.eq (memory.grow (i32.const 100)) (i32.const -1))
                        (then unreachable))))"#,
        );
        assert_eq!(failure_kind(&reply), Some(ErrorKind::ExecutionError));
    }

    #[test]
    fn host_utilities_compute_values() {
        // sha256("abc") starts with 0xba; uppercase "abc" -> "ABC" (0x41).
        let reply = run(
            r#"(module
                (import "hash" "sha256" (func $sha (param i32 i32 i32)))
                (import "string" "to_upper" (func $upper (param i32 i32)))
                (import "math" "sqrt" (func $sqrt (param f64) (result f64)))
                (import "step" "fail" (func $fail (param i32 i32)))
                (memory (export "memory") 1)
                (data (i32.const 0) "abc")
                (data (i32.const 200) "wrong")
                (func (export "run")
                    (call $sha (i32.const 0) (i32.const 3) (i32.const 100))
                    (if (i32.ne (i32.load8_u (i32.const 100)) (i32.const 0xba))
                        (then (call $fail (i32.const 200) (i32.const 5))))
                    (call $upper (i32.const 0) (i32.const 3))
                    (if (i32.ne (i32.load8_u (i32.const 0)) (i32.const 0x41))
                        (then (call $fail (i32.const 200) (i32.const 5))))
                    (if (f64.ne (call $sqrt (f64.const 16)) (f64.const 4))
                        (then (call $fail (i32.const 200) (i32.const 5))))))"#,
        );
        assert!(reply.success, "{reply:?}");
    }

    #[test]
    fn each_execution_gets_fresh_globals() {
        // A mutable global incremented per run: fails if it ever reads 1 on
        // entry, which would mean state survived from the previous run.
        let code = r#"(module
            (import "step" "fail" (func $fail (param i32 i32)))
            (memory (export "memory") 1)
            (data (i32.const 0) "leaked")
            (global $runs (mut i32) (i32.const 0))
            (func (export "run")
                (if (i32.ne (global.get $runs) (i32.const 0))
                    (then (call $fail (i32.const 0) (i32.const 6))))
                (global.set $runs (i32.add (global.get $runs) (i32.const 1)))))"#;
        let worker = worker();
        for _ in 0..3 {
            assert!(worker.execute(&payload(code), |_, _| {}).success);
        }
    }
}
