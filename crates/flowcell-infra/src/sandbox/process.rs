//! Process isolation backend.
//!
//! Each session is a child process running `flowcell worker`. The child
//! speaks the worker protocol as JSON lines: supervisor messages on its
//! stdin, worker messages on its stdout. Its stderr is inherited so worker
//! logs reach the host's log stream. Killing a session kills the child.
//!
//! On Linux the child restricts its own filesystem access with Landlock
//! before it reads any request; the host process is never restricted.

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::process::Stdio;

use anyhow::Context;
use flowcell_core::sandbox::{IsolationBackend, SandboxError, WorkerEndpoint, WorkerEvent, WorkerLink};
use flowcell_types::config::SandboxSettings;
use flowcell_types::protocol::{SupervisorMessage, WorkerMessage};
use flowcell_types::session::SessionInfo;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};

use crate::wasm::StepWorker;
use crate::wasm::runtime;

/// Subcommand that runs the stdio worker loop.
pub const WORKER_SUBCOMMAND: &str = "worker";

/// Environment variable carrying the session id into the child.
pub const SESSION_ENV: &str = "FLOWCELL_SESSION_ID";

/// Environment variable carrying the host's sandbox settings as JSON.
pub const SETTINGS_ENV: &str = "FLOWCELL_SANDBOX_SETTINGS";

/// Runs every session in its own child process.
#[derive(Debug, Clone)]
pub struct ProcessBackend {
    program: PathBuf,
    args: Vec<String>,
    settings: SandboxSettings,
}

impl ProcessBackend {
    /// Backend that re-executes the current binary as `<exe> worker`.
    pub fn current_exe(settings: SandboxSettings) -> anyhow::Result<Self> {
        let program = std::env::current_exe().context("failed to get current executable path")?;
        Ok(Self::with_command(program, vec![WORKER_SUBCOMMAND.to_string()]).with_settings(settings))
    }

    /// Backend that runs an explicit worker command.
    pub fn with_command(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            settings: SandboxSettings::default(),
        }
    }

    /// Settings forwarded to each child through [`SETTINGS_ENV`].
    pub fn with_settings(mut self, settings: SandboxSettings) -> Self {
        self.settings = settings;
        self
    }
}

impl IsolationBackend for ProcessBackend {
    fn name(&self) -> &str {
        "process"
    }

    async fn spawn(&self, session: &SessionInfo) -> Result<WorkerLink, SandboxError> {
        let settings = serde_json::to_string(&self.settings)
            .map_err(|err| SandboxError::Spawn(format!("failed to encode worker settings: {err}")))?;
        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .env(SESSION_ENV, session.session_id.to_string())
            .env(SETTINGS_ENV, settings)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                SandboxError::Spawn(format!(
                    "failed to spawn worker process {}: {err}",
                    self.program.display()
                ))
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(SandboxError::Spawn("worker process stdio not captured".to_string()));
        };

        tracing::debug!(
            session_id = %session.session_id,
            pid = ?child.id(),
            "spawned worker process"
        );

        let (link, endpoint) = WorkerLink::channel();
        tokio::spawn(pump(child, stdin, stdout, endpoint));
        Ok(link)
    }
}

/// Move messages between the link and the child until either side ends.
async fn pump(mut child: Child, mut stdin: ChildStdin, stdout: ChildStdout, endpoint: WorkerEndpoint) {
    let WorkerEndpoint {
        mut commands,
        events,
        kill,
    } = endpoint;
    let mut lines = BufReader::new(stdout).lines();

    let reason = loop {
        tokio::select! {
            _ = kill.cancelled() => break "killed by supervisor".to_string(),
            status = child.wait() => {
                // Forward whatever the child wrote before it exited.
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Ok(message) = serde_json::from_str::<WorkerMessage>(&line) {
                        let _ = events.send(WorkerEvent::Message(message));
                    }
                }
                break match status {
                    Ok(status) => format!("worker process exited with {status}"),
                    Err(err) => format!("failed to wait for worker process: {err}"),
                };
            }
            command = commands.recv() => {
                let Some(command) = command else {
                    break "supervisor closed the session".to_string();
                };
                if let Err(err) = write_line(&mut stdin, &command).await {
                    break format!("failed to write to worker stdin: {err:#}");
                }
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => match serde_json::from_str::<WorkerMessage>(&line) {
                    Ok(message) => {
                        let _ = events.send(WorkerEvent::Message(message));
                    }
                    Err(err) => break format!("malformed worker message: {err}"),
                },
                Ok(None) => break "worker closed stdout".to_string(),
                Err(err) => break format!("failed to read worker stdout: {err}"),
            },
        }
    };

    if let Err(err) = child.start_kill() {
        tracing::trace!("worker process already gone: {err}");
    }
    let _ = child.wait().await;
    tracing::debug!("worker process stopped: {reason}");
    let _ = events.send(WorkerEvent::Exited { reason });
}

async fn write_line(stdin: &mut ChildStdin, message: &SupervisorMessage) -> anyhow::Result<()> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    stdin.write_all(&line).await?;
    stdin.flush().await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Worker side
// ---------------------------------------------------------------------------

fn emit(message: &WorkerMessage) -> anyhow::Result<()> {
    let line = serde_json::to_string(message)?;
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(line.as_bytes())?;
    stdout.write_all(b"\n")?;
    stdout.flush()?;
    Ok(())
}

/// Sandbox settings handed down by the supervising process.
///
/// Falls back to defaults when the variable is unset or unparsable.
pub fn settings_from_env() -> SandboxSettings {
    let Ok(raw) = std::env::var(SETTINGS_ENV) else {
        return SandboxSettings::default();
    };
    serde_json::from_str(&raw).unwrap_or_else(|err| {
        tracing::warn!("ignoring malformed {SETTINGS_ENV}: {err}");
        SandboxSettings::default()
    })
}

/// Run the worker protocol over this process's stdin/stdout.
///
/// Blocking: call from a plain thread, never from inside an async runtime.
/// Returns when stdin closes or a `shutdown` message arrives.
pub fn run_stdio_worker(settings: &SandboxSettings) -> anyhow::Result<()> {
    #[cfg(target_os = "linux")]
    if let Err(err) = crate::sandbox_linux::restrict_filesystem() {
        tracing::warn!("failed to apply landlock restrictions: {err:#}");
    }

    let engine = runtime::create_engine().context("failed to create wasm engine")?;
    let worker = StepWorker::new(engine, settings);
    emit(&WorkerMessage::Ready)?;

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line.context("failed to read from stdin")?;
        if line.trim().is_empty() {
            continue;
        }
        let message: SupervisorMessage =
            serde_json::from_str(&line).context("malformed supervisor message")?;
        let payload = match message {
            SupervisorMessage::Execute { payload } => payload,
            SupervisorMessage::Shutdown => break,
        };

        let reply = worker.execute(&payload, |level, text| {
            if let Err(err) = emit(&WorkerMessage::Log { level, text }) {
                tracing::warn!("failed to forward log line: {err:#}");
            }
        });
        emit(&WorkerMessage::Result(reply))?;
    }
    tracing::debug!("worker stdin closed");
    Ok(())
}
