//! Execution result types.
//!
//! Every [`StepExecutionRequest`](crate::step::StepExecutionRequest) produces
//! exactly one [`ExecutionResult`]. Failures are values, never thrown faults,
//! so the orchestrator can apply its retry policy uniformly from the
//! `retryable` flag.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// ErrorKind
// ---------------------------------------------------------------------------

/// Failure taxonomy shared by the supervisor, the worker and the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    /// Malformed request or uncompilable code.
    ValidationError,
    /// Built-in dispatch miss.
    UnknownNodeType,
    /// Code reached for a module outside its capability set.
    ModuleAccessDenied,
    /// Wall-clock timeout or exhausted CPU budget.
    Timeout,
    /// The isolation unit died without replying.
    SandboxCrashed,
    /// The step's own code failed.
    ExecutionError,
    /// The caller cancelled the in-flight request.
    Cancelled,
}

impl ErrorKind {
    /// Whether a failure of this kind may succeed on an identical retry.
    pub fn default_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::SandboxCrashed | Self::Cancelled)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ValidationError => "ValidationError",
            Self::UnknownNodeType => "UnknownNodeType",
            Self::ModuleAccessDenied => "ModuleAccessDenied",
            Self::Timeout => "Timeout",
            Self::SandboxCrashed => "SandboxCrashed",
            Self::ExecutionError => "ExecutionError",
            Self::Cancelled => "Cancelled",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Terminal outcome of one step execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum Outcome {
    Success {
        items: Vec<Value>,
    },
    Failure {
        kind: ErrorKind,
        message: String,
        retryable: bool,
    },
}

impl Outcome {
    /// Failure with the kind's default retry classification.
    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Failure {
            kind,
            message: message.into(),
            retryable: kind.default_retryable(),
        }
    }
}

// ---------------------------------------------------------------------------
// Logs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Map a guest-supplied numeric level (0 trace .. 4 error).
    ///
    /// Out-of-range values clamp to the nearest end.
    pub fn from_guest(level: i32) -> Self {
        match level {
            i32::MIN..=0 => Self::Trace,
            1 => Self::Debug,
            2 => Self::Info,
            3 => Self::Warn,
            _ => Self::Error,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// One log line emitted by a step, in emission order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl LogLine {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutionResult
// ---------------------------------------------------------------------------

/// The single result returned for a step execution request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub correlation_id: String,
    pub outcome: Outcome,
    pub duration_ms: u64,
    #[serde(default)]
    pub logs: Vec<LogLine>,
    /// Session that ran the request (`None` for built-in steps and for
    /// requests rejected before a session was acquired).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success { .. })
    }

    /// Whether the caller may retry this request.
    pub fn is_retryable(&self) -> bool {
        matches!(self.outcome, Outcome::Failure { retryable: true, .. })
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match &self.outcome {
            Outcome::Failure { kind, .. } => Some(*kind),
            Outcome::Success { .. } => None,
        }
    }

    /// Output items of a successful execution.
    pub fn items(&self) -> Option<&[Value]> {
        match &self.outcome {
            Outcome::Success { items } => Some(items),
            Outcome::Failure { .. } => None,
        }
    }
}
