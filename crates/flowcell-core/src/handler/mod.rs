//! Trusted handler execution path.
//!
//! Built-in node types are first-party code reviewed at publish time. They
//! implement [`NodeHandler`] and run in-process with no isolation boundary;
//! the supervisor still races them against the step timeout as a safety net.

pub mod box_handler;
pub mod registry;

use std::future::Future;
use std::sync::Mutex;

use flowcell_types::result::{LogLevel, LogLine};
use serde_json::{Map, Value};

use crate::logs::LogBuffer;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Error returned by a built-in handler.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The step's parameters do not fit the handler's contract.
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    /// The handler ran and failed.
    #[error("{message}")]
    Failed { message: String, retryable: bool },
}

impl HandlerError {
    /// A non-retryable failure.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed { retryable: true, .. })
    }
}

// ---------------------------------------------------------------------------
// HandlerContext
// ---------------------------------------------------------------------------

/// Per-invocation context handed to a built-in handler.
///
/// Log lines written through [`HandlerContext::log`] land in the step's
/// `ExecutionResult.logs` in emission order.
#[derive(Debug)]
pub struct HandlerContext {
    step_id: String,
    correlation_id: String,
    input_items: Vec<Value>,
    logs: Mutex<LogBuffer>,
}

impl HandlerContext {
    pub fn new(
        step_id: impl Into<String>,
        correlation_id: impl Into<String>,
        input_items: Vec<Value>,
        max_log_lines: usize,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            correlation_id: correlation_id.into(),
            input_items,
            logs: Mutex::new(LogBuffer::new(max_log_lines)),
        }
    }

    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn input_items(&self) -> &[Value] {
        &self.input_items
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        crate::logs::emit(level, &self.step_id, &message);
        if let Ok(mut logs) = self.logs.lock() {
            logs.push(level, message);
        }
    }

    /// Take the collected log lines, leaving the buffer empty.
    pub fn take_logs(&self) -> Vec<LogLine> {
        match self.logs.lock() {
            Ok(mut logs) => {
                let capacity = logs.capacity();
                std::mem::replace(&mut *logs, LogBuffer::new(capacity)).finish()
            }
            Err(_) => Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// NodeHandler trait
// ---------------------------------------------------------------------------

/// A built-in node type implementation.
///
/// Uses RPITIT for the async method; [`box_handler::BoxNodeHandler`] provides
/// the type-erased form stored in the registry.
pub trait NodeHandler: Send + Sync {
    /// Run the node over the context's input items and return output items.
    fn execute(
        &self,
        ctx: &HandlerContext,
        parameters: &Map<String, Value>,
    ) -> impl Future<Output = Result<Vec<Value>, HandlerError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn context_collects_logs_in_order() {
        let ctx = HandlerContext::new("s", "c", vec![json!({})], 10);
        ctx.log(LogLevel::Info, "one");
        ctx.log(LogLevel::Warn, "two");
        let logs = ctx.take_logs();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].message, "one");
        assert_eq!(logs[1].level, LogLevel::Warn);
        assert!(ctx.take_logs().is_empty());
    }

    #[test]
    fn handler_error_retry_classification() {
        assert!(!HandlerError::failed("nope").is_retryable());
        assert!(!HandlerError::InvalidParameters("x".into()).is_retryable());
        let transient = HandlerError::Failed {
            message: "upstream busy".into(),
            retryable: true,
        };
        assert!(transient.is_retryable());
        assert_eq!(transient.to_string(), "upstream busy");
    }
}
