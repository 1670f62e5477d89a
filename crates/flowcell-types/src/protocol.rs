//! Supervisor/worker message protocol.
//!
//! Messages are `type`-tagged unions. Inside one process they travel over
//! typed channels; across a process boundary each message is one JSON line
//! on the worker's stdin (supervisor to worker) or stdout (worker to
//! supervisor). Exactly one [`WorkerMessage::Result`] ends a worker's
//! involvement in a request.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::capability::CapabilitySet;
use crate::result::{ErrorKind, LogLevel};
use crate::step::{StepExecutionRequest, TrustTier};

// ---------------------------------------------------------------------------
// Supervisor -> worker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SupervisorMessage {
    Execute { payload: ExecutePayload },
    /// Ask the worker to exit after the current request.
    Shutdown,
}

/// A request plus its derived capability set, as delivered to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutePayload {
    pub correlation_id: String,
    pub step_id: String,
    pub node_type: String,
    pub trust_tier: TrustTier,
    pub code: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub input_items: Vec<Value>,
    pub capabilities: CapabilitySet,
    pub timeout_ms: u64,
}

impl ExecutePayload {
    /// Build the payload for a validated sandboxed request.
    ///
    /// A missing `code` becomes an empty module source; the supervisor has
    /// already rejected that case before a payload is built.
    pub fn from_request(
        request: &StepExecutionRequest,
        capabilities: CapabilitySet,
        timeout_ms: u64,
    ) -> Self {
        Self {
            correlation_id: request.correlation_id.clone(),
            step_id: request.step_id.clone(),
            node_type: request.node_type.clone(),
            trust_tier: request.trust_tier,
            code: request.code.clone().unwrap_or_default(),
            parameters: request.parameters.clone(),
            input_items: request.input_items.clone(),
            capabilities,
            timeout_ms,
        }
    }
}

// ---------------------------------------------------------------------------
// Worker -> supervisor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Sent once after the isolation unit finished starting.
    Ready,
    Log { level: LogLevel, text: String },
    Result(ResultMessage),
}

/// Failure detail carried by an unsuccessful [`ResultMessage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerFailure {
    pub kind: ErrorKind,
    pub message: String,
}

/// Terminal reply for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMessage {
    pub correlation_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WorkerFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ResultMessage {
    pub fn success(correlation_id: impl Into<String>, output: Vec<Value>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            success: true,
            output: Some(output),
            error: None,
            stack: None,
        }
    }

    pub fn failure(
        correlation_id: impl Into<String>,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            success: false,
            output: None,
            error: Some(WorkerFailure {
                kind,
                message: message.into(),
            }),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::HostModule;
    use serde_json::json;

    fn sample_payload() -> ExecutePayload {
        ExecutePayload {
            correlation_id: "corr-1".to_string(),
            step_id: "step-1".to_string(),
            node_type: "code".to_string(),
            trust_tier: TrustTier::UserCode,
            code: "(module)".to_string(),
            parameters: Map::new(),
            input_items: vec![json!({})],
            capabilities: CapabilitySet {
                allowed_modules: [HostModule::Step].into_iter().collect(),
                network_allowed: false,
                memory_limit_bytes: 1 << 20,
                cpu_quota_percent: 50,
            },
            timeout_ms: 1_000,
        }
    }

    #[test]
    fn execute_message_wire_shape() {
        let msg = SupervisorMessage::Execute {
            payload: sample_payload(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "execute");
        assert_eq!(value["payload"]["trustTier"], "user-code");
        assert_eq!(value["payload"]["capabilities"]["allowedModules"], json!(["step"]));
    }

    #[test]
    fn worker_messages_wire_shape() {
        let log = WorkerMessage::Log {
            level: LogLevel::Info,
            text: "hello".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&log).unwrap(),
            json!({"type": "log", "level": "info", "text": "hello"})
        );

        let ok = WorkerMessage::Result(ResultMessage::success("c", vec![json!({"a": 1})]));
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({"type": "result", "correlationId": "c", "success": true, "output": [{"a": 1}]})
        );

        let failed = WorkerMessage::Result(
            ResultMessage::failure("c", ErrorKind::ExecutionError, "boom").with_stack("at run"),
        );
        let value = serde_json::to_value(&failed).unwrap();
        assert_eq!(value["success"], false);
        assert_eq!(value["error"]["kind"], "executionError");
        assert_eq!(value["stack"], "at run");
    }

    #[test]
    fn ready_line_parses() {
        let msg: WorkerMessage = serde_json::from_str(r#"{"type":"ready"}"#).unwrap();
        assert_eq!(msg, WorkerMessage::Ready);
    }
}
