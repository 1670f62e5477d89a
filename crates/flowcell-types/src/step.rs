//! Step execution request types.
//!
//! A [`StepExecutionRequest`] is what the external scheduler hands to the
//! executor for one invocation of one workflow step.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::policy::NodePolicy;

// ---------------------------------------------------------------------------
// TrustTier
// ---------------------------------------------------------------------------

/// Classification of where a step's code comes from.
///
/// - `BuiltIn`: first-party handler, runs in-process with no sandbox.
/// - `Plugin`: plugin package code, runs in a sandbox session.
/// - `UserCode`: code typed by a workflow author, runs in a sandbox session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TrustTier {
    #[serde(rename = "built-in")]
    BuiltIn,
    #[serde(rename = "plugin")]
    Plugin,
    #[serde(rename = "user-code")]
    UserCode,
}

impl TrustTier {
    /// All tiers, in increasing order of distrust.
    pub const ALL: [TrustTier; 3] = [TrustTier::BuiltIn, TrustTier::Plugin, TrustTier::UserCode];

    /// Whether steps of this tier run inside a sandbox session.
    pub fn is_sandboxed(&self) -> bool {
        !matches!(self, TrustTier::BuiltIn)
    }
}

impl Default for TrustTier {
    fn default() -> Self {
        Self::UserCode
    }
}

impl fmt::Display for TrustTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BuiltIn => write!(f, "built-in"),
            Self::Plugin => write!(f, "plugin"),
            Self::UserCode => write!(f, "user-code"),
        }
    }
}

impl std::str::FromStr for TrustTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "built-in" | "builtin" => Ok(Self::BuiltIn),
            "plugin" => Ok(Self::Plugin),
            "user-code" | "user" => Ok(Self::UserCode),
            other => Err(format!("unknown trust tier '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// StepExecutionRequest
// ---------------------------------------------------------------------------

/// One invocation of one workflow step.
///
/// `code` is required iff `trust_tier` is not [`TrustTier::BuiltIn`]; the
/// supervisor rejects violations as a validation error rather than at
/// deserialization time so the caller always receives a structured result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepExecutionRequest {
    pub step_id: String,
    pub node_type: String,
    #[serde(default)]
    pub trust_tier: TrustTier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub input_items: Vec<Value>,
    #[serde(default)]
    pub policy: NodePolicy,
    #[serde(default = "new_correlation_id")]
    pub correlation_id: String,
}

fn new_correlation_id() -> String {
    Uuid::now_v7().to_string()
}

impl StepExecutionRequest {
    /// Request for a built-in node type with a fresh correlation id.
    pub fn built_in(node_type: impl Into<String>) -> Self {
        let node_type = node_type.into();
        Self {
            step_id: node_type.clone(),
            node_type,
            trust_tier: TrustTier::BuiltIn,
            code: None,
            parameters: Map::new(),
            input_items: Vec::new(),
            policy: NodePolicy::default(),
            correlation_id: new_correlation_id(),
        }
    }

    /// Request for sandboxed code of the given tier with a fresh correlation id.
    pub fn sandboxed(trust_tier: TrustTier, code: impl Into<String>) -> Self {
        Self {
            step_id: "code".to_string(),
            node_type: "code".to_string(),
            trust_tier,
            code: Some(code.into()),
            parameters: Map::new(),
            input_items: Vec::new(),
            policy: NodePolicy::default(),
            correlation_id: new_correlation_id(),
        }
    }

    /// Replace the parameters (a JSON object; other values are ignored).
    pub fn with_parameters(mut self, parameters: Value) -> Self {
        if let Value::Object(map) = parameters {
            self.parameters = map;
        }
        self
    }

    pub fn with_input_items(mut self, items: Vec<Value>) -> Self {
        self.input_items = items;
        self
    }

    pub fn with_policy(mut self, policy: NodePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn trust_tier_uses_hyphenated_wire_names() {
        assert_eq!(serde_json::to_string(&TrustTier::BuiltIn).unwrap(), "\"built-in\"");
        assert_eq!(serde_json::to_string(&TrustTier::UserCode).unwrap(), "\"user-code\"");
        let tier: TrustTier = serde_json::from_str("\"plugin\"").unwrap();
        assert_eq!(tier, TrustTier::Plugin);
    }

    #[test]
    fn trust_tier_defaults_to_least_privilege() {
        assert_eq!(TrustTier::default(), TrustTier::UserCode);
        assert!(TrustTier::default().is_sandboxed());
        assert!(!TrustTier::BuiltIn.is_sandboxed());
    }

    #[test]
    fn trust_tier_parses_from_cli_strings() {
        assert_eq!("built-in".parse::<TrustTier>().unwrap(), TrustTier::BuiltIn);
        assert_eq!("user".parse::<TrustTier>().unwrap(), TrustTier::UserCode);
        assert!("root".parse::<TrustTier>().is_err());
    }

    #[test]
    fn request_deserializes_from_scheduler_json() {
        let json = json!({
            "stepId": "step-1",
            "nodeType": "set",
            "trustTier": "built-in",
            "parameters": {"values": {"greeting": "hi"}},
            "inputItems": [{}],
            "policy": {"timeoutSeconds": 5},
            "correlationId": "corr-1"
        });
        let request: StepExecutionRequest = serde_json::from_value(json).unwrap();
        assert_eq!(request.node_type, "set");
        assert_eq!(request.trust_tier, TrustTier::BuiltIn);
        assert!(request.code.is_none());
        assert_eq!(request.input_items.len(), 1);
        assert_eq!(request.policy.timeout_seconds, Some(5));
        assert_eq!(request.correlation_id, "corr-1");
    }

    #[test]
    fn missing_correlation_id_is_generated() {
        let json = json!({"stepId": "s", "nodeType": "noop", "trustTier": "built-in"});
        let request: StepExecutionRequest = serde_json::from_value(json).unwrap();
        assert!(!request.correlation_id.is_empty());
    }

    #[test]
    fn builders_set_fields() {
        let request = StepExecutionRequest::sandboxed(TrustTier::Plugin, "(module)")
            .with_parameters(json!({"a": 1}))
            .with_input_items(vec![json!({"x": 1})])
            .with_correlation_id("c");
        assert_eq!(request.code.as_deref(), Some("(module)"));
        assert_eq!(request.parameters.get("a"), Some(&json!(1)));
        assert_eq!(request.correlation_id, "c");
    }
}
