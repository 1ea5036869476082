//! A2A (Agent-to-Agent) protocol types
//!
//! Agent cards served at `/.well-known/agent-card.json`, JSON-RPC 2.0
//! envelopes, the closed set of methods the relay routes, and the task
//! lifecycle states agents report.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RelayError;

/// Discovery document path, relative to an agent's base URL
pub const AGENT_CARD_PATH: &str = ".well-known/agent-card.json";

/// Discovery path used by agents that predate `agent-card.json`
pub const LEGACY_AGENT_CARD_PATH: &str = ".well-known/agent.json";

/// Well-known header names
pub mod headers {
    pub const SESSION_ID: &str = "x-amzn-bedrock-agentcore-runtime-session-id";
    pub const CORRELATION_ID: &str = "x-correlation-id";
    pub const ROUTING_KEY: &str = "x-relay-agent";
    pub const CALLER: &str = "x-relay-caller";
    pub const LAST_EVENT_ID: &str = "last-event-id";
}

/// Agent Card: advertises identity, capabilities and service endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCard {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_transport: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: AgentCapabilities,
    #[serde(default)]
    pub skills: Vec<AgentSkill>,
    #[serde(default)]
    pub default_input_modes: Vec<String>,
    #[serde(default)]
    pub default_output_modes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_interfaces: Vec<AgentInterface>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<AgentProvider>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCapabilities {
    #[serde(default)]
    pub streaming: bool,
    #[serde(default)]
    pub push_notifications: bool,
    #[serde(default)]
    pub state_transition_history: bool,
}

/// Skill metadata; opaque to the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSkill {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub examples: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input_modes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_modes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInterface {
    pub url: String,
    pub transport: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProvider {
    pub organization: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl AgentCard {
    /// Check the fields routing depends on: identity, an endpoint, a transport.
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.name.trim().is_empty() {
            return Err(RelayError::InvalidCard("missing name".into()));
        }
        if self.version.trim().is_empty() {
            return Err(RelayError::InvalidCard(format!(
                "card '{}' has no version",
                self.name
            )));
        }
        if self.primary_endpoint().is_none() {
            return Err(RelayError::InvalidCard(format!(
                "card '{}' declares no usable service endpoint",
                self.name
            )));
        }
        match self.preferred_transport.as_deref() {
            Some(t) if !t.trim().is_empty() => Ok(()),
            _ => Err(RelayError::InvalidCard(format!(
                "card '{}' has no preferred transport",
                self.name
            ))),
        }
    }

    /// The first parseable endpoint: `url`, then any additional interface.
    pub fn primary_endpoint(&self) -> Option<&str> {
        std::iter::once(self.url.as_str())
            .chain(self.additional_interfaces.iter().map(|i| i.url.as_str()))
            .find(|u| url::Url::parse(u).is_ok())
    }

    pub fn supports_streaming(&self) -> bool {
        self.capabilities.streaming
    }
}

/// JSON-RPC 2.0 request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl JsonRpcRequest {
    /// The request id, `null` for notifications.
    pub fn id_or_null(&self) -> Value {
        self.id.clone().unwrap_or(Value::Null)
    }
}

/// JSON-RPC 2.0 response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC error object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    pub fn from_error(id: Value, err: &RelayError) -> Self {
        Self::error(id, err.rpc_code(), err.to_string())
    }
}

/// Standard JSON-RPC, A2A and relay error codes
pub mod error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;

    pub const TASK_NOT_FOUND: i64 = -32001;
    pub const TASK_NOT_CANCELABLE: i64 = -32002;
    pub const UNSUPPORTED_OPERATION: i64 = -32004;

    pub const UNAUTHENTICATED: i64 = -32040;
    pub const FORBIDDEN: i64 = -32041;
    pub const DUPLICATE_REQUEST_ID: i64 = -32042;
    pub const TIMEOUT: i64 = -32043;
    pub const AGENT_UNREACHABLE: i64 = -32044;
    pub const DISCOVERY_UNAVAILABLE: i64 = -32045;
    pub const INVALID_CARD: i64 = -32046;
    pub const UNKNOWN_AGENT: i64 = -32047;
}

/// Methods the relay routes. Dispatch is decided by this enum alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    MessageSend,
    MessageStream,
    TasksGet,
    TasksCancel,
    TasksResubscribe,
}

impl Method {
    pub const ALL: [Method; 5] = [
        Self::MessageSend,
        Self::MessageStream,
        Self::TasksGet,
        Self::TasksCancel,
        Self::TasksResubscribe,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MessageSend => "message/send",
            Self::MessageStream => "message/stream",
            Self::TasksGet => "tasks/get",
            Self::TasksCancel => "tasks/cancel",
            Self::TasksResubscribe => "tasks/resubscribe",
        }
    }

    /// Methods whose reply is delivered as an event stream
    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::MessageStream | Self::TasksResubscribe)
    }
}

impl FromStr for Method {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| RelayError::UnsupportedMethod(s.to_string()))
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskState {
    Submitted,
    Working,
    InputRequired,
    Completed,
    Failed,
    #[serde(alias = "cancelled")]
    Canceled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    /// Whether `next` is reachable from `self` in one step.
    ///
    /// submitted → working → {input-required ⇄ working} → {completed | failed | canceled};
    /// any non-terminal state may end, and repeating the current state is a progress update.
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        if self.is_terminal() {
            return false;
        }
        if *self == next || next.is_terminal() {
            return true;
        }
        matches!(
            (self, next),
            (Submitted, Working) | (Working, InputRequired) | (InputRequired, Working)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Working => "working",
            Self::InputRequired => "input-required",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(Value::String(s.to_string()))
            .map_err(|_| RelayError::InvalidParams(format!("unknown task state '{}'", s)))
    }
}

/// `params` of `tasks/get`, `tasks/cancel` and `tasks/resubscribe`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskIdParams {
    pub id: String,
    #[serde(default)]
    pub history_length: Option<u32>,
}

/// What an agent put in a JSON-RPC `result`, as far as routing cares.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultShape {
    /// A direct reply; no task was created
    Message,
    Task {
        id: String,
        context_id: Option<String>,
        state: TaskState,
    },
    StatusUpdate {
        task_id: String,
        state: TaskState,
        is_final: bool,
    },
    ArtifactUpdate {
        task_id: String,
    },
    Other,
}

impl ResultShape {
    pub fn classify(result: &Value) -> Self {
        let kind = result.get("kind").and_then(Value::as_str);
        let state = || {
            result
                .get("status")
                .and_then(|s| s.get("state"))
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<TaskState>().ok())
        };
        let str_field = |name: &str| result.get(name).and_then(Value::as_str).map(String::from);

        match kind {
            Some("message") => Self::Message,
            Some("task") => match (str_field("id"), state()) {
                (Some(id), Some(state)) => Self::Task {
                    id,
                    context_id: str_field("contextId"),
                    state,
                },
                _ => Self::Other,
            },
            Some("status-update") => match (str_field("taskId"), state()) {
                (Some(task_id), Some(state)) => Self::StatusUpdate {
                    task_id,
                    state,
                    is_final: result.get("final").and_then(Value::as_bool).unwrap_or(false),
                },
                _ => Self::Other,
            },
            Some("artifact-update") => match str_field("taskId") {
                Some(task_id) => Self::ArtifactUpdate { task_id },
                None => Self::Other,
            },
            Some(_) => Self::Other,
            // Agents on older SDKs omit `kind`
            None => {
                if result.get("role").is_some() && result.get("parts").is_some() {
                    Self::Message
                } else if let (Some(id), Some(state)) = (str_field("id"), state()) {
                    Self::Task {
                        id,
                        context_id: str_field("contextId"),
                        state,
                    }
                } else {
                    Self::Other
                }
            }
        }
    }

    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::Task { id, .. } => Some(id),
            Self::StatusUpdate { task_id, .. } | Self::ArtifactUpdate { task_id } => Some(task_id),
            Self::Message | Self::Other => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn card_json() -> Value {
        json!({
            "name": "Monitoring_Agent",
            "description": "CloudWatch monitoring",
            "version": "1.0.0",
            "url": "http://127.0.0.1:9000/",
            "preferredTransport": "JSONRPC",
            "capabilities": {"streaming": true},
            "skills": [{"id": "logs", "name": "Logs", "tags": ["aws"]}],
            "defaultInputModes": ["text"],
            "defaultOutputModes": ["text"]
        })
    }

    #[test]
    fn test_agent_card_deserialization() {
        let card: AgentCard = serde_json::from_value(card_json()).unwrap();
        assert_eq!(card.name, "Monitoring_Agent");
        assert!(card.supports_streaming());
        assert!(!card.capabilities.push_notifications);
        assert_eq!(card.skills[0].tags, vec!["aws"]);
        assert!(card.validate().is_ok());
    }

    #[test]
    fn test_card_without_transport_is_invalid() {
        let mut value = card_json();
        value.as_object_mut().unwrap().remove("preferredTransport");
        let card: AgentCard = serde_json::from_value(value).unwrap();
        assert!(matches!(card.validate(), Err(RelayError::InvalidCard(_))));
    }

    #[test]
    fn test_card_endpoint_from_additional_interfaces() {
        let mut value = card_json();
        value["url"] = json!("");
        value["additionalInterfaces"] = json!([{"url": "https://agent.example/a2a", "transport": "JSONRPC"}]);
        let card: AgentCard = serde_json::from_value(value).unwrap();
        assert_eq!(card.primary_endpoint(), Some("https://agent.example/a2a"));
        assert!(card.validate().is_ok());
    }

    #[test]
    fn test_card_without_endpoint_is_invalid() {
        let mut value = card_json();
        value["url"] = json!("not a url");
        let card: AgentCard = serde_json::from_value(value).unwrap();
        let err = card.validate().unwrap_err();
        assert!(err.to_string().contains("endpoint"));
    }

    #[test]
    fn test_method_parse() {
        assert_eq!("message/send".parse::<Method>().unwrap(), Method::MessageSend);
        assert_eq!("tasks/resubscribe".parse::<Method>().unwrap(), Method::TasksResubscribe);
        let err = "tasks/pushNotificationConfig/set".parse::<Method>().unwrap_err();
        assert!(matches!(err, RelayError::UnsupportedMethod(_)));
        assert!(Method::MessageStream.is_streaming());
        assert!(!Method::TasksCancel.is_streaming());
    }

    #[test]
    fn test_task_state_lattice() {
        use TaskState::*;
        assert!(Submitted.can_transition_to(Working));
        assert!(Working.can_transition_to(InputRequired));
        assert!(InputRequired.can_transition_to(Working));
        assert!(Working.can_transition_to(Completed));
        assert!(Submitted.can_transition_to(Canceled));
        assert!(Working.can_transition_to(Working));
        assert!(!Working.can_transition_to(Submitted));
        assert!(!Submitted.can_transition_to(InputRequired));
        assert!(!Completed.can_transition_to(Working));
        assert!(!Completed.can_transition_to(Canceled));
    }

    #[test]
    fn test_task_state_serde() {
        assert_eq!(serde_json::to_value(TaskState::InputRequired).unwrap(), "input-required");
        assert_eq!("cancelled".parse::<TaskState>().unwrap(), TaskState::Canceled);
        assert!("rejected-ish".parse::<TaskState>().is_err());
    }

    #[test]
    fn test_classify_results() {
        let task = json!({"kind": "task", "id": "t-1", "contextId": "c-1", "status": {"state": "submitted"}});
        assert_eq!(
            ResultShape::classify(&task),
            ResultShape::Task {
                id: "t-1".into(),
                context_id: Some("c-1".into()),
                state: TaskState::Submitted
            }
        );

        let update = json!({"kind": "status-update", "taskId": "t-1", "status": {"state": "completed"}, "final": true});
        assert_eq!(
            ResultShape::classify(&update),
            ResultShape::StatusUpdate {
                task_id: "t-1".into(),
                state: TaskState::Completed,
                is_final: true
            }
        );

        let message = json!({"role": "agent", "parts": [{"kind": "text", "text": "4"}]});
        assert_eq!(ResultShape::classify(&message), ResultShape::Message);
        assert_eq!(ResultShape::classify(&json!("4")), ResultShape::Other);
    }

    #[test]
    fn test_response_error_shape() {
        let resp = JsonRpcResponse::from_error(json!(7), &RelayError::DuplicateRequestId("7".into()));
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["id"], 7);
        assert_eq!(value["error"]["code"], error_codes::DUPLICATE_REQUEST_ID);
        assert!(value.get("result").is_none());
    }
}
