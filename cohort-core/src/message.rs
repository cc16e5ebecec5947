//! IPC message protocol between the master and its children
//!
//! Every message travels inside an [`Envelope`] as one line of JSON. The
//! `action` string selects the [`Message`] variant; unknown actions are kept
//! as [`Message::Custom`] so embedders can extend the protocol.

use crate::error::{ClusterError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Action names used on the wire
pub mod actions {
    pub const HELLO: &str = "ipc:hello";
    pub const AGENT_SUCCESS: &str = "ipc:agent#success";
    pub const AGENT_ERROR: &str = "ipc:agent#error";
    pub const WORKER_SUCCESS: &str = "ipc:worker#success";
    pub const WORKER_ERROR: &str = "ipc:worker#error";
    pub const AGENT_CLOSE: &str = "ipc:agent#close";
    pub const WORKER_CLOSE: &str = "ipc:worker#close";
    pub const AGENT_EXTRA: &str = "agent:extra:data";
    pub const CLUSTER_READY: &str = "cluster:ready";
    pub const TEARDOWN: &str = "teardown";
}

/// A single participant on the channel
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Endpoint {
    Master,
    Agent { name: String },
    Worker { pid: u32 },
}

impl Endpoint {
    pub fn agent(name: impl Into<String>) -> Self {
        Endpoint::Agent { name: name.into() }
    }

    pub fn worker(pid: u32) -> Self {
        Endpoint::Worker { pid }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Master => write!(f, "master"),
            Endpoint::Agent { name } => write!(f, "agent:{}", name),
            Endpoint::Worker { pid } => write!(f, "worker:{}", pid),
        }
    }
}

/// Destination of a message: one endpoint or a whole group
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Target {
    Master,
    Agent { name: String },
    Worker { pid: u32 },
    Agents,
    Workers,
}

impl Target {
    /// Whether `endpoint` is addressed by this target
    pub fn matches(&self, endpoint: &Endpoint) -> bool {
        match (self, endpoint) {
            (Target::Master, Endpoint::Master) => true,
            (Target::Agent { name: a }, Endpoint::Agent { name: b }) => a == b,
            (Target::Worker { pid: a }, Endpoint::Worker { pid: b }) => a == b,
            (Target::Agents, Endpoint::Agent { .. }) => true,
            (Target::Workers, Endpoint::Worker { .. }) => true,
            _ => false,
        }
    }

    /// The single endpoint this target names, if it is not a group
    pub fn endpoint(&self) -> Option<Endpoint> {
        match self {
            Target::Master => Some(Endpoint::Master),
            Target::Agent { name } => Some(Endpoint::agent(name.clone())),
            Target::Worker { pid } => Some(Endpoint::worker(*pid)),
            Target::Agents | Target::Workers => None,
        }
    }
}

impl From<Endpoint> for Target {
    fn from(endpoint: Endpoint) -> Self {
        match endpoint {
            Endpoint::Master => Target::Master,
            Endpoint::Agent { name } => Target::Agent { name },
            Endpoint::Worker { pid } => Target::Worker { pid },
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Agents => write!(f, "agents"),
            Target::Workers => write!(f, "workers"),
            other => match other.endpoint() {
                Some(endpoint) => write!(f, "{}", endpoint),
                None => Ok(()),
            },
        }
    }
}

/// Decoded message
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Connection handshake, first line a child writes
    Hello,
    /// Agent finished `create` and is ready
    AgentSuccess { name: String },
    /// Agent failed before becoming ready
    AgentError { name: String, error: String },
    /// Worker finished `create` and is ready (identified by sender pid)
    WorkerSuccess,
    /// Worker failed before becoming ready
    WorkerError { error: String },
    /// Master allows an agent to run its teardown
    AgentClose,
    /// Master allows a worker to run its teardown
    WorkerClose,
    /// Master asks every agent for its extra data
    AgentExtraRequest,
    /// Agent answers with its extra data
    AgentExtra { name: String, data: Value },
    /// Every group started
    ClusterReady,
    /// Ask the master to shut the cluster down
    Teardown,
    /// Anything else
    Custom { action: String, body: Value },
}

#[derive(Serialize, Deserialize)]
struct NameBody {
    name: String,
}

#[derive(Serialize, Deserialize)]
struct NameErrorBody {
    name: String,
    error: String,
}

#[derive(Serialize, Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Serialize, Deserialize)]
struct ExtraBody {
    name: String,
    #[serde(default)]
    data: Value,
}

fn body<T: for<'de> Deserialize<'de>>(action: &str, body: Value) -> Result<T> {
    serde_json::from_value(body)
        .map_err(|e| ClusterError::Protocol(format!("malformed `{}` body: {}", action, e)))
}

impl Message {
    /// Build a custom message
    pub fn custom(action: impl Into<String>, body: Value) -> Self {
        Message::Custom {
            action: action.into(),
            body,
        }
    }

    /// Wire action name
    pub fn action(&self) -> &str {
        match self {
            Message::Hello => actions::HELLO,
            Message::AgentSuccess { .. } => actions::AGENT_SUCCESS,
            Message::AgentError { .. } => actions::AGENT_ERROR,
            Message::WorkerSuccess => actions::WORKER_SUCCESS,
            Message::WorkerError { .. } => actions::WORKER_ERROR,
            Message::AgentClose => actions::AGENT_CLOSE,
            Message::WorkerClose => actions::WORKER_CLOSE,
            Message::AgentExtraRequest | Message::AgentExtra { .. } => actions::AGENT_EXTRA,
            Message::ClusterReady => actions::CLUSTER_READY,
            Message::Teardown => actions::TEARDOWN,
            Message::Custom { action, .. } => action,
        }
    }

    /// Split into wire action and body
    pub fn into_parts(self) -> Result<(String, Value)> {
        let action = self.action().to_string();
        let body = match self {
            Message::AgentSuccess { name } => serde_json::to_value(NameBody { name })?,
            Message::AgentError { name, error } => {
                serde_json::to_value(NameErrorBody { name, error })?
            }
            Message::WorkerError { error } => serde_json::to_value(ErrorBody { error })?,
            Message::AgentExtra { name, data } => serde_json::to_value(ExtraBody { name, data })?,
            Message::Custom { body, .. } => body,
            Message::Hello
            | Message::WorkerSuccess
            | Message::AgentClose
            | Message::WorkerClose
            | Message::AgentExtraRequest
            | Message::ClusterReady
            | Message::Teardown => Value::Null,
        };
        Ok((action, body))
    }

    /// Decode from wire action and body.
    ///
    /// `agent:extra:data` without a body is the master's request; with a body
    /// it is an agent's answer.
    pub fn from_parts(action: &str, payload: Value) -> Result<Self> {
        let message = match action {
            actions::HELLO => Message::Hello,
            actions::AGENT_SUCCESS => {
                let b: NameBody = body(action, payload)?;
                Message::AgentSuccess { name: b.name }
            }
            actions::AGENT_ERROR => {
                let b: NameErrorBody = body(action, payload)?;
                Message::AgentError {
                    name: b.name,
                    error: b.error,
                }
            }
            actions::WORKER_SUCCESS => Message::WorkerSuccess,
            actions::WORKER_ERROR => {
                let b: ErrorBody = body(action, payload)?;
                Message::WorkerError { error: b.error }
            }
            actions::AGENT_CLOSE => Message::AgentClose,
            actions::WORKER_CLOSE => Message::WorkerClose,
            actions::AGENT_EXTRA if payload.is_null() => Message::AgentExtraRequest,
            actions::AGENT_EXTRA => {
                let b: ExtraBody = body(action, payload)?;
                Message::AgentExtra {
                    name: b.name,
                    data: b.data,
                }
            }
            actions::CLUSTER_READY => Message::ClusterReady,
            actions::TEARDOWN => Message::Teardown,
            other => Message::Custom {
                action: other.to_string(),
                body: payload,
            },
        };
        Ok(message)
    }
}

/// One message on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Sender
    pub from: Endpoint,

    /// Destination
    pub to: Target,

    /// Action name
    pub action: String,

    /// Action-specific payload
    #[serde(default)]
    pub body: Value,

    /// Optional message ID for tracing
    #[serde(default)]
    pub message_id: Option<Uuid>,

    /// Send time
    #[serde(default = "Utc::now")]
    pub sent_at: DateTime<Utc>,
}

impl Envelope {
    /// Wrap a message
    pub fn new(from: Endpoint, to: Target, message: Message) -> Result<Self> {
        let (action, body) = message.into_parts()?;
        Ok(Self {
            from,
            to,
            action,
            body,
            message_id: Some(Uuid::new_v4()),
            sent_at: Utc::now(),
        })
    }

    /// Decode the carried message
    pub fn message(&self) -> Result<Message> {
        Message::from_parts(&self.action, self.body.clone())
    }

    /// Encode as one line of JSON (without the trailing newline)
    pub fn to_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode one line of JSON
    pub fn from_line(line: &str) -> Result<Self> {
        serde_json::from_str(line.trim())
            .map_err(|e| ClusterError::Protocol(format!("invalid envelope: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_agent_error_wire_format() {
        let envelope = Envelope::new(
            Endpoint::agent("a"),
            Target::Master,
            Message::AgentError {
                name: "a".into(),
                error: "boom".into(),
            },
        )
        .unwrap();

        let line = envelope.to_line().unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["action"], "ipc:agent#error");
        assert_eq!(value["body"], json!({"name": "a", "error": "boom"}));
        assert_eq!(value["from"], json!({"kind": "agent", "name": "a"}));
        assert_eq!(value["to"], json!({"kind": "master"}));

        let decoded = Envelope::from_line(&line).unwrap();
        assert_eq!(
            decoded.message().unwrap(),
            Message::AgentError {
                name: "a".into(),
                error: "boom".into()
            }
        );
    }

    #[test]
    fn test_minimal_line_from_foreign_sender() {
        let line = r#"{"from":{"kind":"worker","pid":42},"to":{"kind":"master"},"action":"ipc:worker#success"}"#;
        let envelope = Envelope::from_line(line).unwrap();
        assert_eq!(envelope.from, Endpoint::worker(42));
        assert_eq!(envelope.message().unwrap(), Message::WorkerSuccess);
    }

    #[test]
    fn test_agent_extra_request_and_answer_share_an_action() {
        let request = Message::from_parts(actions::AGENT_EXTRA, Value::Null).unwrap();
        assert_eq!(request, Message::AgentExtraRequest);

        let answer =
            Message::from_parts(actions::AGENT_EXTRA, json!({"name": "a", "data": {"k": 1}}))
                .unwrap();
        assert_eq!(
            answer,
            Message::AgentExtra {
                name: "a".into(),
                data: json!({"k": 1})
            }
        );
    }

    #[test]
    fn test_unknown_action_is_custom() {
        let message = Message::from_parts("metrics:flush", json!({"n": 3})).unwrap();
        assert_eq!(message, Message::custom("metrics:flush", json!({"n": 3})));
        assert_eq!(message.action(), "metrics:flush");
    }

    #[test]
    fn test_malformed_known_body_is_a_protocol_error() {
        let err = Message::from_parts(actions::AGENT_SUCCESS, json!({"nom": "a"})).unwrap_err();
        assert!(matches!(err, ClusterError::Protocol(_)));
    }

    #[test]
    fn test_target_matching() {
        assert!(Target::Agents.matches(&Endpoint::agent("x")));
        assert!(!Target::Agents.matches(&Endpoint::worker(1)));
        assert!(Target::Workers.matches(&Endpoint::worker(1)));
        assert!(Target::from(Endpoint::worker(7)).matches(&Endpoint::worker(7)));
        assert!(!Target::from(Endpoint::worker(7)).matches(&Endpoint::worker(8)));
        assert_eq!(Target::Workers.endpoint(), None);
    }
}
