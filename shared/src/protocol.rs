//! Wire envelope and payload types
//!
//! Every frame carries one [`Envelope`]:
//! ```text
//! { "type": "COMMAND_REQUEST", "id": "<uuid>", "timestamp": 1700000000000, "payload": { ... } }
//! ```
//!
//! Payloads are kept as raw JSON in the envelope and decoded on demand with
//! [`Envelope::decode_payload`], so unknown fields from newer peers never
//! break routing.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::state_machine::{AgentStatus, CommandStatus};
use crate::now_ms;

/// Message types understood by the hub
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    // Agent -> hub
    Connect,
    Heartbeat,
    CommandAck,
    CommandComplete,
    TerminalOutput,
    TraceEvent,
    Error,

    // Hub -> agent
    CommandRequest,
    CommandCancel,
    AgentControl,
    TokenRefresh,

    // Hub -> dashboard
    AgentStatus,
    CommandStatus,
    TerminalStream,
    QueueUpdate,

    // Hub -> any peer after handshake
    ConnectAck,

    // Dashboard -> hub
    CommandSubmit,
    CommandInterrupt,
    PriorityUpdate,

    #[serde(other)]
    Unknown,
}

/// Errors raised while building or reading envelope payloads
#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("Invalid {msg_type:?} payload: {source}")]
    Invalid {
        msg_type: MessageType,
        #[source]
        source: serde_json::Error,
    },

    #[error("Payload serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// The structured message carried by every frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    pub id: String,
    pub timestamp: u64,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    /// Build an envelope with a fresh id and the current timestamp
    pub fn new<P: Serialize>(msg_type: MessageType, payload: &P) -> Result<Self, PayloadError> {
        Ok(Self {
            msg_type,
            id: uuid::Uuid::now_v7().to_string(),
            timestamp: now_ms(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Build an envelope from an already-encoded payload
    pub fn from_value(msg_type: MessageType, payload: Value) -> Self {
        Self {
            msg_type,
            id: uuid::Uuid::now_v7().to_string(),
            timestamp: now_ms(),
            payload,
        }
    }

    /// Decode the payload into its typed form
    pub fn decode_payload<P: DeserializeOwned>(&self) -> Result<P, PayloadError> {
        serde_json::from_value(self.payload.clone()).map_err(|source| PayloadError::Invalid {
            msg_type: self.msg_type,
            source,
        })
    }
}

/// Role a peer declares in its `CONNECT` handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    Agent,
    Dashboard,
}

impl std::fmt::Display for PeerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerRole::Agent => write!(f, "agent"),
            PeerRole::Dashboard => write!(f, "dashboard"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connect {
    pub role: PeerRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl Connect {
    pub fn agent(agent_id: impl Into<String>) -> Self {
        Self {
            role: PeerRole::Agent,
            agent_id: Some(agent_id.into()),
            user_id: None,
        }
    }

    pub fn dashboard(user_id: Option<String>) -> Self {
        Self {
            role: PeerRole::Dashboard,
            agent_id: None,
            user_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectAck {
    pub connection_id: String,
    pub heartbeat_timeout_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    /// Self-reported availability (maintenance, error, online)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<AgentStatus>,
    #[serde(default)]
    pub running: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandAck {
    pub command_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandComplete {
    pub command_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl CommandComplete {
    pub fn succeeded(command_id: impl Into<String>, exit_code: Option<i32>) -> Self {
        Self {
            command_id: command_id.into(),
            success: true,
            exit_code,
            ..Default::default()
        }
    }

    pub fn failed(command_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            command_id: command_id.into(),
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalOutput {
    pub command_id: String,
    pub stream: OutputStream,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceEvent {
    pub command_id: String,
    pub event: Value,
}

/// `ERROR` payload, sent by agents and forwarded to dashboards
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    pub recoverable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    pub command_id: String,
    pub priority: u8,
    pub time_limit_ms: u64,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandCancel {
    pub command_id: String,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Interrupt,
    Restart,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentControl {
    pub action: ControlAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRefresh {
    pub token: String,
    pub expires_at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatusUpdate {
    pub agent_id: String,
    pub status: AgentStatus,
    pub last_heartbeat: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandStatusUpdate {
    pub command_id: String,
    pub status: CommandStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Output,
    Trace,
}

/// One buffered item inside a `TERMINAL_STREAM` batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamItem {
    pub kind: StreamKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<OutputStream>,
    pub data: Value,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalStream {
    pub command_id: String,
    pub sequence: u64,
    pub items: Vec<StreamItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntryView {
    pub command_id: String,
    pub priority: u8,
    pub position: usize,
    pub enqueued_at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueUpdate {
    /// Agent id, or `None` for the global pool
    pub scope: Option<String>,
    pub entries: Vec<QueueEntryView>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandSubmit {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_agent_id: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_limit_ms: Option<u64>,
    #[serde(default)]
    pub payload: Value,
}

fn default_priority() -> u8 {
    crate::defaults::PRIORITY_DEFAULT
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandInterrupt {
    pub command_id: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub force: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriorityUpdate {
    pub command_id: String,
    pub priority: u8,
}
