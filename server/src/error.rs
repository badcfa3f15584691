//! Hub error taxonomy

use switchyard_shared::{codec::CodecError, CommandStatus, MessageType, PayloadError, PeerRole};
use thiserror::Error;

pub type Result<T, E = HubError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum HubError {
    /// Broadcast or send target is not registered
    #[error("Connection not found: {0}")]
    ConnectionNotFound(String),

    /// Dispatch attempted to an agent with no live connection
    #[error("Agent offline: {0}")]
    AgentOffline(String),

    #[error("Queue entry not found: {0}")]
    QueueEntryNotFound(String),

    #[error("Command {0} is already queued")]
    DuplicateQueueEntry(String),

    #[error("Command not found: {0}")]
    CommandNotFound(String),

    #[error("Invalid priority {0} (expected 0..=100)")]
    InvalidPriority(u16),

    #[error("Invalid transition for command {command_id}: {from} cannot {action}")]
    InvalidTransition {
        command_id: String,
        from: CommandStatus,
        action: &'static str,
    },

    #[error("Command {command_id} timed out after {elapsed_ms}ms")]
    Timeout { command_id: String, elapsed_ms: u64 },

    #[error("Dispatch of command {command_id} failed after {attempts} attempts")]
    DispatchFailure { command_id: String, attempts: u32 },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Payload error: {0}")]
    Payload(#[from] PayloadError),

    #[error("Handshake rejected: {0}")]
    Handshake(String),

    #[error("{role} peers may not send {msg_type:?}")]
    UnsupportedMessage {
        role: PeerRole,
        msg_type: MessageType,
    },
}

impl HubError {
    /// Whether a peer could reasonably retry the operation
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            HubError::AgentOffline(_)
                | HubError::ConnectionNotFound(_)
                | HubError::DispatchFailure { .. }
                | HubError::Storage(_)
        )
    }

    /// Stable machine-readable code for `ERROR` payloads
    pub fn code(&self) -> &'static str {
        match self {
            HubError::ConnectionNotFound(_) => "CONNECTION_NOT_FOUND",
            HubError::AgentOffline(_) => "AGENT_OFFLINE",
            HubError::QueueEntryNotFound(_) => "QUEUE_ENTRY_NOT_FOUND",
            HubError::DuplicateQueueEntry(_) => "DUPLICATE_QUEUE_ENTRY",
            HubError::CommandNotFound(_) => "COMMAND_NOT_FOUND",
            HubError::InvalidPriority(_) => "INVALID_PRIORITY",
            HubError::InvalidTransition { .. } => "INVALID_TRANSITION",
            HubError::Timeout { .. } => "TIMEOUT",
            HubError::DispatchFailure { .. } => "DISPATCH_FAILURE",
            HubError::Storage(_) => "STORAGE_ERROR",
            HubError::Codec(_) => "CODEC_ERROR",
            HubError::Payload(_) => "INVALID_PAYLOAD",
            HubError::Handshake(_) => "HANDSHAKE_REJECTED",
            HubError::UnsupportedMessage { .. } => "UNSUPPORTED_MESSAGE",
        }
    }
}

/// Errors reported by the storage collaborator
#[derive(Error, Debug, Clone)]
pub enum StorageError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_and_recoverability() {
        let err = HubError::AgentOffline("a1".into());
        assert_eq!(err.code(), "AGENT_OFFLINE");
        assert!(err.is_recoverable());

        let err = HubError::InvalidTransition {
            command_id: "c1".into(),
            from: CommandStatus::Running,
            action: "start",
        };
        assert!(!err.is_recoverable());
        assert_eq!(
            err.to_string(),
            "Invalid transition for command c1: RUNNING cannot start"
        );
    }

    #[test]
    fn test_storage_error_converts() {
        let err: HubError = StorageError::Unavailable("db down".into()).into();
        assert_eq!(err.code(), "STORAGE_ERROR");
    }
}
