//! Command records as the hub and storage see them

use serde::{Deserialize, Serialize};
use serde_json::Value;
use switchyard_shared::{CommandComplete, CommandStatus, CommandStatusUpdate};

use crate::queue::QueueScope;

/// Submission data handed to [`Storage::create_command`](crate::storage::Storage::create_command)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCommand {
    /// `None` puts the command in the global pool
    pub target_agent_id: Option<String>,
    pub priority: u8,
    pub time_limit_ms: Option<u64>,
    pub payload: Value,
    pub created_by: Option<String>,
}

impl NewCommand {
    pub fn new(target_agent_id: Option<&str>, priority: u8, payload: Value) -> Self {
        Self {
            target_agent_id: target_agent_id.map(Into::into),
            priority,
            time_limit_ms: None,
            payload,
            created_by: None,
        }
    }

    pub fn with_time_limit(mut self, ms: u64) -> Self {
        self.time_limit_ms = Some(ms);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub id: String,
    pub target_agent_id: Option<String>,
    /// Agent that actually received the command; differs from the target
    /// only for global-pool commands
    pub assigned_agent_id: Option<String>,
    pub priority: u8,
    pub status: CommandStatus,
    pub payload: Value,
    pub time_limit_ms: Option<u64>,
    pub created_by: Option<String>,
    pub created_at: u64,
    pub started_at: Option<u64>,
    pub completed_at: Option<u64>,
    /// Why the command reached its terminal status
    pub reason: Option<String>,
    #[serde(skip)]
    pub dispatch_attempts: u32,
}

impl Command {
    pub fn scope(&self) -> QueueScope {
        QueueScope::from_target(self.target_agent_id.as_deref())
    }

    pub fn agent_id(&self) -> Option<&str> {
        self.assigned_agent_id
            .as_deref()
            .or(self.target_agent_id.as_deref())
    }

    pub fn status_update(&self) -> CommandStatusUpdate {
        CommandStatusUpdate {
            command_id: self.id.clone(),
            status: self.status,
            agent_id: self.agent_id().map(Into::into),
            reason: self.reason.clone(),
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }
}

/// What an agent reported when a command finished
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CommandOutcome {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub result: Option<Value>,
}

impl CommandOutcome {
    pub fn success() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

impl From<CommandComplete> for CommandOutcome {
    fn from(msg: CommandComplete) -> Self {
        Self {
            success: msg.success,
            exit_code: msg.exit_code,
            error: msg.error,
            result: msg.result,
        }
    }
}

/// Fields written alongside a status change
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusMeta {
    pub agent_id: Option<String>,
    pub reason: Option<String>,
    pub started_at: Option<u64>,
    pub completed_at: Option<u64>,
    pub exit_code: Option<i32>,
    pub result: Option<Value>,
}

impl StatusMeta {
    pub fn for_command(cmd: &Command, outcome: Option<&CommandOutcome>) -> Self {
        Self {
            agent_id: cmd.agent_id().map(Into::into),
            reason: cmd.reason.clone(),
            started_at: cmd.started_at,
            completed_at: cmd.completed_at,
            exit_code: outcome.and_then(|o| o.exit_code),
            result: outcome.and_then(|o| o.result.clone()),
        }
    }
}

/// One line of the audit trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub action: String,
    pub command_id: Option<String>,
    pub agent_id: Option<String>,
    pub actor: Option<String>,
    pub detail: Value,
    pub timestamp: u64,
}

impl AuditEvent {
    pub fn command(action: impl Into<String>, cmd: &Command, detail: Value) -> Self {
        Self {
            action: action.into(),
            command_id: Some(cmd.id.clone()),
            agent_id: cmd.agent_id().map(Into::into),
            actor: cmd.created_by.clone(),
            detail,
            timestamp: switchyard_shared::now_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn command(target: Option<&str>) -> Command {
        Command {
            id: "cmd-1".into(),
            target_agent_id: target.map(Into::into),
            assigned_agent_id: None,
            priority: 50,
            status: CommandStatus::Queued,
            payload: json!({"run": "ls"}),
            time_limit_ms: None,
            created_by: Some("alice".into()),
            created_at: 1,
            started_at: None,
            completed_at: None,
            reason: None,
            dispatch_attempts: 0,
        }
    }

    #[test]
    fn scope_follows_target() {
        assert_eq!(command(None).scope(), QueueScope::Global);
        assert_eq!(command(Some("a1")).scope(), QueueScope::agent("a1"));
    }

    #[test]
    fn assigned_agent_wins_over_target() {
        let mut cmd = command(None);
        assert_eq!(cmd.agent_id(), None);
        cmd.assigned_agent_id = Some("a2".into());
        assert_eq!(cmd.agent_id(), Some("a2"));
        assert_eq!(cmd.status_update().agent_id.as_deref(), Some("a2"));
    }

    #[test]
    fn outcome_from_wire_message() {
        let outcome = CommandOutcome::from(CommandComplete::failed("cmd-1", "boom"));
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("boom"));
    }
}
