//! Command State Machine
//!
//! Defines the command lifecycle and which events may move a command
//! between states. Terminal states never transition again.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Interrupted,
}

impl CommandStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CommandStatus::Completed
                | CommandStatus::Failed
                | CommandStatus::Cancelled
                | CommandStatus::Interrupted
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CommandStatus::Queued => "QUEUED",
            CommandStatus::Running => "RUNNING",
            CommandStatus::Completed => "COMPLETED",
            CommandStatus::Failed => "FAILED",
            CommandStatus::Cancelled => "CANCELLED",
            CommandStatus::Interrupted => "INTERRUPTED",
        }
    }
}

impl std::fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Availability of an agent as seen by the hub
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Online,
    Offline,
    Executing,
    Error,
    Maintenance,
}

impl AgentStatus {
    /// Whether the hub may hand new work to an agent in this state
    pub fn accepts_work(self) -> bool {
        matches!(self, AgentStatus::Online | AgentStatus::Executing)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AgentStatus::Online => "online",
            AgentStatus::Offline => "offline",
            AgentStatus::Executing => "executing",
            AgentStatus::Error => "error",
            AgentStatus::Maintenance => "maintenance",
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events that drive command transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandEvent {
    /// Dispatched to an agent and execution started
    Started,
    /// Agent reported success
    Succeeded,
    /// Agent reported failure, or a dispatch/timeout failure
    Failed,
    /// Cancelled while queued, or cancel grace elapsed / acknowledged
    Cancelled,
    /// Interrupt forced or acknowledged
    Interrupted,
}

/// Result of a transition attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionResult {
    /// Transition was valid and state changed
    Success(CommandStatus),
    /// Command already reached a terminal state; nothing changes
    AlreadyTerminal(CommandStatus),
    /// Transition is not allowed from the current state
    Invalid {
        from: CommandStatus,
        event: CommandEvent,
    },
}

/// Compute the outcome of applying `event` to a command in state `from`
pub fn apply(from: CommandStatus, event: CommandEvent) -> TransitionResult {
    if from.is_terminal() {
        return TransitionResult::AlreadyTerminal(from);
    }

    match next_state(from, event) {
        Some(to) => TransitionResult::Success(to),
        None => TransitionResult::Invalid { from, event },
    }
}

fn next_state(from: CommandStatus, event: CommandEvent) -> Option<CommandStatus> {
    use CommandEvent as E;
    use CommandStatus::*;

    match (from, event) {
        (Queued, E::Started) => Some(Running),
        (Queued, E::Cancelled) => Some(Cancelled),
        // Dispatch retries exhausted
        (Queued, E::Failed) => Some(Failed),

        (Running, E::Succeeded) => Some(Completed),
        (Running, E::Failed) => Some(Failed),
        (Running, E::Cancelled) => Some(Cancelled),
        (Running, E::Interrupted) => Some(Interrupted),

        _ => None,
    }
}

/// Check if a transition from one state to another is generally valid
pub fn is_valid_transition(from: CommandStatus, to: CommandStatus) -> bool {
    use CommandStatus::*;

    match (from, to) {
        (Queued, Running | Cancelled | Failed) => true,
        (Running, Completed | Failed | Cancelled | Interrupted) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normal_lifecycle() {
        let result = apply(CommandStatus::Queued, CommandEvent::Started);
        assert_eq!(result, TransitionResult::Success(CommandStatus::Running));

        let result = apply(CommandStatus::Running, CommandEvent::Succeeded);
        assert_eq!(result, TransitionResult::Success(CommandStatus::Completed));
    }

    #[test]
    fn test_start_running_is_invalid() {
        let result = apply(CommandStatus::Running, CommandEvent::Started);
        assert!(matches!(result, TransitionResult::Invalid { .. }));
    }

    #[test]
    fn test_queued_cannot_complete_or_interrupt() {
        assert!(matches!(
            apply(CommandStatus::Queued, CommandEvent::Succeeded),
            TransitionResult::Invalid { .. }
        ));
        assert!(matches!(
            apply(CommandStatus::Queued, CommandEvent::Interrupted),
            TransitionResult::Invalid { .. }
        ));
    }

    #[test]
    fn test_terminal_states_are_sticky() {
        for status in [
            CommandStatus::Completed,
            CommandStatus::Failed,
            CommandStatus::Cancelled,
            CommandStatus::Interrupted,
        ] {
            for event in [
                CommandEvent::Started,
                CommandEvent::Succeeded,
                CommandEvent::Failed,
                CommandEvent::Cancelled,
                CommandEvent::Interrupted,
            ] {
                assert_eq!(apply(status, event), TransitionResult::AlreadyTerminal(status));
            }
            assert!(!is_valid_transition(status, CommandStatus::Running));
        }
    }

    #[test]
    fn test_agent_availability() {
        assert!(AgentStatus::Online.accepts_work());
        assert!(AgentStatus::Executing.accepts_work());
        assert!(!AgentStatus::Maintenance.accepts_work());
        assert!(!AgentStatus::Error.accepts_work());
        assert!(!AgentStatus::Offline.accepts_work());
    }

    #[test]
    fn test_status_serializes_uppercase() {
        let json = serde_json::to_string(&CommandStatus::Interrupted).unwrap();
        assert_eq!(json, "\"INTERRUPTED\"");
    }
}
