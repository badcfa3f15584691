//! Bookkeeping for a command while it is RUNNING

use std::time::{Duration, Instant};

use switchyard_shared::CommandStatus;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::timer::TimerHandle;

/// A stop request that is waiting on the agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingSignal {
    None,
    Cancel(String),
    Interrupt(String),
}

impl PendingSignal {
    pub fn reason(&self) -> Option<&str> {
        match self {
            PendingSignal::None => None,
            PendingSignal::Cancel(r) | PendingSignal::Interrupt(r) => Some(r),
        }
    }
}

/// One running command
///
/// Owns every timer guarding the execution, so removing the record from
/// the orchestrator disarms them all.
pub struct ActiveExecution {
    pub command_id: String,
    pub agent_id: Option<String>,
    /// Connection the request went out on
    pub connection_id: Option<String>,
    pub started_at: Instant,
    pub acknowledged: bool,
    pub pending: PendingSignal,
    cancel: CancellationToken,
    timeout: Option<TimerHandle>,
    grace: Option<TimerHandle>,
    done: watch::Sender<CommandStatus>,
}

impl ActiveExecution {
    pub fn new(command_id: &str, agent_id: Option<&str>, connection_id: Option<String>) -> Self {
        let (done, _) = watch::channel(CommandStatus::Running);
        Self {
            command_id: command_id.to_string(),
            agent_id: agent_id.map(Into::into),
            connection_id,
            started_at: Instant::now(),
            acknowledged: false,
            pending: PendingSignal::None,
            cancel: CancellationToken::new(),
            timeout: None,
            grace: None,
            done,
        }
    }

    pub fn arm_timeout(&mut self, timer: TimerHandle) {
        self.timeout = Some(timer);
    }

    pub fn arm_grace(&mut self, timer: TimerHandle) {
        self.grace = Some(timer);
    }

    pub fn has_grace(&self) -> bool {
        self.grace.is_some()
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Cancelled once a cancel is requested or the execution ends
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn signal_cancel(&mut self, reason: &str) {
        self.pending = PendingSignal::Cancel(reason.to_string());
        self.cancel.cancel();
    }

    pub fn is_cancelling(&self) -> bool {
        matches!(self.pending, PendingSignal::Cancel(_))
    }

    /// Receiver that sees the terminal status once the execution ends
    pub fn watch(&self) -> watch::Receiver<CommandStatus> {
        self.done.subscribe()
    }

    /// Terminal status for a completion report, given any pending signal
    ///
    /// A successful run always counts as COMPLETED; a failed run under a
    /// pending cancel or interrupt takes that signal's status.
    pub fn resolve(&self, success: bool) -> CommandStatus {
        match (&self.pending, success) {
            (_, true) => CommandStatus::Completed,
            (PendingSignal::Cancel(_), false) => CommandStatus::Cancelled,
            (PendingSignal::Interrupt(_), false) => CommandStatus::Interrupted,
            (PendingSignal::None, false) => CommandStatus::Failed,
        }
    }

    /// Disarm timers and wake everyone waiting on the outcome
    pub fn finish(self, status: CommandStatus) {
        self.cancel.cancel();
        self.done.send_replace(status);
    }
}
