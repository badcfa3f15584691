//! Command lifecycle: creation, dispatch, completion, cancel and interrupt
//!
//! All command state lives behind one lock so a terminal transition is
//! decided exactly once, whichever of completion, cancel, interrupt,
//! timeout or disconnect gets there first. The lock is never held across
//! an await; outbound messages are queued with non-blocking sends.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use switchyard_shared::state_machine::{self, TransitionResult};
use switchyard_shared::{
    now_ms, AgentControl, AgentStatus, CommandCancel, CommandRequest, CommandStatus, ControlAction,
    Envelope, ErrorPayload, MessageType, PeerRole, QueueUpdate, StreamItem,
};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::execution::{ActiveExecution, PendingSignal};
use super::model::{AuditEvent, Command, CommandOutcome, NewCommand, StatusMeta};
use crate::broadcast::{MessageBroadcaster, OutputBatcher};
use crate::config::HubConfig;
use crate::error::{HubError, Result};
use crate::heartbeat::HeartbeatMonitor;
use crate::queue::{validate_priority, PriorityCommandQueue, QueueEntry, QueueScope};
use crate::session::{ConnectionEvent, ConnectionRegistry};
use crate::storage::{PersistOp, PersistenceWriter, Storage};
use crate::timer::{self, TimerHandle};

/// Lifecycle notifications for in-process observers
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestratorEvent {
    Queued {
        command_id: String,
        scope: QueueScope,
        position: usize,
    },
    Started {
        command_id: String,
        agent_id: Option<String>,
    },
    Finished {
        command_id: String,
        status: CommandStatus,
        reason: Option<String>,
    },
    PriorityChanged {
        command_id: String,
        priority: u8,
        position: usize,
    },
}

#[derive(Debug, Clone, Copy)]
enum Deadline {
    Timeout,
    CancelGrace,
    InterruptGrace,
}

#[derive(Default)]
struct State {
    commands: HashMap<String, Command>,
    executions: HashMap<String, ActiveExecution>,
    /// Agents whose last dispatch send failed, with the pending retry
    backoff: HashMap<String, TimerHandle>,
}

impl State {
    fn running_on(&self, agent_id: &str) -> usize {
        self.executions
            .values()
            .filter(|e| e.agent_id.as_deref() == Some(agent_id))
            .count()
    }
}

pub struct CommandOrchestrator {
    config: HubConfig,
    registry: Arc<ConnectionRegistry>,
    broadcaster: Arc<MessageBroadcaster>,
    batcher: Arc<OutputBatcher>,
    queue: Arc<PriorityCommandQueue>,
    monitor: Arc<HeartbeatMonitor>,
    storage: Arc<dyn Storage>,
    persist: PersistenceWriter,
    state: Mutex<State>,
    events: broadcast::Sender<OrchestratorEvent>,
    this: Weak<CommandOrchestrator>,
}

impl CommandOrchestrator {
    pub fn new(
        config: HubConfig,
        broadcaster: Arc<MessageBroadcaster>,
        batcher: Arc<OutputBatcher>,
        queue: Arc<PriorityCommandQueue>,
        monitor: Arc<HeartbeatMonitor>,
        storage: Arc<dyn Storage>,
        persist: PersistenceWriter,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        let registry = broadcaster.registry().clone();
        Arc::new_cyclic(|this| Self {
            config,
            registry,
            broadcaster,
            batcher,
            queue,
            monitor,
            storage,
            persist,
            state: Mutex::new(State::default()),
            events,
            this: this.clone(),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.events.subscribe()
    }

    pub fn queue(&self) -> &Arc<PriorityCommandQueue> {
        &self.queue
    }

    /// Persist, enqueue and try to dispatch a new command
    pub async fn create_command(&self, data: NewCommand) -> Result<Command> {
        validate_priority(u16::from(data.priority))?;
        let command = self.storage.create_command(data).await?;
        let scope = command.scope();

        {
            let mut state = self.state.lock();
            let entry = self.queue.enqueue(
                &command.id,
                scope.clone(),
                command.priority,
                Some(command.created_at),
            )?;
            state.commands.insert(command.id.clone(), command.clone());

            self.persist.submit(PersistOp::QueueEntry(entry.clone()));
            self.audit(AuditEvent::command(
                "command.queued",
                &command,
                json!({ "priority": command.priority, "scope": scope.to_string() }),
            ));
            self.emit(OrchestratorEvent::Queued {
                command_id: command.id.clone(),
                scope: scope.clone(),
                position: entry.position,
            });
            self.publish_status(&command);
            self.publish_queue(&scope);
        }
        info!(
            command_id = %command.id,
            scope = %scope,
            priority = command.priority,
            "command queued"
        );

        self.dispatch_scope(&scope);
        Ok(self.get_command(&command.id).unwrap_or(command))
    }

    fn dispatch_scope(&self, scope: &QueueScope) {
        match scope.agent_id() {
            Some(agent_id) => {
                self.try_dispatch(agent_id);
            }
            None => {
                for agent_id in self.registry.online_agent_ids() {
                    if self.queue.len(&QueueScope::Global) == 0 {
                        break;
                    }
                    self.try_dispatch(&agent_id);
                }
            }
        }
    }

    /// Hand queued work to an agent until it is at capacity
    ///
    /// The agent's own scope drains before the global pool. Returns the
    /// number of commands started.
    pub fn try_dispatch(&self, agent_id: &str) -> usize {
        let mut started = 0;
        let mut state = self.state.lock();

        loop {
            if state.backoff.contains_key(agent_id) {
                break;
            }
            if !self.registry.is_agent_online(agent_id) {
                debug!(agent_id, "dispatch skipped, agent offline");
                break;
            }
            if !self.monitor.accepts_work(agent_id) {
                debug!(agent_id, "dispatch skipped, agent not accepting work");
                break;
            }
            if state.running_on(agent_id) >= self.config.max_concurrent_per_agent {
                break;
            }
            let Some(entry) = self
                .queue
                .peek(&QueueScope::agent(agent_id))
                .or_else(|| self.queue.peek(&QueueScope::Global))
            else {
                break;
            };

            let request = match state.commands.get(&entry.command_id) {
                Some(cmd) => CommandRequest {
                    command_id: cmd.id.clone(),
                    priority: cmd.priority,
                    time_limit_ms: cmd
                        .time_limit_ms
                        .unwrap_or(self.config.default_time_limit_ms),
                    payload: cmd.payload.clone(),
                },
                None => {
                    warn!(command_id = %entry.command_id, "queue entry without command, dropping");
                    let _ = self.queue.remove(entry.entry_id);
                    self.publish_queue(&entry.scope);
                    continue;
                }
            };

            let envelope = match Envelope::new(MessageType::CommandRequest, &request) {
                Ok(env) => env,
                Err(e) => {
                    error!(command_id = %entry.command_id, error = %e, "failed to encode command request");
                    self.finalize_locked(
                        &mut state,
                        &entry.command_id,
                        CommandStatus::Failed,
                        Some(format!("invalid payload: {e}")),
                        None,
                    );
                    continue;
                }
            };

            if self.registry.send_to_agent(agent_id, Arc::new(envelope)) {
                let connection_id = self.registry.get_agent_connection(agent_id).map(|c| c.id.clone());
                match self.start_locked(&mut state, &entry.command_id, Some(agent_id), connection_id) {
                    Ok(()) => started += 1,
                    Err(e) => {
                        error!(command_id = %entry.command_id, error = %e, "failed to start dispatched command");
                        self.finalize_locked(
                            &mut state,
                            &entry.command_id,
                            CommandStatus::Failed,
                            Some(e.to_string()),
                            None,
                        );
                    }
                }
                continue;
            }

            if !self.dispatch_failed(&mut state, agent_id, &entry) {
                break;
            }
        }

        if started > 0 {
            debug!(agent_id, started, "dispatched commands");
        }
        started
    }

    /// Record a failed send; returns whether dispatch may continue
    fn dispatch_failed(&self, state: &mut State, agent_id: &str, entry: &QueueEntry) -> bool {
        let policy = &self.config.dispatch_retry;
        let attempts = match state.commands.get_mut(&entry.command_id) {
            Some(cmd) => {
                cmd.dispatch_attempts += 1;
                cmd.dispatch_attempts
            }
            None => return false,
        };

        if attempts >= policy.max_attempts {
            let err = HubError::DispatchFailure {
                command_id: entry.command_id.clone(),
                attempts,
            };
            error!(agent_id, error = %err, "giving up on dispatch");
            self.publish_error(ErrorPayload {
                code: err.code().into(),
                message: err.to_string(),
                recoverable: false,
                command_id: Some(entry.command_id.clone()),
                agent_id: Some(agent_id.to_string()),
            });
            self.finalize_locked(
                state,
                &entry.command_id,
                CommandStatus::Failed,
                Some(err.to_string()),
                None,
            );
            return true;
        }

        let delay = policy.backoff(attempts);
        warn!(
            agent_id,
            command_id = %entry.command_id,
            attempt = attempts,
            "dispatch send failed, retrying in {:?}",
            delay
        );
        let this = self.this.clone();
        let agent = agent_id.to_string();
        let retry = timer::arm(delay, move || async move {
            if let Some(orchestrator) = this.upgrade() {
                orchestrator.retry_dispatch(&agent);
            }
        });
        state.backoff.insert(agent_id.to_string(), retry);
        false
    }

    fn retry_dispatch(&self, agent_id: &str) {
        self.state.lock().backoff.remove(agent_id);
        self.try_dispatch(agent_id);
    }

    /// A new connection for this agent was registered
    pub fn on_agent_connected(&self, agent_id: &str) -> usize {
        self.state.lock().backoff.remove(agent_id);
        self.try_dispatch(agent_id)
    }

    /// QUEUED -> RUNNING without going through dispatch
    pub fn start(&self, command_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        let cmd = state
            .commands
            .get(command_id)
            .ok_or_else(|| HubError::CommandNotFound(command_id.to_string()))?;
        let agent_id = cmd.agent_id().map(String::from);
        let connection_id = agent_id
            .as_deref()
            .and_then(|a| self.registry.get_agent_connection(a))
            .map(|c| c.id.clone());
        self.start_locked(&mut state, command_id, agent_id.as_deref(), connection_id)
    }

    fn start_locked(
        &self,
        state: &mut State,
        command_id: &str,
        agent_id: Option<&str>,
        connection_id: Option<String>,
    ) -> Result<()> {
        let cmd = state
            .commands
            .get_mut(command_id)
            .ok_or_else(|| HubError::CommandNotFound(command_id.to_string()))?;
        match state_machine::apply(cmd.status, state_machine::CommandEvent::Started) {
            TransitionResult::Success(_) => {}
            TransitionResult::AlreadyTerminal(from) | TransitionResult::Invalid { from, .. } => {
                return Err(HubError::InvalidTransition {
                    command_id: command_id.to_string(),
                    from,
                    action: "start",
                });
            }
        }

        if let Some(entry) = self.queue.remove_command(command_id) {
            self.persist
                .submit(PersistOp::RemoveQueueEntry(command_id.to_string()));
            self.publish_queue(&entry.scope);
        }

        cmd.status = CommandStatus::Running;
        cmd.started_at = Some(now_ms());
        if let Some(agent_id) = agent_id {
            cmd.assigned_agent_id = Some(agent_id.to_string());
        }
        let limit = Duration::from_millis(
            cmd.time_limit_ms
                .unwrap_or(self.config.default_time_limit_ms),
        );

        let mut execution = ActiveExecution::new(command_id, agent_id, connection_id);
        execution.arm_timeout(self.arm_deadline(limit, command_id, Deadline::Timeout));

        self.persist.submit(PersistOp::Status {
            command_id: command_id.to_string(),
            status: CommandStatus::Running,
            meta: StatusMeta::for_command(cmd, None),
        });
        self.emit(OrchestratorEvent::Started {
            command_id: command_id.to_string(),
            agent_id: agent_id.map(Into::into),
        });
        self.publish_status(cmd);
        state.executions.insert(command_id.to_string(), execution);

        if let Some(agent_id) = agent_id {
            self.monitor.set_status(agent_id, AgentStatus::Executing);
        }
        info!(command_id, agent_id = ?agent_id, time_limit_ms = limit.as_millis() as u64, "command started");
        Ok(())
    }

    /// Apply an agent's completion report
    ///
    /// Completion of a command that is already terminal is ignored and its
    /// existing status returned.
    pub fn complete(&self, command_id: &str, outcome: CommandOutcome) -> Result<CommandStatus> {
        let (status, freed) = {
            let mut state = self.state.lock();
            let cmd = state
                .commands
                .get(command_id)
                .ok_or_else(|| HubError::CommandNotFound(command_id.to_string()))?;
            if cmd.status.is_terminal() {
                debug!(command_id, status = %cmd.status, "late completion ignored");
                return Ok(cmd.status);
            }
            if cmd.status == CommandStatus::Queued {
                return Err(HubError::InvalidTransition {
                    command_id: command_id.to_string(),
                    from: cmd.status,
                    action: "complete",
                });
            }

            let (status, reason) = match state.executions.get(command_id) {
                Some(exec) => {
                    let status = exec.resolve(outcome.success);
                    let reason = match status {
                        CommandStatus::Failed => outcome.error.clone(),
                        CommandStatus::Cancelled | CommandStatus::Interrupted => {
                            exec.pending.reason().map(Into::into)
                        }
                        _ => None,
                    };
                    (status, reason)
                }
                None if outcome.success => (CommandStatus::Completed, None),
                None => (CommandStatus::Failed, outcome.error.clone()),
            };
            let freed = self.finalize_locked(&mut state, command_id, status, reason, Some(&outcome));
            (status, freed)
        };

        if let Some(agent_id) = freed {
            self.try_dispatch(&agent_id);
        }
        Ok(status)
    }

    /// Cancel a command
    ///
    /// QUEUED commands are cancelled immediately. RUNNING commands are
    /// signalled and given the cancel grace period to report back before
    /// being forced to CANCELLED. Terminal commands return their status.
    pub async fn cancel(&self, command_id: &str, reason: &str) -> Result<CommandStatus> {
        let grace = self.config.cancel_grace();
        let done = {
            let mut state = self.state.lock();
            let cmd = state
                .commands
                .get(command_id)
                .ok_or_else(|| HubError::CommandNotFound(command_id.to_string()))?;
            if cmd.status.is_terminal() {
                return Ok(cmd.status);
            }
            self.audit(AuditEvent::command(
                "command.cancel_requested",
                cmd,
                json!({ "reason": reason }),
            ));

            if cmd.status == CommandStatus::Queued || !state.executions.contains_key(command_id) {
                self.finalize_locked(
                    &mut state,
                    command_id,
                    CommandStatus::Cancelled,
                    Some(reason.to_string()),
                    None,
                );
                return Ok(CommandStatus::Cancelled);
            }

            let deadline = self.arm_deadline(grace, command_id, Deadline::CancelGrace);
            let Some(exec) = state.executions.get_mut(command_id) else {
                return Ok(CommandStatus::Running);
            };
            if !exec.is_cancelling() {
                exec.signal_cancel(reason);
                exec.arm_grace(deadline);
                if let Some(agent_id) = &exec.agent_id {
                    self.send_to_agent(
                        agent_id,
                        MessageType::CommandCancel,
                        &CommandCancel {
                            command_id: command_id.to_string(),
                            reason: reason.to_string(),
                        },
                    );
                }
                info!(command_id, reason, "cancel requested");
            }
            exec.watch()
        };

        Ok(self
            .await_terminal(command_id, done, grace, CommandStatus::Cancelled)
            .await)
    }

    /// Interrupt a RUNNING command
    ///
    /// With `force` the command becomes INTERRUPTED at once. Otherwise it
    /// gets `timeout` (default: the configured interrupt timeout) to finish
    /// on its own before being forced.
    pub async fn interrupt(
        &self,
        command_id: &str,
        reason: &str,
        force: bool,
        timeout: Option<Duration>,
    ) -> Result<CommandStatus> {
        let limit = timeout.unwrap_or_else(|| self.config.interrupt_timeout());
        let done = {
            let mut state = self.state.lock();
            let cmd = state
                .commands
                .get(command_id)
                .ok_or_else(|| HubError::CommandNotFound(command_id.to_string()))?;
            if cmd.status.is_terminal() {
                return Ok(cmd.status);
            }
            if cmd.status == CommandStatus::Queued {
                return Err(HubError::InvalidTransition {
                    command_id: command_id.to_string(),
                    from: cmd.status,
                    action: "interrupt",
                });
            }
            self.audit(AuditEvent::command(
                "command.interrupt_requested",
                cmd,
                json!({ "reason": reason, "force": force }),
            ));

            let deadline = self.arm_deadline(limit, command_id, Deadline::InterruptGrace);
            let Some(exec) = state.executions.get_mut(command_id) else {
                return Ok(CommandStatus::Running);
            };
            if let Some(agent_id) = &exec.agent_id {
                self.send_to_agent(
                    agent_id,
                    MessageType::AgentControl,
                    &AgentControl {
                        action: ControlAction::Interrupt,
                        command_id: Some(command_id.to_string()),
                        reason: Some(reason.to_string()),
                    },
                );
            }
            if exec.pending.reason().is_none() {
                exec.pending = PendingSignal::Interrupt(reason.to_string());
            }
            info!(command_id, reason, force, "interrupt requested");

            if force {
                let freed = self.finalize_locked(
                    &mut state,
                    command_id,
                    CommandStatus::Interrupted,
                    Some(reason.to_string()),
                    None,
                );
                drop(state);
                if let Some(agent_id) = freed {
                    self.try_dispatch(&agent_id);
                }
                return Ok(CommandStatus::Interrupted);
            }

            if !exec.has_grace() {
                exec.arm_grace(deadline);
            }
            exec.watch()
        };

        Ok(self
            .await_terminal(command_id, done, limit, CommandStatus::Interrupted)
            .await)
    }

    async fn await_terminal(
        &self,
        command_id: &str,
        mut done: watch::Receiver<CommandStatus>,
        limit: Duration,
        forced: CommandStatus,
    ) -> CommandStatus {
        if let Ok(Ok(status)) = tokio::time::timeout(limit, done.wait_for(|s| s.is_terminal())).await {
            return *status;
        }
        self.force_finish(command_id, forced);
        self.status(command_id).unwrap_or(forced)
    }

    /// Terminate a RUNNING command without the agent's report
    fn force_finish(&self, command_id: &str, status: CommandStatus) {
        let freed = {
            let mut state = self.state.lock();
            let Some(exec) = state.executions.get(command_id) else {
                return;
            };
            let reason = exec.pending.reason().map(String::from);
            warn!(command_id, status = %status, "agent did not confirm stop, forcing");
            self.finalize_locked(&mut state, command_id, status, reason, None)
        };
        if let Some(agent_id) = freed {
            self.try_dispatch(&agent_id);
        }
    }

    fn handle_timeout(&self, command_id: &str) {
        let freed = {
            let mut state = self.state.lock();
            let Some(exec) = state.executions.get(command_id) else {
                return;
            };
            let err = HubError::Timeout {
                command_id: command_id.to_string(),
                elapsed_ms: exec.elapsed().as_millis() as u64,
            };
            warn!(agent_id = ?exec.agent_id, error = %err, "execution time limit reached");
            if let Some(agent_id) = exec.agent_id.clone() {
                self.send_to_agent(
                    &agent_id,
                    MessageType::CommandCancel,
                    &CommandCancel {
                        command_id: command_id.to_string(),
                        reason: "timed out".into(),
                    },
                );
            }
            self.finalize_locked(
                &mut state,
                command_id,
                CommandStatus::Failed,
                Some("timed out".into()),
                None,
            )
        };
        if let Some(agent_id) = freed {
            self.try_dispatch(&agent_id);
        }
    }

    fn on_deadline(&self, command_id: &str, deadline: Deadline) {
        match deadline {
            Deadline::Timeout => self.handle_timeout(command_id),
            Deadline::CancelGrace => self.force_finish(command_id, CommandStatus::Cancelled),
            Deadline::InterruptGrace => self.force_finish(command_id, CommandStatus::Interrupted),
        }
    }

    fn arm_deadline(&self, delay: Duration, command_id: &str, deadline: Deadline) -> TimerHandle {
        let this = self.this.clone();
        let command_id = command_id.to_string();
        timer::arm(delay, move || async move {
            if let Some(orchestrator) = this.upgrade() {
                orchestrator.on_deadline(&command_id, deadline);
            }
        })
    }

    /// The single place a command becomes terminal
    ///
    /// Returns the agent that now has a free slot, if any. A command that is
    /// already terminal is left untouched.
    fn finalize_locked(
        &self,
        state: &mut State,
        command_id: &str,
        status: CommandStatus,
        reason: Option<String>,
        outcome: Option<&CommandOutcome>,
    ) -> Option<String> {
        let cmd = state.commands.get_mut(command_id)?;
        if cmd.status.is_terminal() {
            return None;
        }
        if !state_machine::is_valid_transition(cmd.status, status) {
            warn!(command_id, from = %cmd.status, to = %status, "rejected terminal transition");
            return None;
        }
        let from = cmd.status;
        let exit_code = outcome.and_then(|o| o.exit_code);
        cmd.status = status;
        cmd.completed_at = Some(now_ms());
        cmd.reason = reason;

        if let Some(entry) = self.queue.remove_command(command_id) {
            self.persist
                .submit(PersistOp::RemoveQueueEntry(command_id.to_string()));
            self.publish_queue(&entry.scope);
        }
        // Buffered output goes out before the final status
        self.batcher.finish(command_id);

        self.persist.submit(PersistOp::Status {
            command_id: command_id.to_string(),
            status,
            meta: StatusMeta::for_command(cmd, outcome),
        });
        self.audit(AuditEvent::command(
            format!("command.{}", status.as_str().to_ascii_lowercase()),
            cmd,
            json!({
                "from": from,
                "reason": cmd.reason,
                "exitCode": exit_code,
            }),
        ));
        self.emit(OrchestratorEvent::Finished {
            command_id: command_id.to_string(),
            status,
            reason: cmd.reason.clone(),
        });
        self.publish_status(cmd);
        info!(command_id, from = %from, to = %status, reason = ?cmd.reason, "command finished");

        let execution = state.executions.remove(command_id)?;
        let agent_id = execution.agent_id.clone();
        execution.finish(status);

        let agent_id = agent_id?;
        if state.running_on(&agent_id) == 0 {
            self.monitor.release(&agent_id);
        }
        Some(agent_id)
    }

    /// Whether `agent_id` is the agent running `command_id`
    pub fn is_running_on(&self, command_id: &str, agent_id: &str) -> bool {
        self.state
            .lock()
            .executions
            .get(command_id)
            .is_some_and(|e| e.agent_id.as_deref() == Some(agent_id))
    }

    pub fn acknowledge(&self, agent_id: &str, command_id: &str) -> bool {
        let mut state = self.state.lock();
        match state.executions.get_mut(command_id) {
            Some(exec) if exec.agent_id.as_deref() == Some(agent_id) => {
                exec.acknowledged = true;
                debug!(agent_id, command_id, "command acknowledged");
                true
            }
            _ => {
                debug!(agent_id, command_id, "ack for unknown execution");
                false
            }
        }
    }

    /// Feed an output or trace item into the command's batch
    ///
    /// Items for commands this agent is not running are dropped.
    pub fn record_output(&self, agent_id: &str, command_id: &str, item: StreamItem) -> bool {
        // Held across the push so a terminal transition cannot finish the
        // batch key in between
        let state = self.state.lock();
        let running = state
            .executions
            .get(command_id)
            .is_some_and(|e| e.agent_id.as_deref() == Some(agent_id));
        if !running {
            debug!(agent_id, command_id, "output for inactive command dropped");
            return false;
        }
        self.batcher.push(command_id, item);
        true
    }

    /// Move executions from an evicted agent connection onto its replacement
    pub fn rebind_connection(&self, agent_id: &str, old_connection_id: &str, new_connection_id: &str) -> usize {
        let mut state = self.state.lock();
        let mut moved = 0;
        for exec in state.executions.values_mut() {
            if exec.agent_id.as_deref() == Some(agent_id)
                && exec.connection_id.as_deref() == Some(old_connection_id)
            {
                exec.connection_id = Some(new_connection_id.to_string());
                moved += 1;
            }
        }
        if moved > 0 {
            info!(agent_id, old_connection_id, new_connection_id, moved, "executions moved to new connection");
        }
        moved
    }

    /// Cascade for an agent connection that went away
    ///
    /// Cancels the agent's RUNNING commands that were dispatched on
    /// `connection_id`. If the agent has no live connection left, every
    /// RUNNING command on it and its QUEUED commands are cancelled too.
    /// Returns the number of commands cancelled.
    pub fn handle_agent_disconnected(&self, agent_id: &str, connection_id: &str) -> usize {
        let mut state = self.state.lock();
        state.backoff.remove(agent_id);
        let online = self.registry.is_agent_online(agent_id);

        let mut doomed: Vec<String> = state
            .executions
            .values()
            .filter(|e| {
                e.agent_id.as_deref() == Some(agent_id)
                    && (!online || e.connection_id.as_deref().map_or(true, |c| c == connection_id))
            })
            .map(|e| e.command_id.clone())
            .collect();
        doomed.sort();
        if !online {
            doomed.extend(
                self.queue
                    .entries(&QueueScope::agent(agent_id))
                    .into_iter()
                    .map(|e| e.command_id),
            );
        }

        let mut cancelled = 0;
        for command_id in &doomed {
            let cmd_status = state.commands.get(command_id).map(|c| c.status);
            if cmd_status.is_some_and(|s| !s.is_terminal()) {
                self.finalize_locked(
                    &mut state,
                    command_id,
                    CommandStatus::Cancelled,
                    Some("agent disconnected".into()),
                    None,
                );
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            warn!(agent_id, connection_id, cancelled, "agent disconnected, commands cancelled");
        }
        cancelled
    }

    /// Drive the disconnect cascade from registry events
    pub fn spawn_disconnect_listener(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        let mut events = self.registry.subscribe();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = shutdown.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(ConnectionEvent::Disconnected {
                        connection_id,
                        role: PeerRole::Agent,
                        agent_id: Some(agent_id),
                        ..
                    }) => {
                        orchestrator.handle_agent_disconnected(&agent_id, &connection_id);
                    }
                    Ok(ConnectionEvent::Replaced {
                        agent_id,
                        old_connection_id,
                        new_connection_id,
                    }) => {
                        orchestrator.rebind_connection(&agent_id, &old_connection_id, &new_connection_id);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => {
                        warn!(missed = n, "orchestrator lagged behind connection events");
                        orchestrator.reconcile_connections();
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("disconnect listener stopped");
        })
    }

    /// Repair executions whose connection is no longer registered
    ///
    /// Work on an agent that reconnected follows the new connection; work on
    /// an agent with no connection is cancelled.
    fn reconcile_connections(&self) {
        let orphaned: Vec<(String, String)> = self
            .state
            .lock()
            .executions
            .values()
            .filter_map(|e| Some((e.agent_id.clone()?, e.connection_id.clone()?)))
            .filter(|(_, conn)| self.registry.get_connection(conn).is_none())
            .collect();
        for (agent_id, connection_id) in orphaned {
            match self.registry.get_agent_connection(&agent_id) {
                Some(current) => {
                    self.rebind_connection(&agent_id, &connection_id, &current.id);
                }
                None => {
                    self.handle_agent_disconnected(&agent_id, &connection_id);
                }
            }
        }
    }

    pub fn update_priority(&self, command_id: &str, priority: u8) -> Result<QueueEntry> {
        validate_priority(u16::from(priority))?;
        let _state = self.state.lock();
        let entry = self
            .queue
            .entry_for_command(command_id)
            .ok_or_else(|| HubError::QueueEntryNotFound(command_id.to_string()))?;
        let entry = self.queue.update_priority(entry.entry_id, priority)?;

        self.persist.submit(PersistOp::QueueEntry(entry.clone()));
        self.emit(OrchestratorEvent::PriorityChanged {
            command_id: command_id.to_string(),
            priority,
            position: entry.position,
        });
        self.publish_queue(&entry.scope);
        debug!(command_id, priority, position = entry.position, "priority updated");
        Ok(entry)
    }

    pub fn get_position(&self, command_id: &str) -> Option<usize> {
        self.queue.get_position(command_id)
    }

    pub fn get_command(&self, command_id: &str) -> Option<Command> {
        self.state.lock().commands.get(command_id).cloned()
    }

    pub fn status(&self, command_id: &str) -> Option<CommandStatus> {
        self.state.lock().commands.get(command_id).map(|c| c.status)
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().executions.len()
    }

    /// Commands currently RUNNING on an agent, sorted
    pub fn running_on(&self, agent_id: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .state
            .lock()
            .executions
            .values()
            .filter(|e| e.agent_id.as_deref() == Some(agent_id))
            .map(|e| e.command_id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Token cancelled when the command is asked to stop or finishes
    pub fn execution_token(&self, command_id: &str) -> Option<CancellationToken> {
        self.state
            .lock()
            .executions
            .get(command_id)
            .map(ActiveExecution::cancel_token)
    }

    fn emit(&self, event: OrchestratorEvent) {
        let _ = self.events.send(event);
    }

    fn audit(&self, event: AuditEvent) {
        self.persist.submit(PersistOp::Audit(event));
    }

    fn send_to_agent<P: Serialize>(&self, agent_id: &str, msg_type: MessageType, payload: &P) -> bool {
        match Envelope::new(msg_type, payload) {
            Ok(env) => self.registry.send_to_agent(agent_id, Arc::new(env)),
            Err(e) => {
                warn!(agent_id, ?msg_type, error = %e, "failed to encode agent message");
                false
            }
        }
    }

    fn publish<P: Serialize>(&self, msg_type: MessageType, payload: &P) {
        match Envelope::new(msg_type, payload) {
            Ok(env) => {
                self.broadcaster.broadcast_to_dashboards(&env, &[]);
            }
            Err(e) => warn!(?msg_type, error = %e, "failed to encode dashboard message"),
        }
    }

    fn publish_status(&self, cmd: &Command) {
        self.publish(MessageType::CommandStatus, &cmd.status_update());
    }

    fn publish_queue(&self, scope: &QueueScope) {
        let update = QueueUpdate {
            scope: scope.agent_id().map(Into::into),
            entries: self.queue.entries(scope).iter().map(QueueEntry::view).collect(),
        };
        self.publish(MessageType::QueueUpdate, &update);
    }

    fn publish_error(&self, payload: ErrorPayload) {
        self.publish(MessageType::Error, &payload);
    }

    /// Flush pending persistence writes
    pub async fn sync(&self) {
        self.persist.sync().await;
    }
}
