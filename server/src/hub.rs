//! Hub composition root and inbound message routing

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use switchyard_shared::{
    AgentControl, CommandAck, CommandCancel, CommandComplete, CommandInterrupt, CommandSubmit,
    Connect, ConnectAck, ControlAction, Envelope, ErrorPayload, Heartbeat, MessageType, PeerRole,
    PriorityUpdate, StreamItem, StreamKind, TerminalOutput, TokenRefresh, TraceEvent,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broadcast::{BroadcastResult, MessageBroadcaster, OutputBatcher};
use crate::command::{CommandOrchestrator, NewCommand};
use crate::config::HubConfig;
use crate::error::{HubError, Result};
use crate::heartbeat::HeartbeatMonitor;
use crate::queue::PriorityCommandQueue;
use crate::session::{Connection, ConnectionRegistry, Outbound};
use crate::storage::{PersistenceWriter, Storage};

/// Every hub component, wired together
pub struct Hub {
    config: HubConfig,
    registry: Arc<ConnectionRegistry>,
    broadcaster: Arc<MessageBroadcaster>,
    batcher: Arc<OutputBatcher>,
    monitor: Arc<HeartbeatMonitor>,
    orchestrator: Arc<CommandOrchestrator>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Hub {
    /// Build the hub; must be called inside a Tokio runtime
    pub fn new(config: HubConfig, storage: Arc<dyn Storage>) -> Arc<Self> {
        let registry = Arc::new(ConnectionRegistry::new(config.event_buffer));
        let broadcaster = Arc::new(MessageBroadcaster::new(registry.clone()));
        let batcher = Arc::new(OutputBatcher::new(
            broadcaster.clone(),
            config.batch_max_size,
            config.batch_flush_interval(),
        ));
        let monitor = HeartbeatMonitor::new(config.heartbeat_timeout(), broadcaster.clone());
        let (persist, writer_task) = PersistenceWriter::spawn(storage.clone(), config.persist_retry.clone());
        let orchestrator = CommandOrchestrator::new(
            config.clone(),
            broadcaster.clone(),
            batcher.clone(),
            Arc::new(PriorityCommandQueue::new()),
            monitor.clone(),
            storage.clone(),
            persist,
        );

        info!(backend = storage.name(), "hub initialized");
        Arc::new(Self {
            config,
            registry,
            broadcaster,
            batcher,
            monitor,
            orchestrator,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(vec![writer_task]),
        })
    }

    /// Spawn the background tasks: batch ticker and connection listeners
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        tasks.push(self.batcher.spawn_ticker(self.shutdown.clone()));
        tasks.push(self.monitor.spawn_listener(self.shutdown.clone()));
        tasks.push(
            self.orchestrator
                .spawn_disconnect_listener(self.shutdown.clone()),
        );
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn broadcaster(&self) -> &Arc<MessageBroadcaster> {
        &self.broadcaster
    }

    pub fn monitor(&self) -> &Arc<HeartbeatMonitor> {
        &self.monitor
    }

    pub fn orchestrator(&self) -> &Arc<CommandOrchestrator> {
        &self.orchestrator
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Complete a CONNECT handshake and register the peer
    pub fn accept(&self, connect: Connect, tx: Outbound) -> Result<Arc<Connection>> {
        if connect.role == PeerRole::Agent && connect.agent_id.as_deref().map_or(true, str::is_empty) {
            return Err(HubError::Handshake("agent CONNECT requires agentId".into()));
        }

        let connection = Arc::new(Connection::new(
            format!("conn_{}", Uuid::now_v7().simple()),
            connect.role,
            connect.agent_id,
            connect.user_id,
            tx,
        ));
        self.registry.register(connection.clone())?;

        let ack = Envelope::new(
            MessageType::ConnectAck,
            &ConnectAck {
                connection_id: connection.id.clone(),
                heartbeat_timeout_ms: self.config.heartbeat_timeout_ms,
            },
        )?;
        connection.send(Arc::new(ack));

        if let Some(agent_id) = &connection.agent_id {
            self.monitor.on_agent_connected(agent_id, &connection.id);
            self.orchestrator.on_agent_connected(agent_id);
        }
        Ok(connection)
    }

    /// Route one inbound message from a registered connection
    pub async fn handle_message(self: &Arc<Self>, connection_id: &str, envelope: Envelope) -> Result<()> {
        let connection = self
            .registry
            .get_connection(connection_id)
            .ok_or_else(|| HubError::ConnectionNotFound(connection_id.to_string()))?;
        connection.touch();

        match (connection.role, &connection.agent_id) {
            (PeerRole::Agent, Some(agent_id)) => self.handle_agent_message(agent_id, envelope),
            _ => self.handle_dashboard_message(&connection, envelope).await,
        }
    }

    fn handle_agent_message(&self, agent_id: &str, envelope: Envelope) -> Result<()> {
        match envelope.msg_type {
            MessageType::Heartbeat => {
                let heartbeat: Heartbeat = envelope.decode_payload()?;
                if let Some(status) = self.monitor.on_heartbeat(agent_id, heartbeat.status) {
                    if status.accepts_work() {
                        self.orchestrator.try_dispatch(agent_id);
                    }
                }
            }
            MessageType::CommandAck => {
                let ack: CommandAck = envelope.decode_payload()?;
                self.orchestrator.acknowledge(agent_id, &ack.command_id);
            }
            MessageType::CommandComplete => {
                let complete: CommandComplete = envelope.decode_payload()?;
                if self.orchestrator.is_running_on(&complete.command_id, agent_id) {
                    let command_id = complete.command_id.clone();
                    self.orchestrator.complete(&command_id, complete.into())?;
                } else {
                    debug!(agent_id, command_id = %complete.command_id, "completion for command not running here");
                }
            }
            MessageType::TerminalOutput => {
                let output: TerminalOutput = envelope.decode_payload()?;
                let item = StreamItem {
                    kind: StreamKind::Output,
                    stream: Some(output.stream),
                    data: Value::String(output.data),
                    timestamp: envelope.timestamp,
                };
                self.orchestrator
                    .record_output(agent_id, &output.command_id, item);
            }
            MessageType::TraceEvent => {
                let trace: TraceEvent = envelope.decode_payload()?;
                let item = StreamItem {
                    kind: StreamKind::Trace,
                    stream: None,
                    data: trace.event,
                    timestamp: envelope.timestamp,
                };
                self.orchestrator
                    .record_output(agent_id, &trace.command_id, item);
            }
            MessageType::Error => {
                let mut error: ErrorPayload = envelope.decode_payload()?;
                error.agent_id = Some(agent_id.to_string());
                warn!(agent_id, code = %error.code, message = %error.message, "agent reported error");
                self.publish(MessageType::Error, &error);
            }
            MessageType::Connect => {
                debug!(agent_id, "duplicate CONNECT ignored");
            }
            other => {
                return Err(HubError::UnsupportedMessage {
                    role: PeerRole::Agent,
                    msg_type: other,
                })
            }
        }
        Ok(())
    }

    async fn handle_dashboard_message(self: &Arc<Self>, connection: &Connection, envelope: Envelope) -> Result<()> {
        match envelope.msg_type {
            MessageType::CommandSubmit => {
                let submit: CommandSubmit = envelope.decode_payload()?;
                let command = NewCommand {
                    target_agent_id: submit.target_agent_id,
                    priority: submit.priority,
                    time_limit_ms: submit.time_limit_ms,
                    payload: submit.payload,
                    created_by: connection.user_id.clone(),
                };
                self.orchestrator.create_command(command).await?;
            }
            MessageType::CommandCancel => {
                let cancel: CommandCancel = envelope.decode_payload()?;
                // Waiting out the grace period must not stall this connection
                let hub = Arc::clone(self);
                let connection_id = connection.id.clone();
                tokio::spawn(async move {
                    let reason = if cancel.reason.is_empty() {
                        "cancelled by user"
                    } else {
                        cancel.reason.as_str()
                    };
                    if let Err(e) = hub.orchestrator.cancel(&cancel.command_id, reason).await {
                        hub.report_error(&connection_id, &e);
                    }
                });
            }
            MessageType::CommandInterrupt => {
                let interrupt: CommandInterrupt = envelope.decode_payload()?;
                let hub = Arc::clone(self);
                let connection_id = connection.id.clone();
                tokio::spawn(async move {
                    let result = hub
                        .orchestrator
                        .interrupt(
                            &interrupt.command_id,
                            &interrupt.reason,
                            interrupt.force,
                            interrupt.timeout_ms.map(Duration::from_millis),
                        )
                        .await;
                    if let Err(e) = result {
                        hub.report_error(&connection_id, &e);
                    }
                });
            }
            MessageType::PriorityUpdate => {
                let update: PriorityUpdate = envelope.decode_payload()?;
                self.orchestrator
                    .update_priority(&update.command_id, update.priority)?;
            }
            MessageType::Heartbeat | MessageType::Connect => {}
            other => {
                return Err(HubError::UnsupportedMessage {
                    role: connection.role,
                    msg_type: other,
                })
            }
        }
        Ok(())
    }

    /// Tell a peer its request failed
    pub fn report_error(&self, connection_id: &str, error: &HubError) {
        debug!(connection_id, error = %error, "reporting error to peer");
        let payload = ErrorPayload {
            code: error.code().into(),
            message: error.to_string(),
            recoverable: error.is_recoverable(),
            command_id: None,
            agent_id: None,
        };
        match Envelope::new(MessageType::Error, &payload) {
            Ok(env) => {
                self.registry.send(connection_id, Arc::new(env));
            }
            Err(e) => warn!(error = %e, "failed to encode error payload"),
        }
    }

    /// Drop a connection (socket closed)
    pub fn disconnect(&self, connection_id: &str) {
        self.registry.unregister(connection_id);
    }

    /// Push a new credential to an agent
    pub fn refresh_token(&self, agent_id: &str, token: &str, expires_at: u64) -> Result<BroadcastResult> {
        let env = Envelope::new(
            MessageType::TokenRefresh,
            &TokenRefresh {
                token: token.to_string(),
                expires_at,
            },
        )?;
        let result = self.broadcaster.send_to_agent(agent_id, &env);
        info!(agent_id, delivered = result.all_delivered(), "token refresh sent");
        Ok(result)
    }

    /// Ask an agent to restart itself
    pub fn restart_agent(&self, agent_id: &str, reason: Option<&str>) -> Result<BroadcastResult> {
        let env = Envelope::new(
            MessageType::AgentControl,
            &AgentControl {
                action: ControlAction::Restart,
                command_id: None,
                reason: reason.map(Into::into),
            },
        )?;
        let result = self.broadcaster.send_to_agent(agent_id, &env);
        info!(agent_id, delivered = result.all_delivered(), "restart requested");
        Ok(result)
    }

    fn publish<P: Serialize>(&self, msg_type: MessageType, payload: &P) {
        match Envelope::new(msg_type, payload) {
            Ok(env) => {
                self.broadcaster.broadcast_to_dashboards(&env, &[]);
            }
            Err(e) => warn!(?msg_type, error = %e, "failed to encode dashboard message"),
        }
    }

    /// Stop background tasks, flush output and pending writes
    pub async fn shutdown(&self) {
        info!("hub shutting down");
        self.shutdown.cancel();
        self.batcher.flush_all();
        self.orchestrator.sync().await;

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
    }
}
