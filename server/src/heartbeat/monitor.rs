//! Per-agent heartbeat deadlines and status
//!
//! Each connected agent has one armed deadline. A heartbeat re-arms it; an
//! expired deadline marks the agent offline and drops its connection from
//! the registry, whose `Disconnected` event drives the command cascade.
//! Every deadline carries a generation number so a timer that raced with a
//! re-arm or reconnect does nothing.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use switchyard_shared::{now_ms, AgentStatus, AgentStatusUpdate, Envelope, MessageType, PeerRole};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broadcast::MessageBroadcaster;
use crate::session::{ConnectionEvent, ConnectionRegistry};
use crate::timer::{self, TimerHandle};

struct AgentRecord {
    status: AgentStatus,
    last_heartbeat: u64,
    connection_id: Option<String>,
    generation: u64,
    deadline: Option<TimerHandle>,
    /// The hub has commands running on this agent
    busy: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSnapshot {
    pub agent_id: String,
    pub status: AgentStatus,
    pub last_heartbeat: u64,
    pub connection_id: Option<String>,
}

pub struct HeartbeatMonitor {
    timeout: Duration,
    registry: Arc<ConnectionRegistry>,
    broadcaster: Arc<MessageBroadcaster>,
    agents: Mutex<HashMap<String, AgentRecord>>,
    this: Weak<HeartbeatMonitor>,
}

impl HeartbeatMonitor {
    pub fn new(timeout: Duration, broadcaster: Arc<MessageBroadcaster>) -> Arc<Self> {
        let registry = broadcaster.registry().clone();
        Arc::new_cyclic(|this| Self {
            timeout,
            registry,
            broadcaster,
            agents: Mutex::new(HashMap::new()),
            this: this.clone(),
        })
    }

    /// Start tracking a freshly registered agent connection
    pub fn on_agent_connected(&self, agent_id: &str, connection_id: &str) {
        let update = {
            let mut agents = self.agents.lock();
            let record = agents.entry(agent_id.to_string()).or_insert(AgentRecord {
                status: AgentStatus::Offline,
                last_heartbeat: 0,
                connection_id: None,
                generation: 0,
                deadline: None,
                busy: false,
            });
            // Work survives an eviction, so a replacement connection may be busy
            record.status = if record.busy {
                AgentStatus::Executing
            } else {
                AgentStatus::Online
            };
            record.last_heartbeat = now_ms();
            record.connection_id = Some(connection_id.to_string());
            self.rearm(agent_id, record);
            status_update(agent_id, record)
        };
        info!(agent_id, connection_id, "agent online");
        self.publish(&update);
    }

    /// Record a heartbeat and re-arm the deadline
    ///
    /// Returns the agent's status afterwards, or `None` if the agent is not
    /// being tracked (unknown or already expired).
    pub fn on_heartbeat(&self, agent_id: &str, reported: Option<AgentStatus>) -> Option<AgentStatus> {
        let (status, update) = {
            let mut agents = self.agents.lock();
            let record = agents.get_mut(agent_id)?;
            if record.status == AgentStatus::Offline {
                debug!(agent_id, "heartbeat from offline agent ignored");
                return None;
            }
            record.last_heartbeat = now_ms();
            self.rearm(agent_id, record);

            let next = match reported {
                Some(AgentStatus::Offline) | None => record.status,
                // The hub owns EXECUTING; "online" while work is running restores it
                Some(AgentStatus::Online) if record.busy => AgentStatus::Executing,
                Some(s) => s,
            };
            let changed = next != record.status;
            record.status = next;
            (next, changed.then(|| status_update(agent_id, record)))
        };
        if let Some(update) = update {
            info!(agent_id, status = %status, "agent reported status change");
            self.publish(&update);
        }
        Some(status)
    }

    /// Hub-driven status changes (EXECUTING while running work, back to ONLINE)
    ///
    /// No-op for untracked or offline agents.
    pub fn set_status(&self, agent_id: &str, status: AgentStatus) {
        let update = {
            let mut agents = self.agents.lock();
            let Some(record) = agents.get_mut(agent_id) else {
                return;
            };
            if record.status == AgentStatus::Offline {
                return;
            }
            if status == AgentStatus::Executing {
                record.busy = true;
            }
            if record.status == status {
                return;
            }
            record.status = status;
            status_update(agent_id, record)
        };
        debug!(agent_id, status = %status, "agent status set");
        self.publish(&update);
    }

    /// Agent finished its last running command
    pub fn release(&self, agent_id: &str) {
        let update = {
            let mut agents = self.agents.lock();
            let Some(record) = agents.get_mut(agent_id) else {
                return;
            };
            record.busy = false;
            if record.status != AgentStatus::Executing {
                return;
            }
            record.status = AgentStatus::Online;
            status_update(agent_id, record)
        };
        debug!(agent_id, "agent idle");
        self.publish(&update);
    }

    pub fn status(&self, agent_id: &str) -> Option<AgentStatus> {
        self.agents.lock().get(agent_id).map(|r| r.status)
    }

    /// Whether dispatch may hand this agent more work
    ///
    /// Agents the monitor has never seen are not restricted.
    pub fn accepts_work(&self, agent_id: &str) -> bool {
        self.status(agent_id).map_or(true, AgentStatus::accepts_work)
    }

    pub fn last_heartbeat(&self, agent_id: &str) -> Option<u64> {
        self.agents.lock().get(agent_id).map(|r| r.last_heartbeat)
    }

    pub fn snapshot(&self) -> Vec<AgentSnapshot> {
        let agents = self.agents.lock();
        let mut out: Vec<AgentSnapshot> = agents
            .iter()
            .map(|(id, r)| AgentSnapshot {
                agent_id: id.clone(),
                status: r.status,
                last_heartbeat: r.last_heartbeat,
                connection_id: r.connection_id.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        out
    }

    /// The agent's connection went away for reasons other than expiry
    ///
    /// Ignored when `connection_id` is not the agent's current connection,
    /// so a late close of an evicted socket leaves the new one alone.
    pub fn on_disconnected(&self, agent_id: &str, connection_id: &str) {
        let update = {
            let mut agents = self.agents.lock();
            let Some(record) = agents.get_mut(agent_id) else {
                return;
            };
            if record.connection_id.as_deref() != Some(connection_id) {
                return;
            }
            if !mark_offline(record) {
                return;
            }
            status_update(agent_id, record)
        };
        info!(agent_id, connection_id, "agent offline");
        self.publish(&update);
    }

    /// Deadline callback; returns whether the agent was expired
    fn expire(&self, agent_id: &str, generation: u64) -> bool {
        let (connection_id, update) = {
            let mut agents = self.agents.lock();
            let Some(record) = agents.get_mut(agent_id) else {
                return false;
            };
            if record.generation != generation || record.status == AgentStatus::Offline {
                return false;
            }
            mark_offline(record);
            (record.connection_id.clone(), status_update(agent_id, record))
        };

        warn!(
            agent_id,
            timeout_ms = self.timeout.as_millis() as u64,
            "heartbeat deadline missed, dropping agent"
        );
        self.publish(&update);
        if let Some(connection_id) = connection_id {
            self.registry.unregister(&connection_id);
        }
        true
    }

    fn rearm(&self, agent_id: &str, record: &mut AgentRecord) {
        record.generation += 1;
        let generation = record.generation;
        let monitor = self.this.clone();
        let agent_id = agent_id.to_string();
        // Replacing the handle cancels the previous deadline
        record.deadline = Some(timer::arm(self.timeout, move || async move {
            if let Some(monitor) = monitor.upgrade() {
                monitor.expire(&agent_id, generation);
            }
        }));
    }

    fn publish(&self, update: &AgentStatusUpdate) {
        match Envelope::new(MessageType::AgentStatus, update) {
            Ok(env) => {
                self.broadcaster.broadcast_to_dashboards(&env, &[]);
            }
            Err(e) => warn!(agent_id = %update.agent_id, error = %e, "failed to encode agent status"),
        }
    }

    /// Follow registry events so socket closes mark agents offline
    pub fn spawn_listener(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
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
                    }) => monitor.on_disconnected(&agent_id, &connection_id),
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => {
                        warn!(missed = n, "heartbeat monitor lagged behind connection events");
                        monitor.reconcile();
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("heartbeat listener stopped");
        })
    }

    /// Mark offline every tracked agent the registry no longer knows
    fn reconcile(&self) {
        let stale: Vec<(String, String)> = self
            .agents
            .lock()
            .iter()
            .filter(|(id, r)| r.status != AgentStatus::Offline && !self.registry.is_agent_online(id))
            .filter_map(|(id, r)| r.connection_id.clone().map(|c| (id.clone(), c)))
            .collect();
        for (agent_id, connection_id) in stale {
            self.on_disconnected(&agent_id, &connection_id);
        }
    }
}

fn mark_offline(record: &mut AgentRecord) -> bool {
    if record.status == AgentStatus::Offline {
        return false;
    }
    record.status = AgentStatus::Offline;
    record.deadline = None;
    record.busy = false;
    true
}

fn status_update(agent_id: &str, record: &AgentRecord) -> AgentStatusUpdate {
    AgentStatusUpdate {
        agent_id: agent_id.to_string(),
        status: record.status,
        last_heartbeat: record.last_heartbeat,
    }
}
