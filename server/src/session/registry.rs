//! Connection registry: the single source of truth for who is connected

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use switchyard_shared::{Envelope, PeerRole};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::connection::Connection;
use crate::error::{HubError, Result};

/// Lifecycle notifications emitted by the registry
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Registered {
        connection_id: String,
        role: PeerRole,
        agent_id: Option<String>,
    },
    /// A newer connection for the same agent evicted an older one
    Replaced {
        agent_id: String,
        old_connection_id: String,
        new_connection_id: String,
    },
    Disconnected {
        connection_id: String,
        role: PeerRole,
        agent_id: Option<String>,
        user_id: Option<String>,
    },
}

#[derive(Default)]
struct RegistryInner {
    /// connection_id -> connection
    connections: HashMap<String, Arc<Connection>>,
    /// agent_id -> connection_id
    agents: HashMap<String, String>,
}

/// Tracks every live agent and dashboard connection
pub struct ConnectionRegistry {
    inner: RwLock<RegistryInner>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionRegistry {
    pub fn new(event_buffer: usize) -> Self {
        let (events, _) = broadcast::channel(event_buffer.max(1));
        Self {
            inner: RwLock::new(RegistryInner::default()),
            events,
        }
    }

    /// Subscribe to connection lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Register a connection
    ///
    /// An agent connection evicts and closes any prior connection for the same
    /// agent id; the evicted connection is returned.
    pub fn register(&self, connection: Arc<Connection>) -> Result<Option<Arc<Connection>>> {
        if connection.role == PeerRole::Agent && connection.agent_id.is_none() {
            return Err(HubError::Handshake("agent connection without agent id".into()));
        }

        let evicted = {
            let mut inner = self.inner.write();
            let evicted = match &connection.agent_id {
                Some(agent_id) if connection.role == PeerRole::Agent => {
                    let previous = inner.agents.insert(agent_id.clone(), connection.id.clone());
                    previous
                        .filter(|old_id| *old_id != connection.id)
                        .and_then(|old_id| inner.connections.remove(&old_id))
                }
                _ => None,
            };
            inner
                .connections
                .insert(connection.id.clone(), connection.clone());
            evicted
        };

        info!(
            connection_id = %connection.id,
            role = %connection.role,
            agent_id = ?connection.agent_id,
            "connection registered"
        );
        self.emit(ConnectionEvent::Registered {
            connection_id: connection.id.clone(),
            role: connection.role,
            agent_id: connection.agent_id.clone(),
        });

        if let (Some(old), Some(agent_id)) = (&evicted, &connection.agent_id) {
            warn!(
                agent_id = %agent_id,
                old_connection_id = %old.id,
                new_connection_id = %connection.id,
                "agent reconnected, evicting previous connection"
            );
            old.close();
            self.emit(ConnectionEvent::Replaced {
                agent_id: agent_id.clone(),
                old_connection_id: old.id.clone(),
                new_connection_id: connection.id.clone(),
            });
        }

        Ok(evicted)
    }

    /// Remove a connection from all indexes and close it
    ///
    /// Unknown ids (including already-evicted connections) are a no-op.
    pub fn unregister(&self, connection_id: &str) -> Option<Arc<Connection>> {
        let removed = {
            let mut inner = self.inner.write();
            let removed = inner.connections.remove(connection_id)?;
            if let Some(agent_id) = &removed.agent_id {
                if inner.agents.get(agent_id).map(String::as_str) == Some(connection_id) {
                    inner.agents.remove(agent_id);
                }
            }
            removed
        };

        removed.close();
        info!(
            connection_id,
            role = %removed.role,
            agent_id = ?removed.agent_id,
            "connection unregistered"
        );
        self.emit(ConnectionEvent::Disconnected {
            connection_id: removed.id.clone(),
            role: removed.role,
            agent_id: removed.agent_id.clone(),
            user_id: removed.user_id.clone(),
        });
        Some(removed)
    }

    pub fn get_connection(&self, connection_id: &str) -> Option<Arc<Connection>> {
        self.inner.read().connections.get(connection_id).cloned()
    }

    pub fn get_agent_connection(&self, agent_id: &str) -> Option<Arc<Connection>> {
        let inner = self.inner.read();
        inner
            .agents
            .get(agent_id)
            .and_then(|id| inner.connections.get(id))
            .cloned()
    }

    /// Dashboards, optionally restricted to one user
    pub fn list_dashboards(&self, user_id: Option<&str>) -> Vec<Arc<Connection>> {
        self.list_role(PeerRole::Dashboard)
            .into_iter()
            .filter(|c| user_id.is_none() || c.user_id.as_deref() == user_id)
            .collect()
    }

    pub fn list_agents(&self) -> Vec<Arc<Connection>> {
        self.list_role(PeerRole::Agent)
    }

    /// Connected agent ids, sorted for deterministic iteration
    pub fn online_agent_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.read().agents.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn list_role(&self, role: PeerRole) -> Vec<Arc<Connection>> {
        let mut conns: Vec<Arc<Connection>> = self
            .inner
            .read()
            .connections
            .values()
            .filter(|c| c.role == role)
            .cloned()
            .collect();
        conns.sort_by(|a, b| a.id.cmp(&b.id));
        conns
    }

    pub fn is_agent_online(&self, agent_id: &str) -> bool {
        self.inner.read().agents.contains_key(agent_id)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.read().connections.len()
    }

    /// Best-effort send; `false` when the connection is missing or its buffer is full
    pub fn send(&self, connection_id: &str, message: Arc<Envelope>) -> bool {
        let Some(conn) = self.get_connection(connection_id) else {
            debug!(connection_id, msg_type = ?message.msg_type, "send to unknown connection");
            return false;
        };
        let sent = conn.send(message.clone());
        if !sent {
            warn!(
                connection_id,
                msg_type = ?message.msg_type,
                dropped = conn.drop_count(),
                "failed to queue message for connection"
            );
        }
        sent
    }

    pub fn send_to_agent(&self, agent_id: &str, message: Arc<Envelope>) -> bool {
        match self.get_agent_connection(agent_id) {
            Some(conn) => self.send(&conn.id, message),
            None => {
                debug!(agent_id, msg_type = ?message.msg_type, "send to offline agent");
                false
            }
        }
    }

    /// Record inbound activity on a connection
    pub fn touch(&self, connection_id: &str) {
        if let Some(conn) = self.get_connection(connection_id) {
            conn.touch();
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchyard_shared::{Heartbeat, MessageType};
    use tokio::sync::mpsc;

    fn agent(id: &str, agent_id: &str) -> (Arc<Connection>, mpsc::Receiver<Arc<Envelope>>) {
        let (tx, rx) = mpsc::channel(8);
        (Arc::new(Connection::agent(id, agent_id, tx)), rx)
    }

    fn dashboard(id: &str, user: Option<&str>) -> (Arc<Connection>, mpsc::Receiver<Arc<Envelope>>) {
        let (tx, rx) = mpsc::channel(8);
        (Arc::new(Connection::dashboard(id, user.map(Into::into), tx)), rx)
    }

    fn message() -> Arc<Envelope> {
        Arc::new(Envelope::new(MessageType::Heartbeat, &Heartbeat::default()).unwrap())
    }

    #[test]
    fn register_indexes_agents() {
        let registry = ConnectionRegistry::default();
        let (conn, _rx) = agent("c1", "a1");
        registry.register(conn).unwrap();

        assert!(registry.is_agent_online("a1"));
        assert_eq!(registry.get_agent_connection("a1").unwrap().id, "c1");
        assert_eq!(registry.get_connection("c1").unwrap().agent_id.as_deref(), Some("a1"));
        assert_eq!(registry.list_agents().len(), 1);
        assert!(registry.list_dashboards(None).is_empty());
    }

    #[test]
    fn agent_without_id_is_rejected() {
        let registry = ConnectionRegistry::default();
        let (tx, _rx) = mpsc::channel(8);
        let conn = Arc::new(Connection::new("c1", PeerRole::Agent, None, None, tx));
        assert!(matches!(registry.register(conn), Err(HubError::Handshake(_))));
    }

    #[test]
    fn reconnect_evicts_previous_connection() {
        let registry = ConnectionRegistry::default();
        let mut events = registry.subscribe();
        let (old, _rx1) = agent("c1", "a1");
        let (new, _rx2) = agent("c2", "a1");

        registry.register(old.clone()).unwrap();
        let evicted = registry.register(new).unwrap().unwrap();

        assert_eq!(evicted.id, "c1");
        assert!(old.is_closed());
        assert!(registry.get_connection("c1").is_none());
        assert_eq!(registry.get_agent_connection("a1").unwrap().id, "c2");
        assert_eq!(registry.connection_count(), 1);

        // Registered(c1), Registered(c2), Replaced
        let _ = events.try_recv().unwrap();
        let _ = events.try_recv().unwrap();
        assert!(matches!(
            events.try_recv().unwrap(),
            ConnectionEvent::Replaced { ref old_connection_id, .. } if old_connection_id == "c1"
        ));

        // Late close of the evicted socket must not unregister the new one
        assert!(registry.unregister("c1").is_none());
        assert!(registry.is_agent_online("a1"));
    }

    #[test]
    fn unregister_emits_disconnect() {
        let registry = ConnectionRegistry::default();
        let (conn, _rx) = agent("c1", "a1");
        registry.register(conn.clone()).unwrap();
        let mut events = registry.subscribe();

        let removed = registry.unregister("c1").unwrap();
        assert_eq!(removed.id, "c1");
        assert!(conn.is_closed());
        assert!(!registry.is_agent_online("a1"));
        assert_eq!(
            events.try_recv().unwrap(),
            ConnectionEvent::Disconnected {
                connection_id: "c1".into(),
                role: PeerRole::Agent,
                agent_id: Some("a1".into()),
                user_id: None,
            }
        );

        assert!(registry.unregister("c1").is_none());
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn list_dashboards_by_user() {
        let registry = ConnectionRegistry::default();
        let (d1, _r1) = dashboard("d1", Some("alice"));
        let (d2, _r2) = dashboard("d2", Some("bob"));
        let (d3, _r3) = dashboard("d3", Some("alice"));
        for d in [d1, d2, d3] {
            registry.register(d).unwrap();
        }

        assert_eq!(registry.list_dashboards(None).len(), 3);
        let alice: Vec<String> = registry
            .list_dashboards(Some("alice"))
            .into_iter()
            .map(|c| c.id.clone())
            .collect();
        assert_eq!(alice, vec!["d1", "d3"]);
    }

    #[tokio::test]
    async fn send_is_best_effort() {
        let registry = ConnectionRegistry::default();
        let (conn, mut rx) = agent("c1", "a1");
        registry.register(conn).unwrap();

        assert!(registry.send("c1", message()));
        assert!(rx.recv().await.is_some());
        assert!(registry.send_to_agent("a1", message()));

        assert!(!registry.send("missing", message()));
        assert!(!registry.send_to_agent("nobody", message()));

        drop(rx);
        assert!(!registry.send("c1", message()));
    }
}
