//! Fan-out of one message to many connections

use std::sync::Arc;

use serde::Serialize;
use switchyard_shared::Envelope;
use tracing::{debug, warn};

use crate::session::ConnectionRegistry;

/// Aggregate outcome of a fan-out send
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastResult {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub failed_connection_ids: Vec<String>,
}

impl BroadcastResult {
    fn record(&mut self, id: &str, sent: bool) {
        self.total += 1;
        if sent {
            self.successful += 1;
        } else {
            self.failed += 1;
            self.failed_connection_ids.push(id.to_string());
        }
    }

    pub fn all_delivered(&self) -> bool {
        self.failed == 0
    }
}

/// Sends messages to sets of connections through the registry
///
/// Individual send failures are reported in the [`BroadcastResult`], never
/// raised.
pub struct MessageBroadcaster {
    registry: Arc<ConnectionRegistry>,
}

impl MessageBroadcaster {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Send to every listed connection id except those in `exclude`
    pub fn broadcast_to<I, S>(&self, connection_ids: I, message: &Envelope, exclude: &[&str]) -> BroadcastResult
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let message = Arc::new(message.clone());
        let mut result = BroadcastResult::default();

        for id in connection_ids {
            let id = id.as_ref();
            if exclude.contains(&id) {
                continue;
            }
            let sent = self.registry.send(id, message.clone());
            result.record(id, sent);
        }

        if result.failed > 0 {
            warn!(
                msg_type = ?message.msg_type,
                total = result.total,
                failed = result.failed,
                failed_ids = ?result.failed_connection_ids,
                "broadcast partially failed"
            );
        } else {
            debug!(msg_type = ?message.msg_type, recipients = result.total, "broadcast delivered");
        }
        result
    }

    pub fn broadcast_to_dashboards(&self, message: &Envelope, exclude: &[&str]) -> BroadcastResult {
        let ids: Vec<String> = self
            .registry
            .list_dashboards(None)
            .iter()
            .map(|c| c.id.clone())
            .collect();
        self.broadcast_to(ids, message, exclude)
    }

    pub fn broadcast_to_agents(&self, message: &Envelope, exclude: &[&str]) -> BroadcastResult {
        let ids: Vec<String> = self
            .registry
            .list_agents()
            .iter()
            .map(|c| c.id.clone())
            .collect();
        self.broadcast_to(ids, message, exclude)
    }

    pub fn broadcast_to_user(&self, user_id: &str, message: &Envelope) -> BroadcastResult {
        let ids: Vec<String> = self
            .registry
            .list_dashboards(Some(user_id))
            .iter()
            .map(|c| c.id.clone())
            .collect();
        self.broadcast_to(ids, message, &[])
    }

    /// Send to one agent; an offline agent is reported as a failed target
    /// under its agent id.
    pub fn send_to_agent(&self, agent_id: &str, message: &Envelope) -> BroadcastResult {
        match self.registry.get_agent_connection(agent_id) {
            Some(conn) => self.broadcast_to([conn.id.as_str()], message, &[]),
            None => {
                debug!(agent_id, msg_type = ?message.msg_type, "agent not connected");
                let mut result = BroadcastResult::default();
                result.record(agent_id, false);
                result
            }
        }
    }
}
