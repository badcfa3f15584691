//! Live peer connection handle

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use switchyard_shared::{Envelope, PeerRole};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Outbound half of a connection: the writer task drains this channel
pub type Outbound = mpsc::Sender<Arc<Envelope>>;

/// A registered agent or dashboard connection
///
/// Cloned as `Arc<Connection>`; the registry owns the authoritative copy.
pub struct Connection {
    pub id: String,
    pub role: PeerRole,
    pub agent_id: Option<String>,
    pub user_id: Option<String>,
    tx: Outbound,
    /// Cancelled when the hub drops this connection (eviction, heartbeat expiry)
    closed: CancellationToken,
    pub connected_at: Instant,
    last_activity: Mutex<Instant>,
    dropped_messages: AtomicU64,
}

impl Connection {
    pub fn new(
        id: impl Into<String>,
        role: PeerRole,
        agent_id: Option<String>,
        user_id: Option<String>,
        tx: Outbound,
    ) -> Self {
        let now = Instant::now();
        Self {
            id: id.into(),
            role,
            agent_id,
            user_id,
            tx,
            closed: CancellationToken::new(),
            connected_at: now,
            last_activity: Mutex::new(now),
            dropped_messages: AtomicU64::new(0),
        }
    }

    pub fn agent(id: impl Into<String>, agent_id: impl Into<String>, tx: Outbound) -> Self {
        Self::new(id, PeerRole::Agent, Some(agent_id.into()), None, tx)
    }

    pub fn dashboard(id: impl Into<String>, user_id: Option<String>, tx: Outbound) -> Self {
        Self::new(id, PeerRole::Dashboard, None, user_id, tx)
    }

    /// Queue a message for the writer task
    ///
    /// Returns `false` if the channel is full or closed, and increments
    /// the dropped message counter.
    pub fn send(&self, message: Arc<Envelope>) -> bool {
        if self.closed.is_cancelled() {
            self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        if self.tx.try_send(message).is_ok() {
            true
        } else {
            self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Record inbound activity
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Ask the IO task to drop the socket
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Token the IO task selects on to learn it has been dropped
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("agent_id", &self.agent_id)
            .field("user_id", &self.user_id)
            .finish()
    }
}
