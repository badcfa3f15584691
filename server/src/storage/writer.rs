//! Ordered background persistence
//!
//! State changes are applied in memory first, then queued here. A single
//! worker applies them in submission order, retrying failed writes with
//! exponential backoff. A write that exhausts its retries is logged and
//! skipped; in-memory state stays authoritative.

use std::sync::Arc;

use switchyard_shared::CommandStatus;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::Storage;
use crate::command::{AuditEvent, StatusMeta};
use crate::config::RetryPolicy;
use crate::error::StorageError;
use crate::queue::QueueEntry;

#[derive(Debug, Clone)]
pub enum PersistOp {
    Status {
        command_id: String,
        status: CommandStatus,
        meta: StatusMeta,
    },
    QueueEntry(QueueEntry),
    RemoveQueueEntry(String),
    Audit(AuditEvent),
}

impl PersistOp {
    fn label(&self) -> &'static str {
        match self {
            PersistOp::Status { .. } => "status",
            PersistOp::QueueEntry(_) => "queue_entry",
            PersistOp::RemoveQueueEntry(_) => "remove_queue_entry",
            PersistOp::Audit(_) => "audit",
        }
    }

    async fn apply(&self, storage: &dyn Storage) -> Result<(), StorageError> {
        match self {
            PersistOp::Status {
                command_id,
                status,
                meta,
            } => storage.update_command_status(command_id, *status, meta).await,
            PersistOp::QueueEntry(entry) => storage.persist_queue_entry(entry).await,
            PersistOp::RemoveQueueEntry(command_id) => storage.remove_queue_entry(command_id).await,
            PersistOp::Audit(event) => storage.append_audit_log(event).await,
        }
    }
}

enum Job {
    Write(PersistOp),
    Barrier(oneshot::Sender<()>),
}

/// Handle to the persistence worker
#[derive(Clone)]
pub struct PersistenceWriter {
    tx: mpsc::UnboundedSender<Job>,
}

impl PersistenceWriter {
    /// Start the worker; it exits once every handle is dropped
    pub fn spawn(storage: Arc<dyn Storage>, retry: RetryPolicy) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                match job {
                    Job::Write(op) => write_with_retry(storage.as_ref(), &op, &retry).await,
                    Job::Barrier(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!(backend = storage.name(), "persistence writer stopped");
        });
        (Self { tx }, handle)
    }

    /// Queue a write; never blocks
    pub fn submit(&self, op: PersistOp) {
        if self.tx.send(Job::Write(op)).is_err() {
            warn!("persistence writer is gone, dropping write");
        }
    }

    /// Resolves once every write submitted before this call has been attempted
    pub async fn sync(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Job::Barrier(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

async fn write_with_retry(storage: &dyn Storage, op: &PersistOp, retry: &RetryPolicy) {
    let max_attempts = retry.max_attempts.max(1);
    for attempt in 1..=max_attempts {
        match op.apply(storage).await {
            Ok(()) => return,
            Err(e) if attempt < max_attempts => {
                let delay = retry.backoff(attempt);
                warn!(
                    op = op.label(),
                    attempt,
                    error = %e,
                    "storage write failed, retrying in {:?}",
                    delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                error!(op = op.label(), attempts = attempt, error = %e, "giving up on storage write");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Command, NewCommand};
    use crate::storage::MemoryStorage;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    /// Fails the first `failures` writes, then records them
    struct Flaky {
        failures: Mutex<u32>,
        written: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Storage for Flaky {
        async fn create_command(&self, _data: NewCommand) -> Result<Command, StorageError> {
            Err(StorageError::Unavailable("not used".into()))
        }

        async fn update_command_status(
            &self,
            command_id: &str,
            _status: CommandStatus,
            _meta: &StatusMeta,
        ) -> Result<(), StorageError> {
            self.record(command_id)
        }

        async fn persist_queue_entry(&self, entry: &QueueEntry) -> Result<(), StorageError> {
            self.record(&entry.command_id)
        }

        async fn remove_queue_entry(&self, command_id: &str) -> Result<(), StorageError> {
            self.record(command_id)
        }

        async fn append_audit_log(&self, event: &AuditEvent) -> Result<(), StorageError> {
            self.record(&event.action)
        }

        fn name(&self) -> &'static str {
            "flaky"
        }
    }

    impl Flaky {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures: Mutex::new(failures),
                written: Mutex::new(Vec::new()),
            })
        }

        fn record(&self, what: &str) -> Result<(), StorageError> {
            let mut failures = self.failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(StorageError::Unavailable("flaky".into()));
            }
            self.written.lock().push(what.to_string());
            Ok(())
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff_ms: 10,
            max_backoff_ms: 100,
        }
    }

    fn remove(id: &str) -> PersistOp {
        PersistOp::RemoveQueueEntry(id.into())
    }

    #[tokio::test(start_paused = true)]
    async fn writes_apply_in_order() {
        let storage = Flaky::new(0);
        let (writer, _handle) = PersistenceWriter::spawn(storage.clone(), policy(3));
        for id in ["a", "b", "c"] {
            writer.submit(remove(id));
        }
        writer.sync().await;
        assert_eq!(*storage.written.lock(), vec!["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let storage = Flaky::new(2);
        let (writer, _handle) = PersistenceWriter::spawn(storage.clone(), policy(3));
        writer.submit(remove("a"));
        writer.submit(remove("b"));
        writer.sync().await;
        // "a" succeeded on its third attempt and still precedes "b"
        assert_eq!(*storage.written.lock(), vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_write_is_skipped() {
        let storage = Flaky::new(2);
        let (writer, _handle) = PersistenceWriter::spawn(storage.clone(), policy(2));
        writer.submit(remove("lost"));
        writer.submit(remove("kept"));
        writer.sync().await;
        assert_eq!(*storage.written.lock(), vec!["kept"]);
    }

    #[tokio::test]
    async fn audit_reaches_memory_storage() {
        let storage = Arc::new(MemoryStorage::new());
        let (writer, _handle) = PersistenceWriter::spawn(storage.clone(), policy(1));
        writer.submit(PersistOp::Audit(AuditEvent {
            action: "command.cancelled".into(),
            command_id: Some("cmd-1".into()),
            agent_id: None,
            actor: None,
            detail: json!({"reason": "user"}),
            timestamp: 1,
        }));
        writer.sync().await;
        assert_eq!(storage.audit_log()[0].action, "command.cancelled");
    }
}
