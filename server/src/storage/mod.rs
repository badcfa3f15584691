//! Persistence seam
//!
//! The hub keeps authoritative state in memory and mirrors it through a
//! [`Storage`] implementation. Only command creation is awaited inline;
//! every other write goes through the ordered [`PersistenceWriter`].

mod memory;
mod writer;

use async_trait::async_trait;
use switchyard_shared::CommandStatus;

pub use memory::MemoryStorage;
pub use writer::{PersistOp, PersistenceWriter};

use crate::command::{AuditEvent, Command, NewCommand, StatusMeta};
use crate::error::StorageError;
use crate::queue::QueueEntry;

/// Backing store for commands, queue entries and the audit trail
#[async_trait]
pub trait Storage: Send + Sync {
    /// Persist a new command and assign its id; the result is QUEUED
    async fn create_command(&self, data: NewCommand) -> Result<Command, StorageError>;

    async fn update_command_status(
        &self,
        command_id: &str,
        status: CommandStatus,
        meta: &StatusMeta,
    ) -> Result<(), StorageError>;

    async fn persist_queue_entry(&self, entry: &QueueEntry) -> Result<(), StorageError>;

    async fn remove_queue_entry(&self, command_id: &str) -> Result<(), StorageError>;

    async fn append_audit_log(&self, event: &AuditEvent) -> Result<(), StorageError>;

    /// Human-readable backend name for logs
    fn name(&self) -> &'static str;
}
