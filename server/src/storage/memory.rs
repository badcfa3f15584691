//! In-process storage backend

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use switchyard_shared::{now_ms, CommandStatus};
use uuid::Uuid;

use super::Storage;
use crate::command::{AuditEvent, Command, NewCommand, StatusMeta};
use crate::error::StorageError;
use crate::queue::QueueEntry;

#[derive(Default)]
struct Tables {
    commands: HashMap<String, Command>,
    queue: HashMap<String, QueueEntry>,
    audit: Vec<AuditEvent>,
}

/// Keeps everything in memory; used by the default binary and tests
#[derive(Default)]
pub struct MemoryStorage {
    tables: Mutex<Tables>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn command(&self, command_id: &str) -> Option<Command> {
        self.tables.lock().commands.get(command_id).cloned()
    }

    pub fn queue_entry(&self, command_id: &str) -> Option<QueueEntry> {
        self.tables.lock().queue.get(command_id).cloned()
    }

    pub fn queue_len(&self) -> usize {
        self.tables.lock().queue.len()
    }

    pub fn audit_log(&self) -> Vec<AuditEvent> {
        self.tables.lock().audit.clone()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn create_command(&self, data: NewCommand) -> Result<Command, StorageError> {
        let command = Command {
            id: format!("cmd_{}", Uuid::now_v7().simple()),
            target_agent_id: data.target_agent_id,
            assigned_agent_id: None,
            priority: data.priority,
            status: CommandStatus::Queued,
            payload: data.payload,
            time_limit_ms: data.time_limit_ms,
            created_by: data.created_by,
            created_at: now_ms(),
            started_at: None,
            completed_at: None,
            reason: None,
            dispatch_attempts: 0,
        };
        self.tables
            .lock()
            .commands
            .insert(command.id.clone(), command.clone());
        Ok(command)
    }

    async fn update_command_status(
        &self,
        command_id: &str,
        status: CommandStatus,
        meta: &StatusMeta,
    ) -> Result<(), StorageError> {
        let mut tables = self.tables.lock();
        let cmd = tables
            .commands
            .get_mut(command_id)
            .ok_or_else(|| StorageError::NotFound(command_id.to_string()))?;
        cmd.status = status;
        if meta.agent_id.is_some() {
            cmd.assigned_agent_id = meta.agent_id.clone();
        }
        cmd.reason = meta.reason.clone();
        cmd.started_at = meta.started_at.or(cmd.started_at);
        cmd.completed_at = meta.completed_at.or(cmd.completed_at);
        Ok(())
    }

    async fn persist_queue_entry(&self, entry: &QueueEntry) -> Result<(), StorageError> {
        self.tables
            .lock()
            .queue
            .insert(entry.command_id.clone(), entry.clone());
        Ok(())
    }

    async fn remove_queue_entry(&self, command_id: &str) -> Result<(), StorageError> {
        self.tables.lock().queue.remove(command_id);
        Ok(())
    }

    async fn append_audit_log(&self, event: &AuditEvent) -> Result<(), StorageError> {
        self.tables.lock().audit.push(event.clone());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueScope;
    use serde_json::json;

    #[tokio::test]
    async fn create_assigns_unique_ids() {
        let storage = MemoryStorage::new();
        let a = storage
            .create_command(NewCommand::new(Some("a1"), 50, json!({})))
            .await
            .unwrap();
        let b = storage
            .create_command(NewCommand::new(None, 10, json!({})))
            .await
            .unwrap();

        assert_ne!(a.id, b.id);
        assert!(a.id.starts_with("cmd_"));
        assert_eq!(a.status, CommandStatus::Queued);
        assert_eq!(storage.command(&b.id).unwrap().priority, 10);
    }

    #[tokio::test]
    async fn status_update_of_unknown_command_fails() {
        let storage = MemoryStorage::new();
        let err = storage
            .update_command_status("nope", CommandStatus::Failed, &StatusMeta::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn queue_entries_upsert_and_remove() {
        let storage = MemoryStorage::new();
        let mut entry = QueueEntry {
            entry_id: 1,
            command_id: "cmd-1".into(),
            scope: QueueScope::Global,
            priority: 10,
            enqueued_at: 1,
            position: 1,
        };
        storage.persist_queue_entry(&entry).await.unwrap();
        entry.priority = 90;
        storage.persist_queue_entry(&entry).await.unwrap();

        assert_eq!(storage.queue_len(), 1);
        assert_eq!(storage.queue_entry("cmd-1").unwrap().priority, 90);

        storage.remove_queue_entry("cmd-1").await.unwrap();
        storage.remove_queue_entry("cmd-1").await.unwrap();
        assert_eq!(storage.queue_len(), 0);
    }
}
