//! Per-scope priority queue of pending commands
//!
//! Within a scope entries are ordered by (priority desc, enqueued_at asc),
//! with insertion order breaking exact ties. Every mutation re-sorts the
//! owning scope and reassigns positions 1..N.

use std::cmp::Ordering;
use std::collections::HashMap;

use parking_lot::Mutex;
use switchyard_shared::{defaults, now_ms, QueueEntryView};

use crate::error::{HubError, Result};

/// Which pending list a command waits in
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueueScope {
    /// Any agent may take it
    Global,
    Agent(String),
}

impl QueueScope {
    pub fn agent(agent_id: impl Into<String>) -> Self {
        QueueScope::Agent(agent_id.into())
    }

    pub fn from_target(target_agent_id: Option<&str>) -> Self {
        match target_agent_id {
            Some(id) => QueueScope::Agent(id.to_string()),
            None => QueueScope::Global,
        }
    }

    pub fn agent_id(&self) -> Option<&str> {
        match self {
            QueueScope::Global => None,
            QueueScope::Agent(id) => Some(id),
        }
    }
}

impl std::fmt::Display for QueueScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueScope::Global => write!(f, "global"),
            QueueScope::Agent(id) => write!(f, "agent:{id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub entry_id: u64,
    pub command_id: String,
    pub scope: QueueScope,
    pub priority: u8,
    pub enqueued_at: u64,
    /// 1-based rank within the scope
    pub position: usize,
}

impl QueueEntry {
    pub fn view(&self) -> QueueEntryView {
        QueueEntryView {
            command_id: self.command_id.clone(),
            priority: self.priority,
            position: self.position,
            enqueued_at: self.enqueued_at,
        }
    }
}

fn rank(a: &QueueEntry, b: &QueueEntry) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then(a.enqueued_at.cmp(&b.enqueued_at))
        .then(a.entry_id.cmp(&b.entry_id))
}

#[derive(Default)]
struct QueueState {
    scopes: HashMap<QueueScope, Vec<QueueEntry>>,
    /// entry_id -> owning scope
    entries: HashMap<u64, QueueScope>,
    /// command_id -> entry_id
    commands: HashMap<String, u64>,
    next_entry_id: u64,
}

impl QueueState {
    fn reorder(&mut self, scope: &QueueScope) {
        let Some(list) = self.scopes.get_mut(scope) else {
            return;
        };
        if list.is_empty() {
            self.scopes.remove(scope);
            return;
        }
        list.sort_by(rank);
        for (i, entry) in list.iter_mut().enumerate() {
            entry.position = i + 1;
        }
    }

    fn find(&self, entry_id: u64) -> Option<(&QueueScope, usize)> {
        let scope = self.entries.get(&entry_id)?;
        let idx = self.scopes.get(scope)?.iter().position(|e| e.entry_id == entry_id)?;
        Some((scope, idx))
    }

    fn take(&mut self, entry_id: u64) -> Option<QueueEntry> {
        let (scope, idx) = self.find(entry_id).map(|(s, i)| (s.clone(), i))?;
        let entry = self.scopes.get_mut(&scope)?.remove(idx);
        self.entries.remove(&entry_id);
        self.commands.remove(&entry.command_id);
        self.reorder(&scope);
        Some(entry)
    }
}

/// Thread-safe priority queue; every operation is atomic
#[derive(Default)]
pub struct PriorityCommandQueue {
    state: Mutex<QueueState>,
}

pub fn validate_priority(priority: u16) -> Result<u8> {
    if priority > u16::from(defaults::PRIORITY_MAX) {
        return Err(HubError::InvalidPriority(priority));
    }
    Ok(priority as u8)
}

impl PriorityCommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a command; `enqueued_at` defaults to now
    pub fn enqueue(
        &self,
        command_id: &str,
        scope: QueueScope,
        priority: u8,
        enqueued_at: Option<u64>,
    ) -> Result<QueueEntry> {
        validate_priority(u16::from(priority))?;

        let mut state = self.state.lock();
        if state.commands.contains_key(command_id) {
            return Err(HubError::DuplicateQueueEntry(command_id.to_string()));
        }

        state.next_entry_id += 1;
        let entry_id = state.next_entry_id;
        let entry = QueueEntry {
            entry_id,
            command_id: command_id.to_string(),
            scope: scope.clone(),
            priority,
            enqueued_at: enqueued_at.unwrap_or_else(now_ms),
            position: 0,
        };

        state.scopes.entry(scope.clone()).or_default().push(entry);
        state.entries.insert(entry_id, scope.clone());
        state.commands.insert(command_id.to_string(), entry_id);
        state.reorder(&scope);

        let (scope, idx) = state
            .find(entry_id)
            .ok_or_else(|| HubError::QueueEntryNotFound(command_id.to_string()))?;
        Ok(state.scopes[scope][idx].clone())
    }

    /// Remove and return the top-ranked entry of a scope
    pub fn dequeue(&self, scope: &QueueScope) -> Option<QueueEntry> {
        let mut state = self.state.lock();
        let entry_id = state.scopes.get(scope)?.first()?.entry_id;
        state.take(entry_id)
    }

    /// Top-ranked entry of a scope without removing it
    pub fn peek(&self, scope: &QueueScope) -> Option<QueueEntry> {
        self.state.lock().scopes.get(scope)?.first().cloned()
    }

    pub fn update_priority(&self, entry_id: u64, new_priority: u8) -> Result<QueueEntry> {
        validate_priority(u16::from(new_priority))?;

        let mut state = self.state.lock();
        let (scope, idx) = state
            .find(entry_id)
            .map(|(s, i)| (s.clone(), i))
            .ok_or_else(|| HubError::QueueEntryNotFound(entry_id.to_string()))?;

        if let Some(list) = state.scopes.get_mut(&scope) {
            list[idx].priority = new_priority;
        }
        state.reorder(&scope);

        let (scope, idx) = state
            .find(entry_id)
            .ok_or_else(|| HubError::QueueEntryNotFound(entry_id.to_string()))?;
        Ok(state.scopes[scope][idx].clone())
    }

    pub fn remove(&self, entry_id: u64) -> Result<QueueEntry> {
        self.state
            .lock()
            .take(entry_id)
            .ok_or_else(|| HubError::QueueEntryNotFound(entry_id.to_string()))
    }

    pub fn remove_command(&self, command_id: &str) -> Option<QueueEntry> {
        let mut state = self.state.lock();
        let entry_id = *state.commands.get(command_id)?;
        state.take(entry_id)
    }

    pub fn entry_for_command(&self, command_id: &str) -> Option<QueueEntry> {
        let state = self.state.lock();
        let entry_id = *state.commands.get(command_id)?;
        let (scope, idx) = state.find(entry_id)?;
        Some(state.scopes[scope][idx].clone())
    }

    /// 1 + number of entries in the same scope ranked ahead of this command
    pub fn get_position(&self, command_id: &str) -> Option<usize> {
        let state = self.state.lock();
        let entry_id = *state.commands.get(command_id)?;
        let (scope, idx) = state.find(entry_id)?;
        let list = &state.scopes[scope];
        let target = &list[idx];
        let ahead = list
            .iter()
            .filter(|e| {
                e.priority > target.priority
                    || (e.priority == target.priority && e.enqueued_at < target.enqueued_at)
                    || (e.priority == target.priority
                        && e.enqueued_at == target.enqueued_at
                        && e.entry_id < target.entry_id)
            })
            .count();
        Some(ahead + 1)
    }

    /// Snapshot of a scope in rank order
    pub fn entries(&self, scope: &QueueScope) -> Vec<QueueEntry> {
        self.state
            .lock()
            .scopes
            .get(scope)
            .cloned()
            .unwrap_or_default()
    }

    pub fn len(&self, scope: &QueueScope) -> usize {
        self.state.lock().scopes.get(scope).map_or(0, Vec::len)
    }

    pub fn total_len(&self) -> usize {
        self.state.lock().commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total_len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn x() -> QueueScope {
        QueueScope::agent("X")
    }

    fn assert_invariants(queue: &PriorityCommandQueue, scope: &QueueScope) {
        let entries = queue.entries(scope);
        for (i, e) in entries.iter().enumerate() {
            assert_eq!(e.position, i + 1, "positions must be contiguous");
            assert_eq!(queue.get_position(&e.command_id), Some(i + 1));
        }
        for pair in entries.windows(2) {
            assert_ne!(rank(&pair[0], &pair[1]), Ordering::Greater);
        }
    }

    #[test]
    fn scenario_priority_order() {
        let queue = PriorityCommandQueue::new();
        queue.enqueue("A", x(), 30, Some(1)).unwrap();
        queue.enqueue("B", x(), 90, Some(2)).unwrap();
        queue.enqueue("C", x(), 60, Some(3)).unwrap();
        assert_invariants(&queue, &x());

        let order: Vec<String> = std::iter::from_fn(|| queue.dequeue(&x()))
            .map(|e| e.command_id)
            .collect();
        assert_eq!(order, vec!["B", "C", "A"]);
    }

    #[test]
    fn scenario_fifo_within_priority() {
        let queue = PriorityCommandQueue::new();
        queue.enqueue("late", x(), 50, Some(200)).unwrap();
        queue.enqueue("early", x(), 50, Some(100)).unwrap();

        assert_eq!(queue.dequeue(&x()).unwrap().command_id, "early");
        assert_eq!(queue.dequeue(&x()).unwrap().command_id, "late");
        assert!(queue.dequeue(&x()).is_none());
    }

    #[test]
    fn identical_timestamps_keep_insertion_order() {
        let queue = PriorityCommandQueue::new();
        for id in ["one", "two", "three"] {
            queue.enqueue(id, x(), 10, Some(5)).unwrap();
        }
        assert_eq!(queue.dequeue(&x()).unwrap().command_id, "one");
        assert_eq!(queue.dequeue(&x()).unwrap().command_id, "two");
    }

    #[test]
    fn peek_matches_dequeue() {
        let queue = PriorityCommandQueue::new();
        queue.enqueue("A", x(), 10, None).unwrap();
        queue.enqueue("B", x(), 80, None).unwrap();

        let peeked = queue.peek(&x()).unwrap();
        assert_eq!(queue.len(&x()), 2);
        let dequeued = queue.dequeue(&x()).unwrap();
        assert_eq!(peeked.command_id, dequeued.command_id);
        assert_eq!(dequeued.position, 1);
    }

    #[test]
    fn scopes_are_isolated() {
        let queue = PriorityCommandQueue::new();
        queue.enqueue("g1", QueueScope::Global, 10, None).unwrap();
        queue.enqueue("x1", x(), 99, None).unwrap();
        queue.enqueue("y1", QueueScope::agent("Y"), 50, None).unwrap();

        assert_eq!(queue.get_position("g1"), Some(1));
        assert_eq!(queue.get_position("x1"), Some(1));
        assert_eq!(queue.dequeue(&QueueScope::Global).unwrap().command_id, "g1");
        assert!(queue.peek(&QueueScope::Global).is_none());
        assert_eq!(queue.total_len(), 2);
    }

    #[test]
    fn update_priority_reorders() {
        let queue = PriorityCommandQueue::new();
        queue.enqueue("A", x(), 10, Some(1)).unwrap();
        let b = queue.enqueue("B", x(), 20, Some(2)).unwrap();
        let c = queue.enqueue("C", x(), 30, Some(3)).unwrap();
        assert_eq!(queue.get_position("A"), Some(3));

        let moved = queue.update_priority(b.entry_id, 100).unwrap();
        assert_eq!(moved.position, 1);
        assert_invariants(&queue, &x());

        queue.update_priority(c.entry_id, 0).unwrap();
        assert_eq!(queue.get_position("C"), Some(3));
        assert_invariants(&queue, &x());
    }

    #[test]
    fn remove_closes_position_gap() {
        let queue = PriorityCommandQueue::new();
        queue.enqueue("A", x(), 90, Some(1)).unwrap();
        let b = queue.enqueue("B", x(), 50, Some(2)).unwrap();
        queue.enqueue("C", x(), 10, Some(3)).unwrap();

        let removed = queue.remove(b.entry_id).unwrap();
        assert_eq!(removed.command_id, "B");
        assert_eq!(queue.get_position("C"), Some(2));
        assert_invariants(&queue, &x());

        assert!(matches!(
            queue.remove(b.entry_id),
            Err(HubError::QueueEntryNotFound(_))
        ));
        assert!(queue.remove_command("B").is_none());
        assert_eq!(queue.remove_command("A").unwrap().command_id, "A");
        assert_eq!(queue.get_position("C"), Some(1));
    }

    #[test]
    fn rejects_bad_input() {
        let queue = PriorityCommandQueue::new();
        assert!(matches!(
            queue.enqueue("A", x(), 101, None),
            Err(HubError::InvalidPriority(101))
        ));
        queue.enqueue("A", x(), 100, None).unwrap();
        assert!(matches!(
            queue.enqueue("A", QueueScope::Global, 5, None),
            Err(HubError::DuplicateQueueEntry(_))
        ));
        assert!(matches!(
            queue.update_priority(999, 5),
            Err(HubError::QueueEntryNotFound(_))
        ));
        assert!(queue.get_position("missing").is_none());
    }

    #[test]
    fn invariants_hold_under_mixed_mutation() {
        let queue = PriorityCommandQueue::new();
        let mut ids = Vec::new();
        for i in 0..40u64 {
            let priority = ((i * 37) % 101) as u8;
            let entry = queue
                .enqueue(&format!("cmd-{i}"), x(), priority, Some(i % 7))
                .unwrap();
            ids.push(entry.entry_id);
            assert_invariants(&queue, &x());
        }
        for (n, id) in ids.iter().enumerate() {
            match n % 3 {
                // Earlier dequeues may already have taken this entry
                0 => {
                    let _ = queue.remove(*id);
                }
                1 => {
                    let _ = queue.update_priority(*id, (n % 101) as u8);
                }
                _ => {
                    queue.dequeue(&x());
                }
            }
            assert_invariants(&queue, &x());
        }
    }

    #[test]
    fn concurrent_enqueue_dequeue_keeps_invariants() {
        use std::sync::Arc;

        let queue = Arc::new(PriorityCommandQueue::new());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        queue
                            .enqueue(&format!("t{t}-{i}"), x(), ((t * 13 + i) % 100) as u8, None)
                            .unwrap();
                        if i % 2 == 0 {
                            queue.dequeue(&x());
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(queue.len(&x()), 100);
        assert_invariants(&queue, &x());
    }
}
