//! Pending command queues, one per agent plus the global pool

mod priority;

pub use priority::{validate_priority, PriorityCommandQueue, QueueEntry, QueueScope};
