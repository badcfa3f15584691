//! Switchyard Shared Protocol Types
//!
//! This crate provides the wire envelope, payload types, codec and status
//! state machine shared by the hub, agents and dashboards.

pub mod codec;
pub mod protocol;
pub mod state_machine;

use std::time::{SystemTime, UNIX_EPOCH};

pub use protocol::*;
pub use state_machine::{AgentStatus, CommandStatus};

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Default tunables for the hub and agents
pub mod defaults {
    /// Interval at which agents send heartbeats
    pub const HEARTBEAT_INTERVAL_MS: u64 = 5_000;

    /// Agent is considered dead if no heartbeat arrives within this window
    pub const HEARTBEAT_TIMEOUT_MS: u64 = 30_000;

    /// Execution time limit applied when a command carries none
    pub const DEFAULT_TIME_LIMIT_MS: u64 = 10 * 60 * 1000;

    /// Concurrent RUNNING commands allowed per agent
    pub const MAX_CONCURRENT_PER_AGENT: usize = 1;

    /// Periodic flush interval for batched output
    pub const BATCH_FLUSH_INTERVAL_MS: u64 = 50;

    /// A batch is flushed immediately once it holds this many messages
    pub const BATCH_MAX_SIZE: usize = 100;

    /// How long an interrupt waits for natural completion
    pub const INTERRUPT_TIMEOUT_MS: u64 = 5_000;

    /// How long a cancel waits for the agent's acknowledgement
    pub const CANCEL_GRACE_MS: u64 = 5_000;

    /// Dispatch attempts before a command is marked FAILED
    pub const DISPATCH_MAX_ATTEMPTS: u32 = 5;

    /// First dispatch retry delay, doubled on every attempt
    pub const DISPATCH_INITIAL_BACKOFF_MS: u64 = 250;

    /// Upper bound for the dispatch retry delay
    pub const DISPATCH_MAX_BACKOFF_MS: u64 = 10_000;

    /// Outbound messages buffered per connection before sends fail
    pub const OUTBOUND_BUFFER: usize = 256;

    /// Lowest and highest command priority
    pub const PRIORITY_MIN: u8 = 0;
    pub const PRIORITY_MAX: u8 = 100;

    /// Priority used when a submitter does not specify one
    pub const PRIORITY_DEFAULT: u8 = 50;
}
