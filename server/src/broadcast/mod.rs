//! Fan-out messaging to dashboards and agents
//!
//! This module handles:
//! - Sending one message to many connections with per-target accounting
//! - Batching high-frequency command output per command id

mod batcher;
mod broadcaster;

pub use batcher::OutputBatcher;
pub use broadcaster::{BroadcastResult, MessageBroadcaster};
