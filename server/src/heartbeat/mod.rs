//! Agent liveness tracking

mod monitor;

pub use monitor::{AgentSnapshot, HeartbeatMonitor};
