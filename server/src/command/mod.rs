//! Command lifecycle for the hub
//!
//! This module handles:
//! - Command records and completion outcomes
//! - Dispatch to agents with per-agent concurrency limits
//! - Execution timeouts, cancel and interrupt with grace periods
//! - Cascading cancellation when an agent disconnects

mod execution;
mod model;
mod orchestrator;

pub use execution::{ActiveExecution, PendingSignal};
pub use model::{AuditEvent, Command, CommandOutcome, NewCommand, StatusMeta};
pub use orchestrator::{CommandOrchestrator, OrchestratorEvent};
