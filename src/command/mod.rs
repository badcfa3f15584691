//! Command execution for the agent
//!
//! This module handles:
//! - Running `COMMAND_REQUEST` payloads as local shell processes
//! - Streaming stdout/stderr back as `TERMINAL_OUTPUT`
//! - Stopping children on cancel or interrupt
//! - Tracking running commands for heartbeats

mod executor;

pub use executor::CommandExecutor;
