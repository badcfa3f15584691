//! Switchyard hub
//!
//! Brokers commands between dashboards and remote agents: a per-agent
//! priority queue, dispatch with concurrency limits, cancel and interrupt
//! with grace periods, heartbeat liveness, and batched fan-out of agent
//! output to every dashboard.

pub mod broadcast;
pub mod command;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod hub;
pub mod listener;
pub mod queue;
pub mod session;
pub mod storage;
pub mod timer;

pub use config::HubConfig;
pub use error::{HubError, Result, StorageError};
pub use hub::Hub;
