//! Persistent link to the hub
//!
//! This module handles:
//! - The CONNECT / CONNECT_ACK handshake
//! - Automatic reconnection with exponential backoff
//! - Heartbeats carrying the ids of running commands
//! - Bidirectional envelope streaming

mod manager;

pub use manager::{ConnectionEvent, ConnectionManager};
