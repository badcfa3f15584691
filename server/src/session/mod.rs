//! Session management for connected agents and dashboards
//!
//! This module handles:
//! - The registry of live connections and agent id indexing
//! - Per-connection outbound buffering
//! - Framed socket IO for a single peer

mod connection;
mod peer;
mod registry;

pub use connection::{Connection, Outbound};
pub use peer::{spawn_writer, PeerSession};
pub use registry::{ConnectionEvent, ConnectionRegistry};
