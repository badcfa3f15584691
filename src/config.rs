//! Agent configuration
//!
//! Defaults, then `SWITCHYARD_*` environment overrides.

use std::time::Duration;

use switchyard_shared::defaults;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Identity announced in CONNECT
    pub agent_id: String,
    /// Hub TCP address
    pub hub_addr: String,
    pub heartbeat_interval: Duration,
    /// Reconnection delay (initial)
    pub reconnect_delay: Duration,
    /// Maximum reconnection delay
    pub max_reconnect_delay: Duration,
    /// Bounds both the TCP connect and the CONNECT_ACK wait
    pub connect_timeout: Duration,
    /// Shell used to run `payload.command`
    pub shell: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_id: "agent-001".into(),
            hub_addr: "127.0.0.1:8080".into(),
            heartbeat_interval: Duration::from_millis(defaults::HEARTBEAT_INTERVAL_MS),
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            shell: "/bin/sh".into(),
        }
    }
}

impl AgentConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(id) = std::env::var("SWITCHYARD_AGENT_ID") {
            config.agent_id = id;
        }
        if let Ok(addr) = std::env::var("SWITCHYARD_HUB_ADDR") {
            config.hub_addr = addr;
        }
        if let Ok(shell) = std::env::var("SWITCHYARD_SHELL") {
            config.shell = shell;
        }
        if let Some(ms) = env_u64("SWITCHYARD_HEARTBEAT_INTERVAL_MS") {
            config.heartbeat_interval = Duration::from_millis(ms.max(1));
        }
        if let Some(ms) = env_u64("SWITCHYARD_MAX_RECONNECT_DELAY_MS") {
            config.max_reconnect_delay = Duration::from_millis(ms);
        }
        config
    }
}

fn env_u64(key: &str) -> Option<u64> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring non-numeric env override");
            None
        }
    }
}
