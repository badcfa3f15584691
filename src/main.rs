mod command;
mod config;
mod connection;
mod transport;

use anyhow::Result;
use command::CommandExecutor;
use config::AgentConfig;
use connection::{ConnectionEvent, ConnectionManager};
use std::sync::Arc;
use switchyard_shared::{
    AgentControl, CommandCancel, CommandRequest, ControlAction, Envelope, ErrorPayload, Heartbeat,
    MessageType, TokenRefresh,
};
use tokio::sync::watch;
use transport::TcpConnector;

use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let config = AgentConfig::from_env();
    info!("Agent starting: {}", config.agent_id);
    info!("  hub: {}", config.hub_addr);

    let (status_tx, status_rx) = watch::channel(Heartbeat::default());
    let connector = TcpConnector::new(config.hub_addr.clone());
    let mut conn = ConnectionManager::new(config.clone(), connector, status_rx);
    let executor = CommandExecutor::new(config.shell.clone(), conn.get_sender(), status_tx);

    loop {
        let event = tokio::select! {
            event = conn.recv() => event,
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                executor.stop_all("agent shutting down");
                break;
            }
        };
        match event {
            Some(ConnectionEvent::Connected { connection_id }) => {
                info!(connection_id = %connection_id, agent_id = %conn.agent_id(), "connected to hub");
            }
            Some(ConnectionEvent::Disconnected { reason }) => {
                warn!("Disconnected: {}", reason);
            }
            Some(ConnectionEvent::ConnectionFailed { reason }) => {
                error!("Connection failed: {}", reason);
            }
            Some(ConnectionEvent::Received(envelope)) => {
                if let Err(e) = handle_hub_message(&envelope, &conn, &executor) {
                    warn!(msg_type = ?envelope.msg_type, error = %e, "failed to handle hub message");
                }
            }
            None => {
                error!("Connection manager closed");
                break;
            }
        }
    }
}

fn handle_hub_message(
    envelope: &Envelope,
    conn: &ConnectionManager,
    executor: &Arc<CommandExecutor>,
) -> Result<()> {
    debug!(id = %envelope.id, msg_type = ?envelope.msg_type, "received from hub");

    match envelope.msg_type {
        MessageType::CommandRequest => {
            let request: CommandRequest = envelope.decode_payload()?;
            executor.start(request);
        }
        MessageType::CommandCancel => {
            let cancel: CommandCancel = envelope.decode_payload()?;
            executor.stop(&cancel.command_id, &cancel.reason);
        }
        MessageType::AgentControl => {
            let control: AgentControl = envelope.decode_payload()?;
            let reason = control.reason.as_deref().unwrap_or("interrupted");
            match (control.action, control.command_id.as_deref()) {
                (ControlAction::Interrupt, Some(command_id)) => {
                    executor.stop(command_id, reason);
                }
                (ControlAction::Interrupt, None) => {
                    executor.stop_all(reason);
                }
                (ControlAction::Restart, _) => {
                    let stopped = executor.stop_all("agent restarting");
                    info!(stopped, "restart requested by hub");
                    conn.request_reconnect();
                }
            }
        }
        MessageType::TokenRefresh => {
            let refresh: TokenRefresh = envelope.decode_payload()?;
            executor.set_token(refresh);
        }
        MessageType::Error => {
            let error: ErrorPayload = envelope.decode_payload()?;
            warn!(code = %error.code, "hub error: {}", error.message);
        }
        other => {
            debug!(msg_type = ?other, "unhandled message type");
        }
    }
    Ok(())
}
