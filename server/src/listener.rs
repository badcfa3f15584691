//! TCP front door: handshake and per-peer read loop

use std::sync::Arc;
use std::time::Duration;

use switchyard_shared::{Connect, Envelope, ErrorPayload, MessageType};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::HubError;
use crate::hub::Hub;
use crate::session::{spawn_writer, PeerSession};

/// A peer must send CONNECT within this window
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Accept connections until `shutdown` fires
pub async fn serve(hub: Arc<Hub>, listener: TcpListener, shutdown: CancellationToken) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "hub listening");
    loop {
        let (socket, addr) = tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted?,
        };
        if let Err(e) = socket.set_nodelay(true) {
            debug!(%addr, error = %e, "failed to set TCP_NODELAY");
        }
        let hub = hub.clone();
        tokio::spawn(async move {
            handle_peer(hub, socket, addr.to_string()).await;
        });
    }
    info!("listener stopped");
    Ok(())
}

/// Drive one peer from handshake to disconnect
pub async fn handle_peer<S>(hub: Arc<Hub>, stream: S, addr: String)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let mut session = PeerSession::new(reader, addr.clone());
    let (tx, rx) = mpsc::channel(hub.config().outbound_buffer.max(1));
    let closed = CancellationToken::new();
    let writer = spawn_writer(writer, rx, closed.clone(), addr.clone());

    let connection = match handshake(&hub, &mut session, tx.clone()).await {
        Ok(connection) => connection,
        Err(e) => {
            warn!(%addr, error = %e, "handshake failed");
            let payload = ErrorPayload {
                code: e.code().into(),
                message: e.to_string(),
                recoverable: false,
                command_id: None,
                agent_id: None,
            };
            if let Ok(env) = Envelope::new(MessageType::Error, &payload) {
                let _ = tx.send(Arc::new(env)).await;
            }
            drop(tx);
            let _ = writer.await;
            return;
        }
    };
    drop(tx);
    info!(%addr, connection_id = %connection.id, role = %connection.role, "peer connected");

    let hub_closed = connection.closed_token();
    loop {
        let frame = tokio::select! {
            () = hub_closed.cancelled() => {
                debug!(%addr, "connection dropped by hub");
                break;
            }
            frame = session.recv() => frame,
        };
        match frame {
            None => break,
            Some(Err(e)) => {
                warn!(%addr, error = %e, "undecodable frame, closing");
                break;
            }
            Some(Ok(envelope)) => {
                if let Err(e) = hub.handle_message(&connection.id, envelope).await {
                    debug!(%addr, error = %e, "request failed");
                    hub.report_error(&connection.id, &e);
                }
            }
        }
    }

    hub.disconnect(&connection.id);
    closed.cancel();
    let _ = writer.await;
    info!(%addr, connection_id = %connection.id, "peer disconnected");
}

async fn handshake<R>(
    hub: &Hub,
    session: &mut PeerSession<R>,
    tx: mpsc::Sender<Arc<Envelope>>,
) -> Result<Arc<crate::session::Connection>, HubError>
where
    R: AsyncRead + Unpin,
{
    let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, session.recv())
        .await
        .map_err(|_| HubError::Handshake("no CONNECT received".into()))?;
    let envelope = match first {
        Some(Ok(envelope)) => envelope,
        Some(Err(e)) => return Err(e.into()),
        None => return Err(HubError::Handshake("closed before CONNECT".into())),
    };
    if envelope.msg_type != MessageType::Connect {
        return Err(HubError::Handshake(format!(
            "expected CONNECT, got {:?}",
            envelope.msg_type
        )));
    }
    let connect: Connect = envelope.decode_payload()?;
    hub.accept(connect, tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use crate::storage::MemoryStorage;
    use switchyard_shared::codec::{self, FrameDecoder};
    use switchyard_shared::{ConnectAck, Heartbeat};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    async fn read_frame(stream: &mut DuplexStream, decoder: &mut FrameDecoder) -> Option<Envelope> {
        let mut buf = [0u8; 1024];
        loop {
            if let Ok(Some(env)) = decoder.decode_next() {
                return Some(env);
            }
            let n = stream.read(&mut buf).await.ok()?;
            if n == 0 {
                return None;
            }
            decoder.extend(&buf[..n]);
        }
    }

    async fn write(stream: &mut DuplexStream, env: &Envelope) {
        stream.write_all(&codec::encode(env).unwrap()).await.unwrap();
    }

    #[tokio::test]
    async fn agent_session_lifecycle() {
        let hub = Hub::new(HubConfig::default(), Arc::new(MemoryStorage::new()));
        hub.start();
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let peer = tokio::spawn(handle_peer(hub.clone(), server, "test".into()));
        let mut decoder = FrameDecoder::new();

        write(&mut client, &Envelope::new(MessageType::Connect, &Connect::agent("a1")).unwrap()).await;
        let ack = read_frame(&mut client, &mut decoder).await.unwrap();
        assert_eq!(ack.msg_type, MessageType::ConnectAck);
        let ack: ConnectAck = ack.decode_payload().unwrap();
        assert!(hub.registry().is_agent_online("a1"));

        write(&mut client, &Envelope::new(MessageType::Heartbeat, &Heartbeat::default()).unwrap()).await;

        drop(client);
        peer.await.unwrap();
        assert!(!hub.registry().is_agent_online("a1"));
        assert!(hub.registry().get_connection(&ack.connection_id).is_none());
    }

    #[tokio::test]
    async fn non_connect_first_frame_is_rejected() {
        let hub = Hub::new(HubConfig::default(), Arc::new(MemoryStorage::new()));
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let peer = tokio::spawn(handle_peer(hub.clone(), server, "test".into()));
        let mut decoder = FrameDecoder::new();

        write(&mut client, &Envelope::new(MessageType::Heartbeat, &Heartbeat::default()).unwrap()).await;
        let reply = read_frame(&mut client, &mut decoder).await.unwrap();
        assert_eq!(reply.msg_type, MessageType::Error);
        let error: ErrorPayload = reply.decode_payload().unwrap();
        assert_eq!(error.code, "HANDSHAKE_REJECTED");

        peer.await.unwrap();
        assert!(read_frame(&mut client, &mut decoder).await.is_none());
        assert_eq!(hub.registry().connection_count(), 0);
    }

    #[tokio::test]
    async fn eviction_closes_old_socket() {
        let hub = Hub::new(HubConfig::default(), Arc::new(MemoryStorage::new()));
        hub.start();
        let (mut first, server) = tokio::io::duplex(64 * 1024);
        let old_peer = tokio::spawn(handle_peer(hub.clone(), server, "old".into()));
        let mut decoder = FrameDecoder::new();
        write(&mut first, &Envelope::new(MessageType::Connect, &Connect::agent("a1")).unwrap()).await;
        read_frame(&mut first, &mut decoder).await.unwrap();

        let (mut second, server) = tokio::io::duplex(64 * 1024);
        let _new_peer = tokio::spawn(handle_peer(hub.clone(), server, "new".into()));
        let mut decoder2 = FrameDecoder::new();
        write(&mut second, &Envelope::new(MessageType::Connect, &Connect::agent("a1")).unwrap()).await;
        let ack: ConnectAck = read_frame(&mut second, &mut decoder2)
            .await
            .unwrap()
            .decode_payload()
            .unwrap();

        old_peer.await.unwrap();
        assert!(read_frame(&mut first, &mut decoder).await.is_none());
        assert_eq!(hub.registry().get_agent_connection("a1").unwrap().id, ack.connection_id);
    }
}
