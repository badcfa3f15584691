//! Connection manager with persistent connections and automatic reconnection

use std::time::Duration;

use anyhow::{bail, Result};
use switchyard_shared::codec::{self, FrameDecoder};
use switchyard_shared::{Connect, ConnectAck, Envelope, ErrorPayload, Heartbeat, MessageType};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, timeout};
use tracing::{debug, warn};

use crate::config::AgentConfig;
use crate::transport::TransportConnector;

/// Events emitted by the connection manager
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Handshake with the hub completed
    Connected { connection_id: String },
    /// An established session ended
    Disconnected { reason: String },
    /// Received an envelope from the hub
    Received(Envelope),
    /// A connection attempt failed before the handshake completed
    ConnectionFailed { reason: String },
}

/// Manages the persistent connection to the hub
pub struct ConnectionManager {
    config: AgentConfig,
    /// Channel to send envelopes to the hub
    outbound_tx: mpsc::Sender<Envelope>,
    /// Channel to receive connection events
    event_rx: mpsc::Receiver<ConnectionEvent>,
    reconnect_tx: mpsc::Sender<()>,
}

impl ConnectionManager {
    /// Create a new connection manager and start the connection loop
    ///
    /// `status` supplies the heartbeat payload; its latest value is sent on
    /// every tick.
    pub fn new<C>(config: AgentConfig, connector: C, status: watch::Receiver<Heartbeat>) -> Self
    where
        C: TransportConnector + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::channel::<Envelope>(100);
        let (event_tx, event_rx) = mpsc::channel::<ConnectionEvent>(100);
        let (reconnect_tx, reconnect_rx) = mpsc::channel::<()>(1);

        let link = Link {
            config: config.clone(),
            status,
            outbound_rx,
            reconnect_rx,
            event_tx,
        };
        tokio::spawn(connection_loop(link, connector));

        Self {
            config,
            outbound_tx,
            event_rx,
            reconnect_tx,
        }
    }

    /// Receive the next connection event
    pub async fn recv(&mut self) -> Option<ConnectionEvent> {
        self.event_rx.recv().await
    }

    pub fn agent_id(&self) -> &str {
        &self.config.agent_id
    }

    /// Get a clone of the sender for outbound messages
    ///
    /// Messages sent while disconnected are delivered after the next handshake.
    pub fn get_sender(&self) -> mpsc::Sender<Envelope> {
        self.outbound_tx.clone()
    }

    /// Drop the current session and reconnect
    pub fn request_reconnect(&self) {
        let _ = self.reconnect_tx.try_send(());
    }
}

struct Link {
    config: AgentConfig,
    status: watch::Receiver<Heartbeat>,
    outbound_rx: mpsc::Receiver<Envelope>,
    reconnect_rx: mpsc::Receiver<()>,
    event_tx: mpsc::Sender<ConnectionEvent>,
}

/// Main connection loop with reconnection logic
async fn connection_loop<C: TransportConnector>(mut link: Link, connector: C) {
    let mut reconnect_delay = link.config.reconnect_delay;

    loop {
        let attempt = match timeout(link.config.connect_timeout, connector.connect()).await {
            Ok(Ok(stream)) => handle_connection(stream, &mut link).await,
            Ok(Err(e)) => Err(Session::Failed(format!("{}: {e:#}", connector.name()))),
            Err(_) => Err(Session::Failed(format!("{}: connect timed out", connector.name()))),
        };

        let event = match attempt {
            Ok(()) => break,
            Err(Session::Ended(reason)) => {
                // The handshake succeeded, so start the backoff over
                reconnect_delay = link.config.reconnect_delay;
                ConnectionEvent::Disconnected { reason }
            }
            Err(Session::Failed(reason)) => ConnectionEvent::ConnectionFailed { reason },
        };
        if link.event_tx.send(event).await.is_err() {
            break;
        }

        // Stale restart requests must not cut the next session short
        while link.reconnect_rx.try_recv().is_ok() {}

        tokio::time::sleep(reconnect_delay).await;
        reconnect_delay = std::cmp::min(reconnect_delay * 2, link.config.max_reconnect_delay);
    }
    debug!("connection loop stopped");
}

/// Why a session ended
enum Session {
    /// Never got past the handshake
    Failed(String),
    /// Was connected, then lost
    Ended(String),
}

/// Handle an active connection
///
/// Returns `Ok(())` only once the manager has been dropped.
async fn handle_connection<S>(stream: S, link: &mut Link) -> Result<(), Session>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut decoder = FrameDecoder::new();
    let mut read_buf = vec![0u8; 4096];

    let connection_id = timeout(
        link.config.connect_timeout,
        handshake(&link.config, &mut reader, &mut writer, &mut decoder, &mut read_buf),
    )
    .await
    .map_err(|_| Session::Failed("no CONNECT_ACK from hub".into()))?
    .map_err(|e| Session::Failed(format!("{e:#}")))?;

    if link
        .event_tx
        .send(ConnectionEvent::Connected { connection_id })
        .await
        .is_err()
    {
        return Ok(());
    }

    // Frames already buffered behind the CONNECT_ACK
    forward_frames(&mut decoder, &link.event_tx)
        .await
        .map_err(|e| Session::Ended(format!("{e:#}")))?;

    run_session(link, &mut reader, &mut writer, &mut decoder, &mut read_buf)
        .await
        .map_err(|e| Session::Ended(format!("{e:#}")))
}

async fn handshake<R, W>(
    config: &AgentConfig,
    reader: &mut R,
    writer: &mut W,
    decoder: &mut FrameDecoder,
    read_buf: &mut [u8],
) -> Result<String>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let connect = Envelope::new(MessageType::Connect, &Connect::agent(&config.agent_id))?;
    writer.write_all(&codec::encode(&connect)?).await?;

    let reply = loop {
        if let Some(envelope) = decoder.decode_next()? {
            break envelope;
        }
        let n = reader.read(read_buf).await?;
        if n == 0 {
            bail!("hub closed connection during handshake");
        }
        decoder.extend(&read_buf[..n]);
    };

    match reply.msg_type {
        MessageType::ConnectAck => {
            let ack: ConnectAck = reply.decode_payload()?;
            Ok(ack.connection_id)
        }
        MessageType::Error => {
            let error: ErrorPayload = reply.decode_payload()?;
            bail!("hub rejected handshake: {} ({})", error.message, error.code)
        }
        other => bail!("expected CONNECT_ACK, got {other:?}"),
    }
}

async fn run_session<R, W>(
    link: &mut Link,
    reader: &mut R,
    writer: &mut W,
    decoder: &mut FrameDecoder,
    read_buf: &mut [u8],
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut heartbeat_interval = interval(link.config.heartbeat_interval);

    loop {
        tokio::select! {
            _ = heartbeat_interval.tick() => {
                let heartbeat = link.status.borrow().clone();
                let envelope = Envelope::new(MessageType::Heartbeat, &heartbeat)?;
                writer.write_all(&codec::encode(&envelope)?).await?;
            }

            outbound = link.outbound_rx.recv() => {
                let Some(envelope) = outbound else {
                    return Ok(());
                };
                writer.write_all(&codec::encode(&envelope)?).await?;
            }

            Some(()) = link.reconnect_rx.recv() => {
                let _ = writer.shutdown().await;
                bail!("reconnect requested");
            }

            result = reader.read(read_buf) => {
                let n = result?;
                if n == 0 {
                    bail!("hub closed connection");
                }
                decoder.extend(&read_buf[..n]);
                if !forward_frames(decoder, &link.event_tx).await? {
                    return Ok(());
                }
            }
        }
    }
}

/// Emit every complete frame; `false` once nobody is listening
async fn forward_frames(
    decoder: &mut FrameDecoder,
    event_tx: &mpsc::Sender<ConnectionEvent>,
) -> Result<bool> {
    while let Some(envelope) = decoder.decode_next()? {
        if envelope.msg_type == MessageType::Unknown {
            warn!(id = %envelope.id, "dropping message of unknown type");
            continue;
        }
        if event_tx.send(ConnectionEvent::Received(envelope)).await.is_err() {
            return Ok(false);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use switchyard_shared::{CommandCancel, PeerRole};
    use tokio::io::DuplexStream;

    /// Hands out queued in-memory streams, then refuses
    struct DuplexConnector {
        streams: Mutex<Vec<DuplexStream>>,
        attempts: Arc<AtomicU32>,
    }

    #[async_trait]
    impl TransportConnector for DuplexConnector {
        type Stream = DuplexStream;

        async fn connect(&self) -> Result<DuplexStream> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            self.streams.lock().pop().ok_or_else(|| anyhow!("refused"))
        }

        fn name(&self) -> &str {
            "duplex"
        }
    }

    fn test_config() -> AgentConfig {
        AgentConfig {
            agent_id: "a1".into(),
            heartbeat_interval: Duration::from_secs(3600),
            ..Default::default()
        }
    }

    async fn read_frame(stream: &mut DuplexStream, decoder: &mut FrameDecoder) -> Envelope {
        let mut buf = [0u8; 1024];
        loop {
            if let Some(env) = decoder.decode_next().unwrap() {
                return env;
            }
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "stream closed");
            decoder.extend(&buf[..n]);
        }
    }

    async fn write_frame(stream: &mut DuplexStream, env: &Envelope) {
        stream.write_all(&codec::encode(env).unwrap()).await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_heartbeat_and_receive() {
        let (client, mut hub) = tokio::io::duplex(64 * 1024);
        let connector = DuplexConnector {
            streams: Mutex::new(vec![client]),
            attempts: Arc::default(),
        };
        let (status_tx, status_rx) = watch::channel(Heartbeat::default());
        status_tx.send_replace(Heartbeat {
            status: None,
            running: vec!["cmd_1".into()],
        });
        let mut conn = ConnectionManager::new(test_config(), connector, status_rx);
        let mut decoder = FrameDecoder::new();

        let connect = read_frame(&mut hub, &mut decoder).await;
        assert_eq!(connect.msg_type, MessageType::Connect);
        let connect: Connect = connect.decode_payload().unwrap();
        assert_eq!(connect.role, PeerRole::Agent);
        assert_eq!(connect.agent_id.as_deref(), Some("a1"));

        let ack = ConnectAck {
            connection_id: "conn_1".into(),
            heartbeat_timeout_ms: 30_000,
        };
        write_frame(&mut hub, &Envelope::new(MessageType::ConnectAck, &ack).unwrap()).await;
        match conn.recv().await {
            Some(ConnectionEvent::Connected { connection_id }) => assert_eq!(connection_id, "conn_1"),
            other => panic!("unexpected event {other:?}"),
        }

        // First tick fires immediately after the handshake
        let heartbeat = read_frame(&mut hub, &mut decoder).await;
        assert_eq!(heartbeat.msg_type, MessageType::Heartbeat);
        let heartbeat: Heartbeat = heartbeat.decode_payload().unwrap();
        assert_eq!(heartbeat.running, vec!["cmd_1".to_string()]);

        let cancel = CommandCancel {
            command_id: "cmd_1".into(),
            reason: "stop".into(),
        };
        write_frame(&mut hub, &Envelope::new(MessageType::CommandCancel, &cancel).unwrap()).await;
        match conn.recv().await {
            Some(ConnectionEvent::Received(env)) => assert_eq!(env.msg_type, MessageType::CommandCancel),
            other => panic!("unexpected event {other:?}"),
        }

        drop(hub);
        match conn.recv().await {
            Some(ConnectionEvent::Disconnected { .. }) => {}
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rejected_handshake_reports_failure() {
        let (client, mut hub) = tokio::io::duplex(64 * 1024);
        let connector = DuplexConnector {
            streams: Mutex::new(vec![client]),
            attempts: Arc::default(),
        };
        let (_status_tx, status_rx) = watch::channel(Heartbeat::default());
        let mut conn = ConnectionManager::new(test_config(), connector, status_rx);
        let mut decoder = FrameDecoder::new();

        read_frame(&mut hub, &mut decoder).await;
        let error = ErrorPayload {
            code: "HANDSHAKE_REJECTED".into(),
            message: "nope".into(),
            recoverable: false,
            command_id: None,
            agent_id: None,
        };
        write_frame(&mut hub, &Envelope::new(MessageType::Error, &error).unwrap()).await;

        match conn.recv().await {
            Some(ConnectionEvent::ConnectionFailed { reason }) => {
                assert!(reason.contains("HANDSHAKE_REJECTED"), "{reason}")
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_backoff_doubles() {
        let attempts = Arc::new(AtomicU32::new(0));
        let connector = DuplexConnector {
            streams: Mutex::new(Vec::new()),
            attempts: attempts.clone(),
        };
        let (_status_tx, status_rx) = watch::channel(Heartbeat::default());
        let mut conn = ConnectionManager::new(test_config(), connector, status_rx);

        let start = tokio::time::Instant::now();
        for _ in 0..3 {
            match conn.recv().await {
                Some(ConnectionEvent::ConnectionFailed { .. }) => {}
                other => panic!("unexpected event {other:?}"),
            }
        }
        // 1s then 2s between the three attempts
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert!(start.elapsed() < Duration::from_secs(7));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
