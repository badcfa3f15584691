//! Framed socket IO for one peer

use std::sync::Arc;

use switchyard_shared::codec::{self, CodecError, FrameDecoder};
use switchyard_shared::Envelope;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Read half of a peer connection
pub struct PeerSession<R> {
    reader: R,
    decoder: FrameDecoder,
    read_buf: Vec<u8>,
    addr: String,
}

impl<R: AsyncRead + Unpin> PeerSession<R> {
    pub fn new(reader: R, addr: impl Into<String>) -> Self {
        Self {
            reader,
            decoder: FrameDecoder::new(),
            read_buf: vec![0u8; 4096],
            addr: addr.into(),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Read the next envelope
    ///
    /// Returns `None` once the peer closes the socket. A decode error means
    /// the stream is out of sync and the connection should be dropped.
    pub async fn recv(&mut self) -> Option<Result<Envelope, CodecError>> {
        loop {
            match self.decoder.decode_next() {
                Ok(Some(envelope)) => return Some(Ok(envelope)),
                Ok(None) => {}
                Err(e) => return Some(Err(e)),
            }

            match self.reader.read(&mut self.read_buf).await {
                Ok(0) => return None,
                Ok(n) => self.decoder.extend(&self.read_buf[..n]),
                Err(e) => {
                    debug!(addr = %self.addr, error = %e, "read error");
                    return None;
                }
            }
        }
    }
}

/// Drain a connection's outbound channel onto the socket
///
/// Stops when the channel closes, a write fails, or `closed` fires.
pub fn spawn_writer<W>(
    mut writer: W,
    mut rx: mpsc::Receiver<Arc<Envelope>>,
    closed: CancellationToken,
    addr: String,
) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                () = closed.cancelled() => break,
                message = rx.recv() => match message {
                    Some(m) => m,
                    None => break,
                },
            };
            let frame = match codec::encode(&message) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(addr = %addr, msg_type = ?message.msg_type, error = %e, "dropping unencodable message");
                    continue;
                }
            };
            if let Err(e) = writer.write_all(&frame).await {
                debug!(addr = %addr, error = %e, "write failed, stopping writer");
                break;
            }
        }
        let _ = writer.shutdown().await;
        debug!(addr = %addr, "writer stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchyard_shared::{Heartbeat, MessageType};

    fn heartbeat() -> Envelope {
        Envelope::new(MessageType::Heartbeat, &Heartbeat::default()).unwrap()
    }

    #[tokio::test]
    async fn writer_frames_reach_reader() {
        let (client, server) = tokio::io::duplex(1024);
        let (tx, rx) = mpsc::channel(8);
        let closed = CancellationToken::new();
        let handle = spawn_writer(server, rx, closed.clone(), "test".into());

        tx.send(Arc::new(heartbeat())).await.unwrap();
        tx.send(Arc::new(heartbeat())).await.unwrap();

        let mut session = PeerSession::new(client, "test");
        for _ in 0..2 {
            let env = session.recv().await.unwrap().unwrap();
            assert_eq!(env.msg_type, MessageType::Heartbeat);
        }

        closed.cancel();
        handle.await.unwrap();
        assert!(session.recv().await.is_none());
    }

    #[tokio::test]
    async fn garbage_is_a_decode_error() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut session = PeerSession::new(server, "test");

        client.write_all(&[0, 0, 0, 3, b'{', b'{', b'{']).await.unwrap();
        assert!(matches!(session.recv().await, Some(Err(_))));
    }

    #[tokio::test]
    async fn split_frames_are_reassembled() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut session = PeerSession::new(server, "test");
        let frame = codec::encode(&heartbeat()).unwrap();
        let (a, b) = frame.split_at(3);

        client.write_all(a).await.unwrap();
        let reader = tokio::spawn(async move { session.recv().await });
        tokio::task::yield_now().await;
        client.write_all(b).await.unwrap();

        let env = reader.await.unwrap().unwrap().unwrap();
        assert_eq!(env.msg_type, MessageType::Heartbeat);
    }
}
