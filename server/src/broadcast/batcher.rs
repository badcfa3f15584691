//! Per-key batching of high-frequency output
//!
//! Output and trace items for a command are buffered under the command id
//! and flushed as one `TERMINAL_STREAM` message, either when the buffer
//! reaches `max_size` or on the periodic ticker. Flushes for a key are
//! serialized under the batcher lock, so batches leave in arrival order and
//! carry a per-key sequence number.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use switchyard_shared::{Envelope, MessageType, StreamItem, TerminalStream};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::broadcaster::{BroadcastResult, MessageBroadcaster};

#[derive(Default)]
struct KeyBuffer {
    items: Vec<StreamItem>,
    next_sequence: u64,
}

pub struct OutputBatcher {
    broadcaster: Arc<MessageBroadcaster>,
    max_size: usize,
    flush_interval: Duration,
    buffers: Mutex<HashMap<String, KeyBuffer>>,
}

impl OutputBatcher {
    pub fn new(broadcaster: Arc<MessageBroadcaster>, max_size: usize, flush_interval: Duration) -> Self {
        Self {
            broadcaster,
            max_size: max_size.max(1),
            flush_interval,
            buffers: Mutex::new(HashMap::new()),
        }
    }

    /// Buffer an item; flushes the key immediately once it is full
    pub fn push(&self, key: &str, item: StreamItem) -> Option<BroadcastResult> {
        let mut buffers = self.buffers.lock();
        let buffer = buffers.entry(key.to_string()).or_default();
        buffer.items.push(item);
        if buffer.items.len() >= self.max_size {
            return self.flush_locked(key, buffer);
        }
        None
    }

    /// Send everything buffered for `key` as one batch
    ///
    /// An empty or unknown key is a no-op and returns `None`.
    pub fn flush(&self, key: &str) -> Option<BroadcastResult> {
        let mut buffers = self.buffers.lock();
        let buffer = buffers.get_mut(key)?;
        self.flush_locked(key, buffer)
    }

    /// Flush every non-empty key; returns the number of batches sent
    pub fn flush_all(&self) -> usize {
        let mut buffers = self.buffers.lock();
        let mut keys: Vec<String> = buffers
            .iter()
            .filter(|(_, b)| !b.items.is_empty())
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();

        let mut flushed = 0;
        for key in keys {
            if let Some(buffer) = buffers.get_mut(&key) {
                if self.flush_locked(&key, buffer).is_some() {
                    flushed += 1;
                }
            }
        }
        flushed
    }

    /// Flush and drop all state for a key (its stream has ended)
    pub fn finish(&self, key: &str) -> Option<BroadcastResult> {
        let mut buffers = self.buffers.lock();
        let mut buffer = buffers.remove(key)?;
        self.flush_locked(key, &mut buffer)
    }

    pub fn pending(&self, key: &str) -> usize {
        self.buffers.lock().get(key).map_or(0, |b| b.items.len())
    }

    fn flush_locked(&self, key: &str, buffer: &mut KeyBuffer) -> Option<BroadcastResult> {
        if buffer.items.is_empty() {
            return None;
        }
        let items = std::mem::take(&mut buffer.items);
        let sequence = buffer.next_sequence;
        buffer.next_sequence += 1;

        let count = items.len();
        let batch = TerminalStream {
            command_id: key.to_string(),
            sequence,
            items,
        };
        let envelope = match Envelope::new(MessageType::TerminalStream, &batch) {
            Ok(env) => env,
            Err(e) => {
                warn!(key, error = %e, "failed to encode output batch, dropping");
                return None;
            }
        };

        debug!(key, sequence, count, "flushing output batch");
        Some(self.broadcaster.broadcast_to_dashboards(&envelope, &[]))
    }

    /// Run the periodic flush until `shutdown` fires
    pub fn spawn_ticker(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let batcher = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(batcher.flush_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        batcher.flush_all();
                    }
                    () = shutdown.cancelled() => {
                        batcher.flush_all();
                        debug!("output batcher stopped");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Connection, ConnectionRegistry};
    use serde_json::json;
    use switchyard_shared::{OutputStream, StreamKind};
    use tokio::sync::mpsc;

    fn setup(max_size: usize) -> (Arc<OutputBatcher>, mpsc::Receiver<Arc<Envelope>>) {
        let registry = Arc::new(ConnectionRegistry::default());
        let (tx, rx) = mpsc::channel(64);
        registry
            .register(Arc::new(Connection::dashboard("d1", None, tx)))
            .unwrap();
        let broadcaster = Arc::new(MessageBroadcaster::new(registry));
        let batcher = Arc::new(OutputBatcher::new(
            broadcaster,
            max_size,
            Duration::from_millis(20),
        ));
        (batcher, rx)
    }

    fn item(n: u64) -> StreamItem {
        StreamItem {
            kind: StreamKind::Output,
            stream: Some(OutputStream::Stdout),
            data: json!(format!("line {n}")),
            timestamp: n,
        }
    }

    fn batch(env: &Envelope) -> TerminalStream {
        assert_eq!(env.msg_type, MessageType::TerminalStream);
        env.decode_payload().unwrap()
    }

    #[test]
    fn flush_on_max_size() {
        let (batcher, mut rx) = setup(3);
        assert!(batcher.push("cmd-1", item(1)).is_none());
        assert!(batcher.push("cmd-1", item(2)).is_none());
        let result = batcher.push("cmd-1", item(3)).unwrap();
        assert_eq!(result.successful, 1);
        assert_eq!(batcher.pending("cmd-1"), 0);

        let sent = batch(&rx.try_recv().unwrap());
        assert_eq!(sent.command_id, "cmd-1");
        assert_eq!(sent.sequence, 0);
        let stamps: Vec<u64> = sent.items.iter().map(|i| i.timestamp).collect();
        assert_eq!(stamps, vec![1, 2, 3]);
    }

    #[test]
    fn flush_empty_is_noop() {
        let (batcher, mut rx) = setup(10);
        assert!(batcher.flush("nothing").is_none());
        assert!(batcher.flush("nothing").is_none());

        batcher.push("cmd-1", item(1));
        assert!(batcher.flush("cmd-1").is_some());
        assert!(batcher.flush("cmd-1").is_none());
        assert!(batcher.flush("cmd-1").is_none());

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn order_preserved_across_flushes() {
        let (batcher, mut rx) = setup(2);
        for n in 1..=5 {
            batcher.push("cmd-1", item(n));
        }
        batcher.flush("cmd-1");

        let mut seen = Vec::new();
        let mut sequences = Vec::new();
        while let Ok(env) = rx.try_recv() {
            let b = batch(&env);
            sequences.push(b.sequence);
            seen.extend(b.items.into_iter().map(|i| i.timestamp));
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
        assert_eq!(sequences, vec![0, 1, 2]);
    }

    #[test]
    fn keys_are_independent() {
        let (batcher, mut rx) = setup(10);
        batcher.push("a", item(1));
        batcher.push("b", item(2));
        assert_eq!(batcher.flush_all(), 2);
        assert_eq!(batcher.flush_all(), 0);

        let first = batch(&rx.try_recv().unwrap());
        let second = batch(&rx.try_recv().unwrap());
        assert_eq!(first.command_id, "a");
        assert_eq!(second.command_id, "b");
    }

    #[test]
    fn finish_drops_key_state() {
        let (batcher, mut rx) = setup(10);
        batcher.push("cmd-1", item(1));
        batcher.flush("cmd-1");
        batcher.push("cmd-1", item(2));
        assert!(batcher.finish("cmd-1").is_some());
        assert!(batcher.finish("cmd-1").is_none());

        let _ = rx.try_recv().unwrap();
        assert_eq!(batch(&rx.try_recv().unwrap()).sequence, 1);
    }

    #[tokio::test]
    async fn ticker_flushes_periodically() {
        let (batcher, mut rx) = setup(100);
        let shutdown = CancellationToken::new();
        let handle = batcher.spawn_ticker(shutdown.clone());

        batcher.push("cmd-1", item(1));
        let env = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch(&env).items.len(), 1);

        shutdown.cancel();
        handle.await.unwrap();
    }
}
