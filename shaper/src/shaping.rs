//! Per-direction shaping queue: applies latency then a bandwidth ceiling to
//! each chunk before writing it out, in FIFO order.
//!
//! Grounded on the original `Throttler`'s `put`/`start`/`stop`/`wait_done`
//! contract: a background task drains a queue, sleeping for the configured
//! latency and then for whatever the bandwidth meter demands, before each
//! write. A chunk is never written out of order and never bypasses the
//! queue, even when both latency and the bandwidth ceiling are zero.

use std::io;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, Duration};

use crate::meter::BandwidthMeter;

/// Destination a [`ShapingQueue`] drains into. Implemented generically for
/// any `AsyncWrite`, and directly by [`crate::upstream::UpstreamLink`],
/// which needs its own buffering before the upstream socket exists.
#[async_trait]
pub trait ChunkWriter: Send {
    async fn write_chunk(&mut self, data: &[u8]) -> io::Result<()>;
    async fn flush_chunk(&mut self) -> io::Result<()>;
}

#[async_trait]
impl<W> ChunkWriter for W
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write_chunk(&mut self, data: &[u8]) -> io::Result<()> {
        self.write_all(data).await
    }

    async fn flush_chunk(&mut self) -> io::Result<()> {
        self.flush().await
    }
}

enum Message {
    Data(Bytes),
    Stop,
}

/// Owns a writer and a background task that shapes and flushes everything
/// enqueued onto it. Dropping the queue without calling `stop` abandons the
/// writer task once the sender side is dropped and the channel drains.
pub struct ShapingQueue {
    tx: mpsc::UnboundedSender<Message>,
    done_rx: Mutex<Option<oneshot::Receiver<()>>>,
}

impl ShapingQueue {
    /// Spawns the writer task and returns a handle to it. `latency` is the
    /// fixed per-chunk delay; `meter` tracks the bandwidth ceiling across
    /// the queue's lifetime.
    pub fn start<W>(writer: W, latency: Duration, mut meter: BandwidthMeter) -> Self
    where
        W: ChunkWriter + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let (done_tx, done_rx) = oneshot::channel();

        tokio::spawn(async move {
            let mut writer = writer;

            while let Some(msg) = rx.recv().await {
                let data = match msg {
                    Message::Stop => break,
                    Message::Data(data) => data,
                };

                if !latency.is_zero() {
                    sleep(latency).await;
                }

                let wait = meter.reserve(data.len());
                if !wait.is_zero() {
                    sleep(wait).await;
                }

                if writer.write_chunk(&data).await.is_err() {
                    break;
                }
            }

            let _ = writer.flush_chunk().await;
            let _ = done_tx.send(());
        });

        Self {
            tx,
            done_rx: Mutex::new(Some(done_rx)),
        }
    }

    /// Enqueues a chunk. Never blocks; the channel is unbounded so the
    /// caller (the read side of the relayed connection) is never stalled by
    /// shaping delay on the other direction.
    pub fn put(&self, data: Bytes) {
        let _ = self.tx.send(Message::Data(data));
    }

    /// Signals the writer task to stop after draining everything already
    /// queued. Idempotent.
    pub fn stop(&self) {
        let _ = self.tx.send(Message::Stop);
    }

    /// Waits for the writer task to finish draining and exit. Safe to call
    /// more than once; the second call returns immediately.
    pub async fn wait_done(&self) {
        let rx = self.done_rx.lock().expect("done_rx mutex poisoned").take();
        if let Some(rx) = rx {
            let _ = rx.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drains_in_order_with_no_shaping() {
        let (client, mut server) = tokio::io::duplex(4096);
        let queue = ShapingQueue::start(client, Duration::ZERO, BandwidthMeter::new(0));

        queue.put(Bytes::from_static(b"hello "));
        queue.put(Bytes::from_static(b"world"));
        queue.stop();
        queue.wait_done().await;

        let mut received = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut server, &mut received)
            .await
            .unwrap();
        assert_eq!(received, b"hello world");
    }

    #[tokio::test]
    async fn wait_done_is_idempotent() {
        let (client, _server) = tokio::io::duplex(64);
        let queue = ShapingQueue::start(client, Duration::ZERO, BandwidthMeter::new(0));
        queue.stop();
        queue.wait_done().await;
        queue.wait_done().await;
    }

    #[tokio::test]
    async fn latency_delays_the_first_byte() {
        let (client, mut server) = tokio::io::duplex(64);
        let queue = ShapingQueue::start(
            client,
            Duration::from_millis(30),
            BandwidthMeter::new(0),
        );

        let started = tokio::time::Instant::now();
        queue.put(Bytes::from_static(b"x"));
        queue.stop();
        queue.wait_done().await;
        assert!(started.elapsed() >= Duration::from_millis(30));

        let mut received = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut server, &mut received)
            .await
            .unwrap();
        assert_eq!(received, b"x");
    }
}
