//! The upstream half of a relayed connection: connects to the real
//! destination and, if client bytes arrive before that connect finishes,
//! buffers them for replay once it does.
//!
//! Grounded on the original `UpstreamConnection`, which queues data_received
//! bytes until its transport exists, then drains the queue before accepting
//! direct writes.

use std::io;
use std::net::SocketAddr;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

use crate::error::RelayError;
use crate::shaping::ChunkWriter;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

enum LinkState {
    Buffering(Vec<Bytes>),
    Ready(OwnedWriteHalf),
    Closed,
}

/// The write side of the upstream connection. Created before the TCP
/// connect to the real destination is even attempted, so that bytes the
/// client sends immediately are never dropped.
pub struct UpstreamLink {
    state: Mutex<LinkState>,
}

impl UpstreamLink {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LinkState::Buffering(Vec::new())),
        }
    }

    /// Connects to `addr` with a 5 second timeout, without touching this
    /// link's buffered state. Returns the connected stream on
    /// success so the caller can split it and hand the read half to the
    /// ingress side.
    pub async fn dial(addr: SocketAddr) -> Result<TcpStream, RelayError> {
        match timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(err)) => Err(RelayError::UpstreamConnectError(addr.to_string(), err)),
            Err(_) => Err(RelayError::UpstreamConnectTimeout(addr.to_string())),
        }
    }

    /// Attaches a connected write half, flushing anything buffered while
    /// the connect was in flight, in the order it was received. Calling
    /// this more than once, or after `close`, is a no-op.
    pub async fn attach(&self, mut write_half: OwnedWriteHalf) -> io::Result<()> {
        let buffered = {
            let mut state = self.state.lock().expect("upstream link mutex poisoned");
            if !matches!(&*state, LinkState::Buffering(_)) {
                return Ok(());
            }
            match std::mem::replace(&mut *state, LinkState::Closed) {
                LinkState::Buffering(buf) => buf,
                _ => unreachable!(),
            }
        };

        for chunk in &buffered {
            write_half.write_all(chunk).await?;
        }
        write_half.flush().await?;

        *self.state.lock().expect("upstream link mutex poisoned") = LinkState::Ready(write_half);
        Ok(())
    }

    /// Marks the link closed. Buffered-but-unflushed data is dropped;
    /// already-attached writers are shut down. Idempotent.
    pub async fn close(&self) {
        let previous = {
            let mut state = self.state.lock().expect("upstream link mutex poisoned");
            std::mem::replace(&mut *state, LinkState::Closed)
        };
        if let LinkState::Ready(mut write_half) = previous {
            let _ = write_half.shutdown().await;
        }
    }
}

impl Default for UpstreamLink {
    fn default() -> Self {
        Self::new()
    }
}

impl UpstreamLink {
    /// Writes (or, pre-connect, buffers) one chunk. Takes `&self`: all
    /// mutation goes through the internal mutex, so this is safe to call
    /// concurrently with `attach`.
    async fn write(&self, data: &[u8]) -> io::Result<()> {
        enum Action {
            Buffered,
            Write(OwnedWriteHalf),
            Closed,
        }

        let action = {
            let mut state = self.state.lock().expect("upstream link mutex poisoned");
            match &mut *state {
                LinkState::Buffering(buf) => {
                    buf.push(Bytes::copy_from_slice(data));
                    Action::Buffered
                }
                LinkState::Ready(_) => match std::mem::replace(&mut *state, LinkState::Closed) {
                    LinkState::Ready(w) => Action::Write(w),
                    _ => unreachable!(),
                },
                LinkState::Closed => Action::Closed,
            }
        };

        match action {
            Action::Buffered => Ok(()),
            Action::Closed => Err(io::Error::new(io::ErrorKind::BrokenPipe, "upstream link closed")),
            Action::Write(mut w) => {
                let result = w.write_all(data).await;
                *self.state.lock().expect("upstream link mutex poisoned") = LinkState::Ready(w);
                result
            }
        }
    }

    async fn flush(&self) -> io::Result<()> {
        enum Action {
            NoOp,
            Flush(OwnedWriteHalf),
        }

        let action = {
            let mut state = self.state.lock().expect("upstream link mutex poisoned");
            match &mut *state {
                LinkState::Ready(_) => match std::mem::replace(&mut *state, LinkState::Closed) {
                    LinkState::Ready(w) => Action::Flush(w),
                    _ => unreachable!(),
                },
                _ => Action::NoOp,
            }
        };

        match action {
            Action::NoOp => Ok(()),
            Action::Flush(mut w) => {
                let result = w.flush().await;
                *self.state.lock().expect("upstream link mutex poisoned") = LinkState::Ready(w);
                result
            }
        }
    }
}

// Two impls: `ShapingQueue` can own either an `UpstreamLink` directly, or
// (the common case here) an `Arc<UpstreamLink>` shared with the code that
// later calls `attach` once the upstream connect resolves.
#[async_trait]
impl ChunkWriter for UpstreamLink {
    async fn write_chunk(&mut self, data: &[u8]) -> io::Result<()> {
        UpstreamLink::write(self, data).await
    }

    async fn flush_chunk(&mut self) -> io::Result<()> {
        UpstreamLink::flush(self).await
    }
}

#[async_trait]
impl ChunkWriter for std::sync::Arc<UpstreamLink> {
    async fn write_chunk(&mut self, data: &[u8]) -> io::Result<()> {
        self.as_ref().write(data).await
    }

    async fn flush_chunk(&mut self) -> io::Result<()> {
        self.as_ref().flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let accept = listener.accept();
        let (client_res, accept_res) = tokio::join!(connect, accept);
        (client_res.unwrap(), accept_res.unwrap().0)
    }

    #[tokio::test]
    async fn buffers_before_attach_and_flushes_in_order() {
        let mut link = UpstreamLink::new();
        link.write_chunk(b"a").await.unwrap();
        link.write_chunk(b"b").await.unwrap();

        let (client, mut server) = loopback_pair().await;
        let (_read_half, write_half) = client.into_split();
        link.attach(write_half).await.unwrap();

        let mut received = [0u8; 2];
        server.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, b"ab");
    }

    #[tokio::test]
    async fn writes_after_attach_go_straight_through() {
        let mut link = UpstreamLink::new();
        let (client, mut server) = loopback_pair().await;
        let (_read_half, write_half) = client.into_split();
        link.attach(write_half).await.unwrap();

        link.write_chunk(b"c").await.unwrap();

        let mut received = [0u8; 1];
        server.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, b"c");
    }

    #[tokio::test]
    async fn dial_to_closed_port_errors_quickly() {
        // Bind then drop to get a port nothing is listening on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = UpstreamLink::dial(addr).await;
        assert!(result.is_err());
    }
}
