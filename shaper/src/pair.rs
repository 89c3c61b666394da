//! A single client<->upstream relay: static-forward connect, or SOCKS5
//! negotiation, followed by the shaped bidirectional copy.
//!
//! Grounded on `Forwarder`/`UpstreamConnection` in `forwarder.py`: one
//! object owns the client transport and the upstream link, and its
//! `close()` drains both shaping queues before tearing down the sockets.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{PortRewrite, ShaperConfig};
use crate::dns::DnsCache;
use crate::error::RelayError;
use crate::meter::BandwidthMeter;
use crate::shaping::ShapingQueue;
use crate::socks::SocksNegotiator;
use crate::upstream::UpstreamLink;

const READ_CHUNK: usize = 16 * 1024;

/// Owns the cancellation token for one client<->upstream session. A
/// [`Weak`] reference is handed to the supervisor's live-pair registry so
/// shutdown can be broadcast without keeping the pair alive past its
/// natural lifetime.
pub struct ConnectionPair {
    cancel: Arc<CancellationToken>,
}

impl ConnectionPair {
    pub fn new() -> Self {
        Self {
            cancel: Arc::new(CancellationToken::new()),
        }
    }

    pub fn weak_handle(&self) -> Weak<CancellationToken> {
        Arc::downgrade(&self.cancel)
    }

    /// Static-forward mode: start draining the client into an offline
    /// [`UpstreamLink`] right away, dial `target` concurrently, then attach
    /// the connected write half so anything buffered while the dial was in
    /// flight gets flushed in order before direct writes resume.
    pub async fn serve_forward(&self, client: TcpStream, target: SocketAddr, config: ShaperConfig) -> Result<(), RelayError> {
        let (client_read, client_write) = client.into_split();
        let latency = Duration::from_secs_f64(config.latency_half_rtt.max(0.0));
        let ingress_bps = if config.shape_ingress { config.in_bps } else { 0 };

        let link = Arc::new(UpstreamLink::new());
        let egress = Arc::new(ShapingQueue::start(link.clone(), latency, BandwidthMeter::new(config.out_bps)));
        let ingress = Arc::new(ShapingQueue::start(client_write, latency, BandwidthMeter::new(ingress_bps)));

        let mut client_pump = tokio::spawn(pump(client_read, egress.clone()));

        let cancel = self.cancel.clone();
        let dial = tokio::select! {
            result = UpstreamLink::dial(target) => result,
            _ = cancel.cancelled() => {
                client_pump.abort();
                egress.stop();
                ingress.stop();
                egress.wait_done().await;
                ingress.wait_done().await;
                return Ok(());
            }
        };

        let upstream = match dial {
            Ok(upstream) => upstream,
            Err(err) => {
                client_pump.abort();
                egress.stop();
                ingress.stop();
                egress.wait_done().await;
                ingress.wait_done().await;
                return Err(err);
            }
        };
        debug!(%target, "upstream connected");

        let (upstream_read, upstream_write) = upstream.into_split();
        link.attach(upstream_write).await.map_err(RelayError::from)?;

        let upstream_to_client = pump(upstream_read, ingress.clone());

        let result = tokio::select! {
            res = upstream_to_client => res,
            join_res = &mut client_pump => match join_res {
                Ok(res) => res,
                Err(join_err) => Err(RelayError::RelayIo(io::Error::new(io::ErrorKind::Other, join_err.to_string()))),
            },
            _ = cancel.cancelled() => Ok(()),
        };
        client_pump.abort();

        egress.stop();
        ingress.stop();
        egress.wait_done().await;
        ingress.wait_done().await;

        if let Err(ref err) = result {
            warn!(error = %err, "relay ended with error");
        }
        result
    }

    /// SOCKS5 mode: negotiate the handshake and CONNECT request on `client`
    /// first, then relay using the socket it yields. The client cannot send
    /// relay data before the CONNECT reply arrives, so there is nothing to
    /// buffer pre-connect here; the upstream write half goes straight into
    /// the egress queue.
    pub async fn serve_socks5(
        &self,
        mut client: TcpStream,
        config: ShaperConfig,
        desthost: Option<&str>,
        port_rewrite: &PortRewrite,
        dns: &DnsCache,
    ) -> Result<(), RelayError> {
        let negotiator = SocksNegotiator::new(desthost, port_rewrite, dns);
        let (upstream, bound) = negotiator.negotiate(&mut client).await?;
        debug!(%bound, "socks5 CONNECT established");
        self.relay_established(client, upstream, config).await
    }

    async fn relay_established(&self, client: TcpStream, upstream: TcpStream, config: ShaperConfig) -> Result<(), RelayError> {
        let (mut client_read, client_write) = client.into_split();
        let (mut upstream_read, upstream_write) = upstream.into_split();

        let latency = Duration::from_secs_f64(config.latency_half_rtt.max(0.0));
        let ingress_bps = if config.shape_ingress { config.in_bps } else { 0 };

        let egress = ShapingQueue::start(upstream_write, latency, BandwidthMeter::new(config.out_bps));
        let ingress = ShapingQueue::start(client_write, latency, BandwidthMeter::new(ingress_bps));

        let cancel = self.cancel.clone();
        let client_to_upstream = async {
            let mut buf = BytesMut::with_capacity(READ_CHUNK);
            loop {
                buf.resize(READ_CHUNK, 0);
                let read = client_read.read(&mut buf).await?;
                if read == 0 {
                    break;
                }
                egress.put(Bytes::copy_from_slice(&buf[..read]));
            }
            Ok::<(), RelayError>(())
        };

        let upstream_to_client = async {
            let mut buf = BytesMut::with_capacity(READ_CHUNK);
            loop {
                buf.resize(READ_CHUNK, 0);
                let read = upstream_read.read(&mut buf).await?;
                if read == 0 {
                    break;
                }
                ingress.put(Bytes::copy_from_slice(&buf[..read]));
            }
            Ok::<(), RelayError>(())
        };

        let result = tokio::select! {
            res = client_to_upstream => res,
            res = upstream_to_client => res,
            _ = cancel.cancelled() => Ok(()),
        };

        egress.stop();
        ingress.stop();
        egress.wait_done().await;
        ingress.wait_done().await;

        if let Err(ref err) = result {
            warn!(error = %err, "relay ended with error");
        }
        result
    }
}

impl Default for ConnectionPair {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads from `reader` until EOF, pushing each chunk onto `queue`.
async fn pump<R>(mut reader: R, queue: Arc<ShapingQueue>) -> Result<(), RelayError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    loop {
        buf.resize(READ_CHUNK, 0);
        let read = reader.read(&mut buf).await?;
        if read == 0 {
            return Ok(());
        }
        queue.put(Bytes::copy_from_slice(&buf[..read]));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn forwards_bytes_both_directions_unshaped() {
        let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream_listener.local_addr().unwrap();

        let echo = tokio::spawn(async move {
            let (mut sock, _) = upstream_listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(&buf).await.unwrap();
        });

        let client_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client_addr = client_listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { client_listener.accept().await.unwrap().0 });

        let mut outbound_client = TcpStream::connect(client_addr).await.unwrap();
        let server_side_client = accept.await.unwrap();

        let pair = ConnectionPair::new();
        let config = ShaperConfig {
            latency_half_rtt: 0.0,
            in_bps: 0,
            out_bps: 0,
            shape_ingress: true,
        };

        let relay_task = tokio::spawn(async move {
            pair.serve_forward(server_side_client, upstream_addr, config).await
        });

        outbound_client.write_all(b"hello").await.unwrap();
        let mut echoed = [0u8; 5];
        outbound_client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"hello");

        drop(outbound_client);
        echo.await.unwrap();
        let _ = relay_task.await.unwrap();
    }

    #[tokio::test]
    async fn dial_failure_tears_down_without_hanging() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = listener.local_addr().unwrap();
        drop(listener);

        let client_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client_addr = client_listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { client_listener.accept().await.unwrap().0 });
        let _outbound_client = TcpStream::connect(client_addr).await.unwrap();
        let server_side_client = accept.await.unwrap();

        let pair = ConnectionPair::new();
        let config = ShaperConfig {
            latency_half_rtt: 0.0,
            in_bps: 0,
            out_bps: 0,
            shape_ingress: true,
        };

        let result = pair.serve_forward(server_side_client, dead_addr, config).await;
        assert!(result.is_err());
    }
}
