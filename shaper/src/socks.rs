//! The SOCKS5 negotiation phase: handshake, then the CONNECT request.
//! Grounded on `socks.py`'s `State`/`Method`/`Command` handling in
//! `SocksConnection.data_received`.
//!
//! Two deliberate departures from a complete SOCKS5 server, both carried
//! over from the original implementation: username/password
//! sub-negotiation is never actually performed (selecting it is fatal, same
//! as the original's unimplemented Auth state), and BIND is acknowledged by
//! doing nothing rather than by a reply, matching the original's Init-state
//! handling of `Command.BIND`.

use std::io;
use std::net::SocketAddr;

use socks5_proto::handshake::{HandshakeMethod, Request as HandshakeRequest, Response as HandshakeResponse};
use socks5_proto::{Address, Command, ProtocolError, Reply, Request, Response};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::config::PortRewrite;
use crate::dns::DnsCache;
use crate::error::RelayError;
use crate::upstream::UpstreamLink;

/// Drives one client through the SOCKS5 handshake and CONNECT request,
/// applying the pinned destination host and port rewrite table configured
/// for this listener.
pub struct SocksNegotiator<'a> {
    desthost: Option<&'a str>,
    port_rewrite: &'a PortRewrite,
    dns: &'a DnsCache,
}

impl<'a> SocksNegotiator<'a> {
    pub fn new(desthost: Option<&'a str>, port_rewrite: &'a PortRewrite, dns: &'a DnsCache) -> Self {
        Self {
            desthost,
            port_rewrite,
            dns,
        }
    }

    /// Runs the negotiation to completion. On success, returns the already
    /// -connected upstream socket and the address it reports as bound
    /// locally (the one echoed back to the client in the CONNECT reply).
    pub async fn negotiate<S>(&self, stream: &mut S) -> Result<(TcpStream, SocketAddr), RelayError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let hello = HandshakeRequest::read_from(stream).await?;
        let chosen = choose_method(&hello.methods);
        HandshakeResponse::new(chosen).write_to(stream).await?;

        if chosen == HandshakeMethod::NO_ACCEPTABLE {
            return Err(RelayError::Protocol(socks5_proto::Error::Protocol(
                ProtocolError::NoAcceptableHandshakeMethod {
                    version: socks5_proto::SOCKS_VERSION,
                    chosen_method: chosen,
                    methods: hello.methods,
                },
            )));
        }
        if chosen == HandshakeMethod::USER_PASS {
            return Err(RelayError::RelayIo(io::Error::new(
                io::ErrorKind::Unsupported,
                "username/password sub-negotiation is not supported",
            )));
        }

        loop {
            let request = Request::read_from(stream).await?;

            match request.command {
                Command::Connect => return self.handle_connect(stream, &request.address).await,
                Command::Bind => continue,
                Command::Associate => {
                    return Err(RelayError::RelayIo(io::Error::new(
                        io::ErrorKind::Unsupported,
                        "UDP ASSOCIATE is not supported",
                    )))
                }
            }
        }
    }

    async fn handle_connect<S>(
        &self,
        stream: &mut S,
        requested: &Address,
    ) -> Result<(TcpStream, SocketAddr), RelayError>
    where
        S: AsyncWrite + Unpin,
    {
        let target = match self.resolve_target(requested).await {
            Ok(target) => target,
            Err(err) => {
                let _ = Response::new(Reply::HostUnreachable, Address::unspecified())
                    .write_to(stream)
                    .await;
                return Err(err);
            }
        };

        match UpstreamLink::dial(target).await {
            Ok(upstream) => {
                let bound = upstream
                    .local_addr()
                    .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
                Response::new(Reply::Succeeded, Address::from(bound))
                    .write_to(stream)
                    .await?;
                Ok((upstream, bound))
            }
            Err(err) => {
                let reply = match &err {
                    RelayError::UpstreamConnectTimeout(_) => Reply::TtlExpired,
                    RelayError::UpstreamConnectError(_, _) => Reply::HostUnreachable,
                    _ => Reply::GeneralFailure,
                };
                let _ = Response::new(reply, Address::unspecified()).write_to(stream).await;
                Err(err)
            }
        }
    }

    async fn resolve_target(&self, requested: &Address) -> Result<SocketAddr, RelayError> {
        let (requested_host, requested_port) = match requested {
            Address::SocketAddress(addr) => (addr.ip().to_string(), addr.port()),
            Address::DomainAddress(host, port) => (host.clone(), *port),
        };

        let host: &str = self.desthost.unwrap_or(&requested_host);
        let port = self.port_rewrite.rewrite(requested_port);

        self.dns.resolve(host, port).await.map_err(RelayError::from)
    }
}

/// Picks a handshake method from the client's offered list. Priority is
/// username/password over no-auth over "none acceptable" — the same order
/// the original negotiator used, even though selecting username/password
/// here always ends the connection (see module docs).
fn choose_method(methods: &[HandshakeMethod]) -> HandshakeMethod {
    if methods.contains(&HandshakeMethod::USER_PASS) {
        HandshakeMethod::USER_PASS
    } else if methods.contains(&HandshakeMethod::NO_AUTH) {
        HandshakeMethod::NO_AUTH
    } else {
        HandshakeMethod::NO_ACCEPTABLE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn no_rewrite() -> PortRewrite {
        PortRewrite::default()
    }

    #[tokio::test]
    async fn connect_to_loopback_succeeds() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let (mut client, mut server) = tokio::io::duplex(4096);
        let dns = DnsCache::new();
        let rewrite = no_rewrite();
        let negotiator = SocksNegotiator::new(None, &rewrite, &dns);

        let driver = tokio::spawn(async move { negotiator.negotiate(&mut server).await });

        // Client: hello offering NO_AUTH.
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut hello_resp = [0u8; 2];
        client.read_exact(&mut hello_resp).await.unwrap();
        assert_eq!(hello_resp, [0x05, 0x00]);

        // CONNECT to the loopback listener by IPv4 address.
        let mut req = vec![0x05, 0x01, 0x00, 0x01];
        req.extend_from_slice(&target.ip().to_string().parse::<std::net::Ipv4Addr>().unwrap().octets());
        req.extend_from_slice(&target.port().to_be_bytes());
        client.write_all(&req).await.unwrap();

        let mut reply_head = [0u8; 4];
        client.read_exact(&mut reply_head).await.unwrap();
        assert_eq!(reply_head[1], 0x00); // Succeeded

        let (upstream, _bound) = driver.await.unwrap().unwrap();
        assert!(upstream.peer_addr().is_ok());
    }

    #[tokio::test]
    async fn no_acceptable_methods_is_fatal() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let dns = DnsCache::new();
        let rewrite = no_rewrite();
        let negotiator = SocksNegotiator::new(None, &rewrite, &dns);

        let driver = tokio::spawn(async move { negotiator.negotiate(&mut server).await });

        use tokio::io::AsyncWriteExt;
        // Offer only GSSAPI (0x01), which this server never accepts.
        client.write_all(&[0x05, 0x01, 0x01]).await.unwrap();

        let result = driver.await.unwrap();
        assert!(result.is_err());
    }
}
