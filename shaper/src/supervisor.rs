//! Accepts connections on each configured listener and spawns a
//! [`ConnectionPair`] per client, tracking them for graceful shutdown.
//!
//! Live pairs are tracked as [`Weak`] references: the supervisor can ask
//! every pair to cancel, but holding only weak handles means a pair that
//! has already finished and dropped its [`CancellationToken`] is simply
//! skipped, never kept alive past its own natural lifetime.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{ListenerRule, Mode, PortRewrite, ShaperConfig};
use crate::dns::DnsCache;
use crate::error::AppError;
use crate::pair::ConnectionPair;

pub struct Supervisor {
    pairs: Mutex<Vec<Weak<CancellationToken>>>,
    shutdown: CancellationToken,
}

impl Supervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pairs: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Cancels every still-live pair. Pairs that already finished and
    /// dropped their token are pruned as a side effect.
    pub fn shutdown_all(&self) {
        self.shutdown.cancel();
        let mut guard = self.pairs.lock().expect("pair registry mutex poisoned");
        guard.retain(|weak| {
            if let Some(token) = weak.upgrade() {
                token.cancel();
                true
            } else {
                false
            }
        });
    }

    fn register(&self, weak: Weak<CancellationToken>) {
        let mut guard = self.pairs.lock().expect("pair registry mutex poisoned");
        guard.retain(|w| w.upgrade().is_some());
        guard.push(weak);
    }

    /// Runs one static-forward listener until shutdown is requested.
    pub async fn run_forward(self: Arc<Self>, rule: ListenerRule, config: ShaperConfig) -> Result<(), AppError> {
        let bind_addr = format!("{}:{}", rule.listen_host, rule.listen_port);
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|source| AppError::BindFailure { addr: bind_addr.clone(), source })?;

        let target = resolve_once(&rule.upstream_host, rule.upstream_port).await?;
        info!(%bind_addr, %target, "listening (forward mode)");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, peer)) => {
                            let supervisor = self.clone();
                            let pair = ConnectionPair::new();
                            supervisor.register(pair.weak_handle());
                            tokio::spawn(async move {
                                if let Err(err) = pair.serve_forward(socket, target, config).await {
                                    warn!(%peer, error = %err, "forward session ended with error");
                                }
                            });
                        }
                        Err(err) => warn!(error = %err, "accept failed"),
                    }
                }
                _ = self.shutdown.cancelled() => break,
            }
        }

        Ok(())
    }

    /// Runs one SOCKS5 listener until shutdown is requested.
    #[allow(clippy::too_many_arguments)]
    pub async fn run_socks5(
        self: Arc<Self>,
        rule: ListenerRule,
        config: ShaperConfig,
        desthost: Option<Arc<String>>,
        port_rewrite: Arc<PortRewrite>,
        dns: Arc<DnsCache>,
    ) -> Result<(), AppError> {
        let bind_addr = format!("{}:{}", rule.listen_host, rule.listen_port);
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|source| AppError::BindFailure { addr: bind_addr.clone(), source })?;

        info!(%bind_addr, "listening (socks5 mode)");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, peer)) => {
                            let supervisor = self.clone();
                            let pair = ConnectionPair::new();
                            supervisor.register(pair.weak_handle());
                            let desthost = desthost.clone();
                            let port_rewrite = port_rewrite.clone();
                            let dns = dns.clone();
                            tokio::spawn(async move {
                                let desthost_ref = desthost.as_deref().map(String::as_str);
                                if let Err(err) = pair
                                    .serve_socks5(socket, config, desthost_ref, &port_rewrite, &dns)
                                    .await
                                {
                                    warn!(%peer, error = %err, "socks5 session ended with error");
                                }
                            });
                        }
                        Err(err) => warn!(error = %err, "accept failed"),
                    }
                }
                _ = self.shutdown.cancelled() => break,
            }
        }

        Ok(())
    }
}

/// Resolves `host:port` once at listener startup. Static-forward targets
/// are expected to be stable for the process lifetime; per-connection
/// re-resolution belongs to the SOCKS5 pinned-destination path (see
/// [`crate::dns::DnsCache`]).
async fn resolve_once(host: &str, port: u16) -> Result<SocketAddr, AppError> {
    tokio::net::lookup_host((host, port))
        .await
        .map_err(|source| AppError::BindFailure { addr: format!("{host}:{port}"), source })?
        .next()
        .ok_or_else(|| AppError::Config(format!("no addresses for upstream {host}:{port}")))
}

/// Picks `run_forward` or `run_socks5` for `mode` and runs it.
pub async fn run_listener(
    supervisor: Arc<Supervisor>,
    rule: ListenerRule,
    mode: Mode,
    config: ShaperConfig,
    desthost: Option<Arc<String>>,
    port_rewrite: Arc<PortRewrite>,
    dns: Arc<DnsCache>,
) -> Result<(), AppError> {
    match mode {
        Mode::Forward => supervisor.run_forward(rule, config).await,
        Mode::Socks5 => supervisor.run_socks5(rule, config, desthost, port_rewrite, dns).await,
    }
}
