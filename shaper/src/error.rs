//! Error taxonomy for the forwarder.
//!
//! [`RelayError`] is scoped to a single connection pair or SOCKS negotiation
//! and never escapes the task that owns it — it is logged and used to drive
//! shutdown of that one pair, not propagated to `main`. [`AppError`] is the
//! much smaller top-level error that can actually reach `main`.

use std::io;
use thiserror::Error;

/// Errors that can occur while serving a single connection. These are
/// contained within [`crate::pair::ConnectionPair`] /
/// [`crate::socks::SocksNegotiator`]; handling one always ends in closing
/// that pair, never in terminating the process.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("upstream connect to {0} timed out after 5s")]
    UpstreamConnectTimeout(String),

    #[error("upstream connect to {0} failed: {1}")]
    UpstreamConnectError(String, #[source] io::Error),

    #[error("relay I/O error: {0}")]
    RelayIo(#[source] io::Error),

    #[error("SOCKS5 protocol error: {0}")]
    Protocol(#[source] socks5_proto::Error),
}

impl From<io::Error> for RelayError {
    fn from(err: io::Error) -> Self {
        RelayError::RelayIo(err)
    }
}

impl From<socks5_proto::Error> for RelayError {
    fn from(err: socks5_proto::Error) -> Self {
        RelayError::Protocol(err)
    }
}

/// Top-level error that can reach `main`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("failed to bind listener on {addr}: {source}")]
    BindFailure {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}
