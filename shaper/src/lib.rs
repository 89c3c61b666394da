//! TCP port forwarder with optional per-direction latency and bandwidth
//! shaping, in static-forward and SOCKS5 modes.

pub mod config;
pub mod dns;
pub mod error;
pub mod meter;
pub mod pair;
pub mod shaping;
pub mod socks;
pub mod supervisor;
pub mod upstream;

pub use config::{Cli, ListenerRule, Mode, PortRewrite, ShaperConfig};
pub use error::{AppError, RelayError};
pub use supervisor::Supervisor;
