//! CLI surface and the config types derived from it.

use clap::{Parser, ValueEnum};
use std::collections::HashMap;
use std::fmt;

use crate::error::AppError;

/// `--mode forward|socks5`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum Mode {
    Forward,
    Socks5,
}

#[derive(Parser, Debug)]
#[command(name = "shaper", about = "TCP port forwarder with latency and bandwidth shaping")]
pub struct Cli {
    /// Local listener host (static-forward mode, or when --port-mapping is unset).
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Local listener port.
    #[arg(long, default_value_t = 8888)]
    pub port: u16,

    /// Static-forward upstream host.
    #[arg(long = "upstream-host", default_value = "127.0.0.1")]
    pub upstream_host: String,

    /// Static-forward upstream port.
    #[arg(long = "upstream-port", default_value_t = 8080)]
    pub upstream_port: u16,

    /// Comma-separated `src_host:src_port/dst_host:dst_port` rules, each yielding
    /// an independent listener. Overrides --host/--port/--upstream-host/--upstream-port.
    #[arg(long = "port-mapping")]
    pub port_mapping: Option<String>,

    /// Operating mode.
    #[arg(long, value_enum, default_value_t = Mode::Forward)]
    pub mode: Mode,

    /// SOCKS5 pinned destination host: every negotiated target is rewritten to this host.
    #[arg(short = 'd', long = "desthost")]
    pub desthost: Option<String>,

    /// SOCKS5 port rewrite, `src:dst,...` with `*` as the default target port.
    #[arg(short = 'm', long = "mapports")]
    pub mapports: Option<String>,

    /// Total added round-trip-time in milliseconds; half is applied per direction.
    #[arg(short = 'r', long = "rtt", default_value_t = 0)]
    pub rtt_ms: u64,

    /// Download (upstream -> client) cap in kbps. 0 = unlimited.
    #[arg(short = 'i', long = "inkbps", default_value_t = 0)]
    pub inkbps: u64,

    /// Upload (client -> upstream) cap in kbps. 0 = unlimited.
    #[arg(short = 'o', long = "outkbps", default_value_t = 0)]
    pub outkbps: u64,

    /// Enable debug-level logs.
    #[arg(short = 'v', long)]
    pub verbose: bool,
}

/// Per-direction latency and bandwidth ceiling.
#[derive(Clone, Copy, Debug)]
pub struct ShaperConfig {
    /// Half of the configured round trip, applied in each direction, in seconds.
    pub latency_half_rtt: f64,
    /// Upstream -> client ceiling in bytes/s. 0 = unlimited.
    pub in_bps: u64,
    /// Client -> upstream ceiling in bytes/s. 0 = unlimited.
    pub out_bps: u64,
    /// Whether `in_bps` is actually enforced on the ingress direction.
    ///
    /// The original source both enables and disables ingress shaping across
    /// revisions. This workspace takes `--inkbps` as binding on ingress and
    /// keeps this field only as a documented escape hatch, not CLI surface.
    pub shape_ingress: bool,
}

impl ShaperConfig {
    pub fn from_cli(cli: &Cli) -> Self {
        Self {
            latency_half_rtt: cli.rtt_ms as f64 / 2000.0,
            in_bps: kbps_to_bps(cli.inkbps),
            out_bps: kbps_to_bps(cli.outkbps),
            shape_ingress: true,
        }
    }
}

/// Converts a kbps ceiling (as taken from the CLI) to a bytes/s ceiling,
/// scaling by 1460/1500 to account for TCP/IP header overhead before the
/// kbit -> byte conversion. `0` is passed through unchanged and means
/// "unlimited" throughout the rest of the system.
pub fn kbps_to_bps(kbps: u64) -> u64 {
    if kbps == 0 {
        return 0;
    }
    ((kbps as f64) * 125.0 * (1460.0 / 1500.0)) as u64
}

/// `(listen_host, listen_port) -> (upstream_host, upstream_port)`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ListenerRule {
    pub listen_host: String,
    pub listen_port: u16,
    pub upstream_host: String,
    pub upstream_port: u16,
}

impl fmt::Display for ListenerRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.listen_host, self.listen_port, self.upstream_host, self.upstream_port
        )
    }
}

/// Parses `--port-mapping`, or falls back to a single rule built from
/// `--host`/`--port`/`--upstream-host`/`--upstream-port`.
pub fn listener_rules(cli: &Cli) -> Result<Vec<ListenerRule>, AppError> {
    match &cli.port_mapping {
        None => Ok(vec![ListenerRule {
            listen_host: cli.host.clone(),
            listen_port: cli.port,
            upstream_host: cli.upstream_host.clone(),
            upstream_port: cli.upstream_port,
        }]),
        Some(spec) => spec.split(',').map(parse_rule).collect(),
    }
}

fn parse_rule(entry: &str) -> Result<ListenerRule, AppError> {
    let (listen, upstream) = entry
        .split_once('/')
        .ok_or_else(|| AppError::Config(format!("malformed port-mapping entry: {entry}")))?;
    let (listen_host, listen_port) = split_host_port(listen)?;
    let (upstream_host, upstream_port) = split_host_port(upstream)?;
    Ok(ListenerRule {
        listen_host,
        listen_port,
        upstream_host,
        upstream_port,
    })
}

fn split_host_port(s: &str) -> Result<(String, u16), AppError> {
    let (host, port) = s
        .rsplit_once(':')
        .ok_or_else(|| AppError::Config(format!("malformed host:port entry: {s}")))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| AppError::Config(format!("malformed port in entry: {s}")))?;
    Ok((host.to_owned(), port))
}

/// SOCKS5 per-port rewrite table, used only in SOCKS mode.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PortRewrite {
    table: HashMap<u16, u16>,
    default: Option<u16>,
}

impl PortRewrite {
    /// Returns the rewritten port for `src_port`, or `src_port` unchanged
    /// if no explicit entry or default applies.
    pub fn rewrite(&self, src_port: u16) -> u16 {
        self.table
            .get(&src_port)
            .copied()
            .or(self.default)
            .unwrap_or(src_port)
    }
}

/// Parses `-m/--mapports`: `src:dst,...` with `*` as the default target port.
pub fn parse_port_rewrite(spec: Option<&str>) -> Result<PortRewrite, AppError> {
    let mut rewrite = PortRewrite::default();
    let Some(spec) = spec else {
        return Ok(rewrite);
    };

    for entry in spec.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (src, dst) = entry
            .split_once(':')
            .ok_or_else(|| AppError::Config(format!("malformed mapports entry: {entry}")))?;
        let dst: u16 = dst
            .parse()
            .map_err(|_| AppError::Config(format!("malformed target port in: {entry}")))?;

        if src == "*" {
            rewrite.default = Some(dst);
        } else {
            let src: u16 = src
                .parse()
                .map_err(|_| AppError::Config(format!("malformed source port in: {entry}")))?;
            rewrite.table.insert(src, dst);
        }
    }

    Ok(rewrite)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kbps_scaling_matches_overhead_formula() {
        // 1000 kbps -> 1000 * 125 * 1460/1500
        assert_eq!(kbps_to_bps(1000), (1000.0 * 125.0 * 1460.0 / 1500.0) as u64);
        assert_eq!(kbps_to_bps(0), 0);
    }

    #[test]
    fn parses_port_mapping_rules() {
        let cli = Cli {
            host: "127.0.0.1".into(),
            port: 8888,
            upstream_host: "127.0.0.1".into(),
            upstream_port: 8080,
            port_mapping: Some("0.0.0.0:9000/10.0.0.1:80,0.0.0.0:9001/10.0.0.1:81".into()),
            mode: Mode::Forward,
            desthost: None,
            mapports: None,
            rtt_ms: 0,
            inkbps: 0,
            outkbps: 0,
            verbose: false,
        };
        let rules = listener_rules(&cli).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].listen_port, 9000);
        assert_eq!(rules[0].upstream_host, "10.0.0.1");
        assert_eq!(rules[1].upstream_port, 81);
    }

    #[test]
    fn default_rule_falls_back_to_simple_flags() {
        let cli = Cli {
            host: "127.0.0.1".into(),
            port: 8887,
            upstream_host: "127.0.0.1".into(),
            upstream_port: 8888,
            port_mapping: None,
            mode: Mode::Forward,
            desthost: None,
            mapports: None,
            rtt_ms: 0,
            inkbps: 0,
            outkbps: 0,
            verbose: false,
        };
        let rules = listener_rules(&cli).unwrap();
        assert_eq!(rules, vec![ListenerRule {
            listen_host: "127.0.0.1".into(),
            listen_port: 8887,
            upstream_host: "127.0.0.1".into(),
            upstream_port: 8888,
        }]);
    }

    #[test]
    fn parses_mapports_with_default() {
        let rewrite = parse_port_rewrite(Some("80:8888,443:8443,*:9999")).unwrap();
        assert_eq!(rewrite.rewrite(80), 8888);
        assert_eq!(rewrite.rewrite(443), 8443);
        assert_eq!(rewrite.rewrite(12345), 9999);
    }

    #[test]
    fn no_rewrite_without_mapports() {
        let rewrite = parse_port_rewrite(None).unwrap();
        assert_eq!(rewrite.rewrite(80), 80);
    }
}
