//! Resolved-address cache for the SOCKS5 pinned-destination path.
//!
//! Grounded on `util.py`'s `_DNS_CACHE`/`resolve`: a host name is resolved
//! once and the chosen address reused for the lifetime of the process,
//! rather than re-resolved on every connection.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Mutex;

use tokio::net::lookup_host;

/// Process-wide cache mapping `host:port` to a resolved [`SocketAddr`].
pub struct DnsCache {
    entries: Mutex<HashMap<String, SocketAddr>>,
}

impl DnsCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Resolves `host:port`, returning a cached result if one exists.
    /// Ties are broken by taking the first address `lookup_host` returns.
    pub async fn resolve(&self, host: &str, port: u16) -> io::Result<SocketAddr> {
        let key = format!("{host}:{port}");

        if let Some(addr) = self.entries.lock().expect("dns cache mutex poisoned").get(&key) {
            return Ok(*addr);
        }

        let addr = lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no addresses for {host}")))?;

        self.entries
            .lock()
            .expect("dns cache mutex poisoned")
            .insert(key, addr);
        Ok(addr)
    }
}

impl Default for DnsCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_and_caches_literal_address() {
        let cache = DnsCache::new();
        let addr = cache.resolve("127.0.0.1", 8080).await.unwrap();
        assert_eq!(addr.port(), 8080);
        assert!(addr.ip().is_loopback());

        // Second call must hit the cache; same answer.
        let addr2 = cache.resolve("127.0.0.1", 8080).await.unwrap();
        assert_eq!(addr, addr2);
    }
}
