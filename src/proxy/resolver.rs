//! Host parsing and cached DNS-over-HTTPS resolution.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{LazyLock, RwLock};
use std::time::Duration;

use regex::Regex;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

use super::doh::{DohClient, DohError};

static DOMAIN_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^([a-zA-Z0-9_][a-zA-Z0-9_-]{0,62})(\.[a-zA-Z0-9_][a-zA-Z0-9_-]{0,62})*[._]?$",
    )
    .expect("domain name pattern is valid")
});

/// Destination named by a request, e.g. `example.com:443`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostPort {
    pub hostname: String,
    pub port: u16,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid host {host:?}: {reason}")]
pub struct InvalidHost {
    pub host: String,
    pub reason: &'static str,
}

impl HostPort {
    /// Splits `host[:port]`, using `default_port` when the port is missing.
    ///
    /// IPv6 literals must be bracketed (`[::1]:443`).
    pub fn parse(host: &str, default_port: u16) -> Result<Self, InvalidHost> {
        let invalid = |reason| InvalidHost {
            host: host.to_string(),
            reason,
        };

        let (hostname, port) = if let Some(rest) = host.strip_prefix('[') {
            let (hostname, after) = rest.split_once(']').ok_or_else(|| invalid("missing ']'"))?;
            match after {
                "" => (hostname, None),
                _ => {
                    let port = after
                        .strip_prefix(':')
                        .ok_or_else(|| invalid("unexpected characters after ']'"))?;
                    (hostname, Some(port))
                }
            }
        } else {
            match host.matches(':').count() {
                0 => (host, None),
                1 => {
                    let (hostname, port) = host.split_once(':').ok_or_else(|| invalid("bad port"))?;
                    (hostname, Some(port))
                }
                _ => return Err(invalid("too many colons")),
            }
        };

        if hostname.is_empty() {
            return Err(invalid("empty hostname"));
        }
        let port = match port {
            None => default_port,
            Some(port) => port.parse().map_err(|_| invalid("bad port"))?,
        };

        Ok(Self {
            hostname: hostname.to_string(),
            port,
        })
    }

    /// Cache key: the literal `hostname:port`.
    pub fn cache_key(&self) -> String {
        cache_key(&self.hostname, self.port)
    }
}

fn cache_key(hostname: &str, port: u16) -> String {
    format!("{hostname}:{port}")
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.hostname.contains(':') {
            write!(f, "[{}]:{}", self.hostname, self.port)
        } else {
            write!(f, "{}:{}", self.hostname, self.port)
        }
    }
}

/// Resolves destinations through DoH and remembers the answer forever.
///
/// Entries are never expired or invalidated. Concurrent first lookups of the
/// same destination each query the resolver; the first answer stored wins.
pub struct AddressResolver {
    doh: DohClient,
    cache: RwLock<HashMap<String, SocketAddr>>,
    /// Only accept addresses that answer a TCP connect.
    probe: bool,
    dial_timeout: Duration,
    queries: AtomicU64,
}

impl fmt::Debug for AddressResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressResolver")
            .field("cache", &"<RwLock>")
            .field("probe", &self.probe)
            .field("queries", &self.queries)
            .finish()
    }
}

impl AddressResolver {
    pub fn new(doh: DohClient, probe: bool, dial_timeout: Duration) -> Self {
        Self {
            doh,
            cache: RwLock::new(HashMap::new()),
            probe,
            dial_timeout,
            queries: AtomicU64::new(0),
        }
    }

    /// Resolves `hostname:port` to a dialable address.
    pub async fn resolve(&self, hostname: &str, port: u16) -> Result<SocketAddr, ResolveError> {
        let key = cache_key(hostname, port);
        if let Some(addr) = self.cached_key(&key) {
            return Ok(addr);
        }

        let addr = match hostname.parse::<IpAddr>() {
            Ok(ip) => SocketAddr::new(ip, port),
            Err(_) => {
                if !DOMAIN_NAME.is_match(hostname) {
                    return Err(ResolveError::InvalidHostname(hostname.to_string()));
                }
                self.lookup(hostname, port).await?
            }
        };

        let Ok(mut cache) = self.cache.write() else {
            return Ok(addr);
        };
        let stored = *cache.entry(key).or_insert(addr);
        debug!("cached {}:{} -> {}", hostname, port, stored);

        Ok(stored)
    }

    /// Returns the cached address of `hostname:port`, if any.
    pub fn cached(&self, hostname: &str, port: u16) -> Option<SocketAddr> {
        self.cached_key(&cache_key(hostname, port))
    }

    /// Number of DoH queries issued so far.
    pub fn queries(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    fn cached_key(&self, key: &str) -> Option<SocketAddr> {
        let cache = self.cache.read().ok()?;
        cache.get(key).copied()
    }

    async fn lookup(&self, hostname: &str, port: u16) -> Result<SocketAddr, ResolveError> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        let response = self
            .doh
            .query(hostname)
            .await
            .map_err(|source| ResolveError::DnsQueryFailed {
                host: hostname.to_string(),
                source,
            })?;

        let candidates = response.ipv4_addresses();
        info!("resolved {}: {:?}", hostname, candidates);

        for ip in candidates {
            let addr = SocketAddr::new(IpAddr::V4(ip), port);
            if !self.probe {
                return Ok(addr);
            }
            match timeout(self.dial_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(_)) => return Ok(addr),
                Ok(Err(e)) => debug!("{} is not usable for {}: {}", addr, hostname, e),
                Err(_) => debug!("{} is not usable for {}: connect timed out", addr, hostname),
            }
        }

        Err(ResolveError::NoUsableAddress(format!("{hostname}:{port}")))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("invalid hostname: {0:?}")]
    InvalidHostname(String),
    #[error("DNS query for {host} failed: {source}")]
    DnsQueryFailed {
        host: String,
        #[source]
        source: DohError,
    },
    #[error("no usable address for {0}")]
    NoUsableAddress(String),
}
