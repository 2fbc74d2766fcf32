//! Startup configuration.

use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use http::Uri;
use serde::Deserialize;
use thiserror::Error;

use crate::allowlist::AllowListError;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid DNS endpoint {0:?}: expected an absolute http(s) URL")]
    InvalidEndpoint(String),
    #[error(transparent)]
    AllowList(#[from] AllowListError),
}

/// Timeouts applied to upstream and client I/O.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct TimeoutConfig {
    /// Upper bound for establishing an upstream TCP connection.
    #[serde(default = "default_dial_secs")]
    pub dial_secs: u64,
    /// Upper bound for a whole forwarded request or DoH query.
    #[serde(default = "default_request_secs")]
    pub request_secs: u64,
    /// Read timeout on client connections (request headers and the
    /// handshake reads before a tunnel starts relaying).
    #[serde(default = "default_read_secs")]
    pub read_secs: u64,
}

impl TimeoutConfig {
    pub fn dial(&self) -> Duration {
        Duration::from_secs(self.dial_secs)
    }

    pub fn request(&self) -> Duration {
        Duration::from_secs(self.request_secs)
    }

    pub fn read(&self) -> Duration {
        Duration::from_secs(self.read_secs)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            dial_secs: default_dial_secs(),
            request_secs: default_request_secs(),
            read_secs: default_read_secs(),
        }
    }
}

/// Proxy configuration file format.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ProxyConfig {
    #[serde(default = "default_listen_address")]
    pub listen_address: IpAddr,

    #[serde(default = "default_port")]
    pub port: u16,

    /// File with one exact hostname per line.
    #[serde(default = "default_domain_list")]
    pub domain_list: PathBuf,

    /// File with one regular expression per line.
    #[serde(default = "default_domain_regex_list")]
    pub domain_regex_list: PathBuf,

    /// DNS-over-HTTPS endpoint queried with `application/dns-json`.
    #[serde(default = "default_dns_endpoint")]
    pub dns_endpoint: String,

    /// Skip certificate validation on the DoH endpoint.
    #[serde(default = "default_skip_dns_tls_verify")]
    pub skip_dns_tls_verify: bool,

    /// Only accept resolved addresses that answer a TCP connect.
    #[serde(default = "default_probe_addresses")]
    pub probe_addresses: bool,

    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

fn default_listen_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    8080
}

fn default_domain_list() -> PathBuf {
    PathBuf::from("domains.txt")
}

fn default_domain_regex_list() -> PathBuf {
    PathBuf::from("domains-regex.txt")
}

fn default_dns_endpoint() -> String {
    "https://1.0.0.1/dns-query".to_string()
}

fn default_skip_dns_tls_verify() -> bool {
    cfg!(windows)
}

fn default_probe_addresses() -> bool {
    true
}

fn default_dial_secs() -> u64 {
    7
}

fn default_request_secs() -> u64 {
    15
}

fn default_read_secs() -> u64 {
    10
}

impl ProxyConfig {
    /// Loads config from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parses config from a YAML string.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_address, self.port)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let uri: Uri = self
            .dns_endpoint
            .parse()
            .map_err(|_| ConfigError::InvalidEndpoint(self.dns_endpoint.clone()))?;

        let scheme_ok = matches!(uri.scheme_str(), Some("http") | Some("https"));
        if !scheme_ok || uri.host().is_none() {
            return Err(ConfigError::InvalidEndpoint(self.dns_endpoint.clone()));
        }

        Ok(())
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            port: default_port(),
            domain_list: default_domain_list(),
            domain_regex_list: default_domain_regex_list(),
            dns_endpoint: default_dns_endpoint(),
            skip_dns_tls_verify: default_skip_dns_tls_verify(),
            probe_addresses: default_probe_addresses(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE_CONFIG: &str = r#"
port: 3128
domain-list: /etc/sni-fragment-proxy/domains.txt
dns-endpoint: "https://dns.example/dns-query"
skip-dns-tls-verify: true
timeouts:
  dial-secs: 3
"#;

    /// Tests parsing a partial YAML file; omitted keys take their defaults.
    #[test]
    fn parse_example_config() {
        let config = ProxyConfig::parse(EXAMPLE_CONFIG).unwrap();
        assert_eq!(config.port, 3128);
        assert_eq!(
            config.domain_list,
            PathBuf::from("/etc/sni-fragment-proxy/domains.txt")
        );
        assert_eq!(config.domain_regex_list, PathBuf::from("domains-regex.txt"));
        assert_eq!(config.dns_endpoint, "https://dns.example/dns-query");
        assert!(config.skip_dns_tls_verify);
        assert!(config.probe_addresses);
        assert_eq!(config.timeouts.dial(), Duration::from_secs(3));
        assert_eq!(config.timeouts.request(), Duration::from_secs(15));
        assert_eq!(config.timeouts.read(), Duration::from_secs(10));
    }

    /// Tests the built-in defaults.
    #[test]
    fn defaults() {
        let config = ProxyConfig::default();
        assert_eq!(config.listen_addr(), "0.0.0.0:8080".parse().unwrap());
        assert_eq!(config.dns_endpoint, "https://1.0.0.1/dns-query");
        assert_eq!(config.skip_dns_tls_verify, cfg!(windows));
        assert!(config.validate().is_ok());
    }

    /// Tests that endpoints without an http(s) scheme are rejected.
    #[test]
    fn invalid_endpoint_rejected() {
        for endpoint in ["1.0.0.1/dns-query", "ftp://1.0.0.1/dns-query", "not a url"] {
            let config = ProxyConfig {
                dns_endpoint: endpoint.to_string(),
                ..ProxyConfig::default()
            };
            assert!(
                matches!(config.validate(), Err(ConfigError::InvalidEndpoint(_))),
                "{endpoint} accepted"
            );
        }
    }

    /// Tests that unknown keys are reported instead of silently ignored.
    #[test]
    fn unknown_key_rejected() {
        assert!(ProxyConfig::parse("prot: 8080\n").is_err());
    }
}
