//! HTTP proxy that fragments TLS handshakes for selected domains.
//!
//! This crate provides a forward/transparent HTTP proxy. Clients open
//! `CONNECT` tunnels or send plain HTTP requests; every destination is
//! resolved through a DNS-over-HTTPS endpoint and cached for the lifetime of
//! the process.
//!
//! # Architecture
//!
//! For each request the proxy:
//! 1. Extracts and validates the destination host
//! 2. Resolves it through the DoH cache
//! 3. For `CONNECT`, dials the upstream, answers `200` and takes over the
//!    raw client connection
//! 4. For other methods, forwards the request and decodes the response body
//!
//! # Handshake fragmentation
//!
//! Hostnames listed in the domain list, or matching a pattern of the regex
//! list, are "proxied": the first client bytes of their tunnels are scanned
//! for the hostname, and the chunk carrying it is written upstream as two
//! separate TCP segments split one byte into the hostname, so neither
//! segment carries it whole. Everything after that is relayed unchanged.
//!
//! # Example
//!
//! ```no_run
//! use sni_fragment_proxy::{Proxy, ProxyConfig};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = ProxyConfig::load("proxy.yaml")?;
//! let proxy = Proxy::new(config);
//! proxy.bind().await?.run().await;
//! # Ok(())
//! # }
//! ```

mod allowlist;
pub mod config;
pub mod proxy;

pub use allowlist::{AllowListError, DomainClassifier, DomainRules};
pub use config::{ConfigError, ProxyConfig, TimeoutConfig};
pub use proxy::{ProxyServer, ProxyState};

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

/// Startup wiring: loads the rule files and binds the listener.
pub struct Proxy {
    config: ProxyConfig,
}

impl Proxy {
    pub fn new(config: ProxyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Validates the configuration, loads both rule files and binds the
    /// listener. Fails when both rule files are empty.
    pub async fn bind(&self) -> Result<ProxyServer> {
        let config = &self.config;
        config.validate()?;

        let rules = DomainRules::load(&config.domain_list, &config.domain_regex_list)
            .map_err(ConfigError::from)
            .with_context(|| {
                format!(
                    "failed to load domain rules from {:?} and {:?}",
                    config.domain_list, config.domain_regex_list
                )
            })?;
        info!(
            "loaded {} domains and {} patterns",
            rules.exact_count(),
            rules.pattern_count()
        );

        let state = ProxyState::new(config, Arc::new(rules))
            .context("failed to set up DNS-over-HTTPS client")?;
        let server = ProxyServer::bind(
            config.listen_addr(),
            Arc::new(state),
            config.timeouts.read(),
        )
        .await
        .with_context(|| format!("failed to listen on {}", config.listen_addr()))?;

        Ok(server)
    }
}
