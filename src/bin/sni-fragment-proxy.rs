use anyhow::{Context, Result};
use clap::Parser;
use sni_fragment_proxy::{Proxy, ProxyConfig};
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// HTTP proxy that splits the TLS handshake of selected domains.
///
/// Tunnels to hostnames in the domain list (or matching the regex list) have
/// their first client bytes split where the hostname starts. All hostnames
/// are resolved through DNS-over-HTTPS.
#[derive(Parser, Debug)]
#[command(name = "sni-fragment-proxy")]
#[command(version, about)]
struct Args {
    /// Path to a YAML configuration file. Flags override its values.
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Address to listen on.
    #[arg(long)]
    listen: Option<IpAddr>,

    /// Port to listen on.
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// File with one domain name per line.
    #[arg(short = 'd', long = "domains")]
    domain_list: Option<PathBuf>,

    /// File with one regular expression per line.
    #[arg(short = 'r', long = "regex")]
    domain_regex_list: Option<PathBuf>,

    /// DNS-over-HTTPS endpoint.
    #[arg(long = "dns")]
    dns_endpoint: Option<String>,

    /// Skip certificate validation on the DNS-over-HTTPS endpoint (yes/no).
    #[arg(long, value_parser = parse_yes_no)]
    skip_dns_tls_verify: Option<bool>,
}

fn parse_yes_no(value: &str) -> Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "yes" | "true" => Ok(true),
        "no" | "false" => Ok(false),
        _ => Err(format!("expected yes or no, got {value:?}")),
    }
}

impl Args {
    /// Overrides `config` with every flag that was given.
    fn apply(self, config: &mut ProxyConfig) {
        if let Some(listen) = self.listen {
            config.listen_address = listen;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(path) = self.domain_list {
            config.domain_list = path;
        }
        if let Some(path) = self.domain_regex_list {
            config.domain_regex_list = path;
        }
        if let Some(endpoint) = self.dns_endpoint {
            config.dns_endpoint = endpoint;
        }
        if let Some(skip) = self.skip_dns_tls_verify {
            config.skip_dns_tls_verify = skip;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let mut args = Args::parse();

    let mut config = match args.config.take() {
        Some(path) => ProxyConfig::load(&path)
            .with_context(|| format!("failed to load config from {:?}", path))?,
        None => ProxyConfig::default(),
    };
    args.apply(&mut config);

    info!("listen address: {}", config.listen_addr());
    info!("domain list: {}", config.domain_list.display());
    info!("domain regex list: {}", config.domain_regex_list.display());
    info!("DNS endpoint: {}", config.dns_endpoint);
    info!("skip DNS TLS verification: {}", config.skip_dns_tls_verify);

    let proxy = Proxy::new(config);
    proxy.bind().await?.run().await;

    Ok(())
}
