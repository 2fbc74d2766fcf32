//! Forward HTTP proxy with handshake fragmentation.
//!
//! `CONNECT` requests become raw tunnels. For classified hostnames the
//! client's first bytes are split one byte into the plaintext hostname, so
//! the TLS ClientHello reaches the upstream in two TCP segments and neither
//! holds the hostname whole. Other requests are forwarded over a pooled
//! client with their bodies decoded.
//!
//! Every destination is resolved through DNS-over-HTTPS and the answer is
//! kept for the lifetime of the process.

mod doh;
mod forward;
mod relay;
mod resolver;
mod server;
#[cfg(test)]
mod testing;
mod tls;
mod tunnel;

pub use doh::{DohAnswer, DohClient, DohError, DohResponse};
pub use forward::{BoxError, ForwardClient, ForwardError};
pub use relay::{Direction, RelaySummary, relay};
pub use resolver::{AddressResolver, HostPort, InvalidHost, ResolveError};
pub use server::{ProxyServer, ProxyState, RequestError, handle_request};
pub use tunnel::{Fragmentation, HANDSHAKE_CHUNK_SIZE, Tunnel, TunnelError};
