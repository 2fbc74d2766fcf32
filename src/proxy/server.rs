//! Proxy listener and request routing.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http::header::{CONTENT_TYPE, HOST, HeaderValue};
use http::{Method, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::{Body, Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use super::doh::{DohClient, DohError};
use super::forward::{BoxError, ForwardClient, ForwardError};
use super::resolver::{AddressResolver, HostPort, InvalidHost, ResolveError};
use super::tunnel::{Tunnel, TunnelError};
use crate::allowlist::{DomainClassifier, DomainRules};
use crate::config::ProxyConfig;

/// Port assumed when the request names none.
const DEFAULT_PORT: u16 = 80;

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// State shared by every connection.
pub struct ProxyState {
    classifier: DomainClassifier,
    resolver: AddressResolver,
    tunnel: Tunnel,
    forward: ForwardClient,
}

impl ProxyState {
    pub fn new(config: &ProxyConfig, rules: Arc<DomainRules>) -> Result<Self, DohError> {
        let timeouts = &config.timeouts;
        let doh = DohClient::new(
            &config.dns_endpoint,
            config.skip_dns_tls_verify,
            timeouts.dial(),
            timeouts.request(),
        )?;

        Ok(Self {
            classifier: DomainClassifier::new(rules),
            resolver: AddressResolver::new(doh, config.probe_addresses, timeouts.dial()),
            tunnel: Tunnel::new(timeouts.dial(), timeouts.read()),
            forward: ForwardClient::new(timeouts.dial(), timeouts.request()),
        })
    }

    pub fn classifier(&self) -> &DomainClassifier {
        &self.classifier
    }

    pub fn resolver(&self) -> &AddressResolver {
        &self.resolver
    }
}

/// The HTTP proxy server.
pub struct ProxyServer {
    state: Arc<ProxyState>,
    listener: TcpListener,
    read_timeout: Duration,
}

impl ProxyServer {
    /// Binds the listener. `read_timeout` bounds reading request headers.
    pub async fn bind(
        addr: SocketAddr,
        state: Arc<ProxyState>,
        read_timeout: Duration,
    ) -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        info!("proxy server listening on {}", listener.local_addr()?);

        Ok(Self {
            state,
            listener,
            read_timeout,
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.listener.local_addr()
    }

    /// Accepts connections forever. Accept errors are logged and retried.
    pub async fn run(self) {
        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };
            debug!("accepted connection from {}", peer_addr);

            let state = Arc::clone(&self.state);
            let read_timeout = self.read_timeout;
            spawn_isolated(
                format!("connection from {peer_addr}"),
                serve_connection(stream, peer_addr, state, read_timeout),
            );
        }
    }
}

/// Spawns `fut` on its own task and logs it if it panics.
fn spawn_isolated<F>(label: String, fut: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let handle = tokio::spawn(fut);
    tokio::spawn(async move {
        if let Err(e) = handle.await
            && e.is_panic()
        {
            error!("{} panicked: {}", label, e);
        }
    });
}

/// Serves HTTP/1.1 on one client connection.
async fn serve_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<ProxyState>,
    read_timeout: Duration,
) {
    let _ = stream.set_nodelay(true);
    let service = service_fn(move |req: Request<Incoming>| handle_request(req, Arc::clone(&state)));

    if let Err(e) = http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(read_timeout)
        .keep_alive(true)
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades()
        .await
    {
        debug!("connection error from {}: {}", peer_addr, e);
    }
}

/// Routes one request: validate the host, resolve it, then tunnel
/// (`CONNECT`) or forward (everything else).
///
/// Failures become plain-text error responses; the connection stays up.
pub async fn handle_request<B>(
    req: Request<B>,
    state: Arc<ProxyState>,
) -> Result<Response<Full<Bytes>>, Infallible>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    let method = req.method().clone();
    let host = request_host(&req);
    debug!("request: {} {} (host {:?})", method, req.uri(), host);

    match route(req, &state, &host).await {
        Ok(response) => Ok(response),
        Err(e) => {
            warn!("{} {:?} rejected: {}", method, host, e);
            Ok(e.into_response())
        }
    }
}

async fn route<B>(
    req: Request<B>,
    state: &ProxyState,
    host: &str,
) -> Result<Response<Full<Bytes>>, RequestError>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    if host.is_empty() {
        return Err(RequestError::InvalidHost(InvalidHost {
            host: String::new(),
            reason: "missing host",
        }));
    }
    let target = HostPort::parse(host, DEFAULT_PORT)?;
    let endpoint = state.resolver.resolve(&target.hostname, target.port).await?;
    debug!("{} resolved to {}", target, endpoint);

    if req.method() == Method::CONNECT {
        open_tunnel(req, state, target, endpoint).await
    } else {
        Ok(state.forward.forward(req, endpoint).await?)
    }
}

/// Dials the upstream, then hands the upgraded client connection to a
/// tunnel task once the `200` has been sent.
async fn open_tunnel<B>(
    req: Request<B>,
    state: &ProxyState,
    target: HostPort,
    endpoint: SocketAddr,
) -> Result<Response<Full<Bytes>>, RequestError>
where
    B: Send + 'static,
{
    let upstream = state
        .tunnel
        .connect_upstream(endpoint)
        .await
        .map_err(RequestError::UpstreamConnect)?;
    let fragment = state.classifier.is_proxied(&target.hostname);
    let tunnel = state.tunnel.clone();

    spawn_isolated(format!("tunnel to {target}"), async move {
        let client = match hyper::upgrade::on(req).await {
            Ok(upgraded) => TokioIo::new(upgraded),
            Err(e) => {
                debug!("tunnel to {} closed: {}", target, TunnelError::Upgrade(e));
                return;
            }
        };

        match tunnel.run(client, upstream, &target.hostname, fragment).await {
            Ok(summary) => debug!(
                "tunnel to {} closed: {:?} finished after {} bytes",
                target, summary.finished, summary.bytes
            ),
            Err(e) => debug!("tunnel to {} closed: {}", target, e),
        }
    });

    Ok(Response::new(Full::new(Bytes::new())))
}

/// Host named by the request: the request-target authority when present
/// (without userinfo), otherwise the `Host` header.
fn request_host<B>(req: &Request<B>) -> String {
    if let Some(authority) = req.uri().authority() {
        let host = authority.as_str();
        return host.rsplit('@').next().unwrap_or(host).to_string();
    }

    req.headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .unwrap_or_default()
}

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error(transparent)]
    InvalidHost(#[from] InvalidHost),
    #[error("{0}")]
    Resolution(#[from] ResolveError),
    #[error("{0}")]
    UpstreamConnect(#[source] TunnelError),
    #[error("{0}")]
    Forward(#[from] ForwardError),
}

impl RequestError {
    pub fn status(&self) -> StatusCode {
        match self {
            RequestError::InvalidHost(_) => StatusCode::BAD_REQUEST,
            RequestError::Resolution(_)
            | RequestError::UpstreamConnect(_)
            | RequestError::Forward(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn into_response(self) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(Bytes::from(format!("{self}\n"))));
        *response.status_mut() = self.status();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::testing::closed_port;
    use http_body_util::{BodyExt, Empty};

    /// State whose DoH resolver refuses connections.
    async fn state() -> Arc<ProxyState> {
        let unreachable = closed_port().await;
        let config = ProxyConfig {
            dns_endpoint: format!("http://{unreachable}/dns-query"),
            ..ProxyConfig::default()
        };
        let rules = DomainRules::parse("example.com\n", "").unwrap();
        Arc::new(ProxyState::new(&config, Arc::new(rules)).unwrap())
    }

    async fn body_text(response: Response<Full<Bytes>>) -> String {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(body.to_vec()).unwrap()
    }

    /// Tests that a malformed host is refused with 400 before any resolution.
    #[tokio::test]
    async fn malformed_host_is_bad_request() {
        let state = state().await;
        let req = Request::get("/")
            .header(HOST, "::::")
            .body(Empty::<Bytes>::new())
            .unwrap();

        let response = handle_request(req, Arc::clone(&state)).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_text(response).await.contains("::::"));
        assert_eq!(state.resolver().queries(), 0);
        assert_eq!(state.resolver().cached("::::", 80), None);
        assert_eq!(state.classifier().evaluations(), 0);
    }

    /// Tests that a request without any host is refused with 400.
    #[tokio::test]
    async fn missing_host_is_bad_request() {
        let state = state().await;
        let req = Request::get("/").body(Empty::<Bytes>::new()).unwrap();

        let response = handle_request(req, Arc::clone(&state)).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.resolver().queries(), 0);
    }

    /// Tests that a failed DNS query answers 500.
    #[tokio::test]
    async fn resolution_failure_is_server_error() {
        let state = state().await;
        let req = Request::get("http://example.com/")
            .body(Empty::<Bytes>::new())
            .unwrap();

        let response = handle_request(req, Arc::clone(&state)).await.unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(state.resolver().queries(), 1);
        assert_eq!(state.resolver().cached("example.com", 80), None);
    }

    /// Tests that an unreachable CONNECT target answers 500 and is never
    /// classified.
    #[tokio::test]
    async fn connect_to_closed_port_is_server_error() {
        let state = state().await;
        let target = closed_port().await;
        let req = Request::connect(target.to_string())
            .body(Empty::<Bytes>::new())
            .unwrap();

        let response = handle_request(req, Arc::clone(&state)).await.unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(state.classifier().cached("127.0.0.1"), None);
    }

    /// Tests host extraction from the request target and the Host header.
    #[test]
    fn host_sources() {
        let req = Request::connect("example.com:443").body(()).unwrap();
        assert_eq!(request_host(&req), "example.com:443");

        let req = Request::get("http://user:pw@example.com:8080/x")
            .body(())
            .unwrap();
        assert_eq!(request_host(&req), "example.com:8080");

        let req = Request::get("/x")
            .header(HOST, " example.com ")
            .body(())
            .unwrap();
        assert_eq!(request_host(&req), "example.com");

        let req = Request::get("/x").body(()).unwrap();
        assert_eq!(request_host(&req), "");
    }

    /// Tests the status mapping of request errors.
    #[test]
    fn error_statuses() {
        let invalid = RequestError::from(HostPort::parse("::::", 80).unwrap_err());
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);

        let resolution = RequestError::from(ResolveError::NoUsableAddress("x:80".into()));
        assert_eq!(resolution.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let encoding = RequestError::from(ForwardError::UnsupportedEncoding("br".into()));
        assert_eq!(encoding.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
