//! DoH (DNS over HTTPS) queries in the `application/dns-json` format.

use std::net::Ipv4Addr;
use std::time::Duration;

use http::header::{ACCEPT, HOST};
use http::{Request, StatusCode, Uri};
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use super::tls::TlsConnector;

/// Content type requested from the resolver.
const DNS_JSON_CONTENT_TYPE: &str = "application/dns-json";

/// DNS record type for IPv4 addresses.
const RECORD_TYPE_A: u16 = 1;

/// Client for a JSON DNS-over-HTTPS resolver.
pub struct DohClient {
    endpoint: Endpoint,
    tls: Option<TlsConnector>,
    dial_timeout: Duration,
    request_timeout: Duration,
}

/// Parsed resolver URL.
#[derive(Debug, Clone)]
struct Endpoint {
    /// Host to dial and to present for SNI, without IPv6 brackets.
    host: String,
    port: u16,
    /// Value sent in the `Host` header.
    authority: String,
    /// Path plus any query string already present in the URL.
    path: String,
}

impl Endpoint {
    fn parse(url: &str) -> Result<(Self, bool), DohError> {
        let invalid = || DohError::InvalidEndpoint(url.to_string());
        let uri: Uri = url.parse().map_err(|_| invalid())?;

        let https = match uri.scheme_str() {
            Some("https") => true,
            Some("http") => false,
            _ => return Err(invalid()),
        };
        let authority = uri.authority().ok_or_else(invalid)?;
        let host = authority
            .host()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        if host.is_empty() {
            return Err(invalid());
        }
        let port = authority.port_u16().unwrap_or(if https { 443 } else { 80 });
        let path = uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .to_string();

        let endpoint = Self {
            host,
            port,
            authority: authority.as_str().to_string(),
            path,
        };
        Ok((endpoint, https))
    }
}

impl DohClient {
    /// Creates a client for `endpoint`, an absolute `http` or `https` URL.
    pub fn new(
        endpoint: &str,
        skip_tls_verify: bool,
        dial_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, DohError> {
        let (endpoint, https) = Endpoint::parse(endpoint)?;
        let tls = https.then(|| TlsConnector::new(skip_tls_verify));

        Ok(Self {
            endpoint,
            tls,
            dial_timeout,
            request_timeout,
        })
    }

    /// Returns the request target used to look up the A records of `hostname`.
    pub fn query_path(&self, hostname: &str) -> String {
        let separator = if self.endpoint.path.contains('?') {
            '&'
        } else {
            '?'
        };
        format!(
            "{}{}ct={}&type=A&do=false&cd=false&name={}",
            self.endpoint.path, separator, DNS_JSON_CONTENT_TYPE, hostname
        )
    }

    /// Queries the A records of `hostname`.
    pub async fn query(&self, hostname: &str) -> Result<DohResponse, DohError> {
        timeout(self.request_timeout, self.exchange(hostname))
            .await
            .map_err(|_| DohError::Timeout)?
    }

    async fn exchange(&self, hostname: &str) -> Result<DohResponse, DohError> {
        let request = Request::get(self.query_path(hostname))
            .header(HOST, &self.endpoint.authority)
            .header(ACCEPT, DNS_JSON_CONTENT_TYPE)
            .body(Empty::<Bytes>::new())
            .map_err(DohError::Request)?;

        let addr = (self.endpoint.host.as_str(), self.endpoint.port);
        let stream = timeout(self.dial_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| DohError::Timeout)?
            .map_err(DohError::Connect)?;
        let _ = stream.set_nodelay(true);

        let body = match &self.tls {
            Some(tls) => {
                let stream = tls
                    .connect(stream, &self.endpoint.host)
                    .await
                    .map_err(DohError::Tls)?;
                send(stream, request).await?
            }
            None => send(stream, request).await?,
        };

        let response = DohResponse::from_json(&body)?;
        debug!(
            "DoH response for {}: status {} with {} answers",
            hostname,
            response.status,
            response.answers.len()
        );
        Ok(response)
    }
}

/// Sends one request over a fresh HTTP/1.1 connection and collects the body.
async fn send<S>(io: S, request: Request<Empty<Bytes>>) -> Result<Bytes, DohError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(io))
        .await
        .map_err(DohError::Http)?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!("DoH connection error: {}", e);
        }
    });

    let response = sender.send_request(request).await.map_err(DohError::Http)?;
    if !response.status().is_success() {
        return Err(DohError::Status(response.status()));
    }

    let body = response
        .into_body()
        .collect()
        .await
        .map_err(DohError::Http)?
        .to_bytes();
    Ok(body)
}

/// JSON answer of a DoH resolver.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DohResponse {
    /// DNS RCODE; 0 is success.
    #[serde(rename = "Status", default)]
    pub status: u32,
    #[serde(rename = "Answer", default)]
    pub answers: Vec<DohAnswer>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DohAnswer {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub record_type: u16,
    #[serde(rename = "TTL", default)]
    pub ttl: u32,
    pub data: String,
}

impl DohResponse {
    pub fn from_json(body: &[u8]) -> Result<Self, DohError> {
        serde_json::from_slice(body).map_err(DohError::Json)
    }

    /// IPv4 addresses from the A records, in response order.
    pub fn ipv4_addresses(&self) -> Vec<Ipv4Addr> {
        self.answers
            .iter()
            .filter(|answer| answer.record_type == RECORD_TYPE_A)
            .filter_map(|answer| answer.data.trim().parse().ok())
            .collect()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DohError {
    #[error("invalid DoH endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("failed to build DoH request: {0}")]
    Request(#[source] http::Error),
    #[error("failed to connect to DoH endpoint: {0}")]
    Connect(#[source] std::io::Error),
    #[error("TLS handshake with DoH endpoint failed: {0}")]
    Tls(#[source] std::io::Error),
    #[error("DoH HTTP error: {0}")]
    Http(#[source] hyper::Error),
    #[error("DoH endpoint answered {0}")]
    Status(StatusCode),
    #[error("invalid DoH answer: {0}")]
    Json(#[source] serde_json::Error),
    #[error("DoH query timed out")]
    Timeout,
}
