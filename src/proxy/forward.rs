//! Plain HTTP forwarding.

use std::io::Read;
use std::net::SocketAddr;
use std::time::Duration;

use flate2::read::{GzDecoder, ZlibDecoder};
use http::header::{CONTENT_ENCODING, CONTENT_LENGTH, HOST, HeaderMap, HeaderValue, TRANSFER_ENCODING};
use http::{Request, Response, Uri};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tokio::time::timeout;
use tracing::debug;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

type ForwardBody = UnsyncBoxBody<Bytes, BoxError>;

/// Headers addressed to the proxy itself.
const PROXY_HEADERS: &[&str] = &["proxy-connection", "proxy-authorization"];

/// Pooled HTTP/1.1 client relaying non-CONNECT requests.
#[derive(Clone)]
pub struct ForwardClient {
    client: Client<HttpConnector, ForwardBody>,
    request_timeout: Duration,
}

impl ForwardClient {
    pub fn new(dial_timeout: Duration, request_timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(dial_timeout));
        connector.set_happy_eyeballs_timeout(Some(Duration::from_millis(300)));
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(15 * 60))
            .build(connector);

        Self {
            client,
            request_timeout,
        }
    }

    /// Sends `req` to `endpoint` and returns the response with its body
    /// collected and decoded.
    ///
    /// The request keeps its `Host` header; only the connection target is
    /// replaced by the resolved endpoint.
    pub async fn forward<B>(
        &self,
        req: Request<B>,
        endpoint: SocketAddr,
    ) -> Result<Response<Full<Bytes>>, ForwardError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let (mut parts, body) = req.into_parts();

        if !parts.headers.contains_key(HOST)
            && let Some(authority) = parts.uri.authority()
            && let Ok(host) = HeaderValue::from_str(authority.as_str())
        {
            parts.headers.insert(HOST, host);
        }
        for name in PROXY_HEADERS {
            parts.headers.remove(*name);
        }

        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .to_string();
        parts.uri = format!("http://{endpoint}{path}")
            .parse::<Uri>()
            .map_err(|e| ForwardError::InvalidUri(e.to_string()))?;

        debug!("forwarding {} {} to {}", parts.method, path, endpoint);

        let body = body.map_err(|e| -> BoxError { e.into() }).boxed_unsync();
        let req = Request::from_parts(parts, body);
        let exchange = async {
            let response = self
                .client
                .request(req)
                .await
                .map_err(|source| ForwardError::UpstreamUnreachable { endpoint, source })?;
            let (parts, body) = response.into_parts();
            let body = body.collect().await.map_err(ForwardError::Body)?.to_bytes();
            Ok::<_, ForwardError>((parts, body))
        };

        let (mut parts, body) = timeout(self.request_timeout, exchange)
            .await
            .map_err(|_| ForwardError::UpstreamTimeout(endpoint))??;

        let body = decode_body(&mut parts.headers, body)?;
        Ok(Response::from_parts(parts, Full::new(body)))
    }
}

/// Undoes `gzip` or `deflate` content encoding.
///
/// Bodies without `Content-Encoding` are returned unchanged. The body is
/// always fully collected, so a chunked transfer encoding is replaced by an
/// explicit length.
fn decode_body(headers: &mut HeaderMap, body: Bytes) -> Result<Bytes, ForwardError> {
    if headers.remove(TRANSFER_ENCODING).is_some() {
        headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
    }

    let Some(encoding) = headers.get(CONTENT_ENCODING) else {
        return Ok(body);
    };
    let encoding = encoding
        .to_str()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    let mut decoded = Vec::new();
    match encoding.as_str() {
        "" | "identity" => return Ok(body),
        "gzip" | "x-gzip" => GzDecoder::new(&body[..])
            .read_to_end(&mut decoded)
            .map_err(ForwardError::Decode)?,
        "deflate" => ZlibDecoder::new(&body[..])
            .read_to_end(&mut decoded)
            .map_err(ForwardError::Decode)?,
        _ => return Err(ForwardError::UnsupportedEncoding(encoding)),
    };

    headers.remove(CONTENT_ENCODING);
    headers.insert(CONTENT_LENGTH, HeaderValue::from(decoded.len()));
    Ok(Bytes::from(decoded))
}

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("invalid upstream URI: {0}")]
    InvalidUri(String),
    #[error("upstream {endpoint} unreachable: {source}")]
    UpstreamUnreachable {
        endpoint: SocketAddr,
        #[source]
        source: hyper_util::client::legacy::Error,
    },
    #[error("upstream {0} timed out")]
    UpstreamTimeout(SocketAddr),
    #[error("failed to read upstream body: {0}")]
    Body(#[source] hyper::Error),
    #[error("response content encoding not supported: {0}")]
    UnsupportedEncoding(String),
    #[error("failed to decode response body: {0}")]
    Decode(#[source] std::io::Error),
}
