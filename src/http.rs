use std::{error::Error, fmt::Debug, net::SocketAddr, str::FromStr, sync::Arc, time::Duration};

use bon::Builder;
use bytes::Bytes;
use http::{Uri, Version};
use http_body_util::{BodyExt, Empty, combinators::BoxBody};
use hyper::{
    Request, Response, StatusCode,
    body::Body,
    header::{HOST, UPGRADE},
};
use hyper_util::rt::TokioIo;
use metrics::counter;
use tokio::{
    io::copy_bidirectional_with_sizes,
    net::TcpStream,
    time::timeout,
};
use tracing::{debug, warn};

use crate::{
    host::{decode_alias_host, decode_host},
    lookup::InstanceLookup,
    telemetry::TELEMETRY_COUNTER_HTTP_REQUESTS,
};

const X_FORWARDED_FOR: &str = "X-Forwarded-For";
const X_FORWARDED_HOST: &str = "X-Forwarded-Host";
const X_FORWARDED_PROTO: &str = "X-Forwarded-Proto";
const X_FORWARDED_PORT: &str = "X-Forwarded-Port";

#[derive(thiserror::Error, Debug)]
pub(crate) enum HttpError {
    #[error("Hyper error: {0}")]
    HyperError(#[from] hyper::Error),
    #[error("Host doesn't identify an instance")]
    UnknownHost,
    #[error("Backend is unreachable")]
    BackendUnreachable,
    #[error("Header to string error: {0}")]
    HeaderToStrError(#[from] http::header::ToStrError),
    #[error("Missing URI host")]
    MissingUriHost,
    #[error("Missing Host header")]
    MissingHostHeader,
    #[error("Invalid Host header")]
    InvalidHostHeader,
    #[error("Invalid HTTP version {0:?}")]
    InvalidHttpVersion(Version),
    #[error("Missing Upgrade header")]
    MissingUpgradeHeader,
    #[error("Request timeout")]
    RequestTimeout,
}

impl HttpError {
    fn status(&self) -> StatusCode {
        match self {
            HttpError::HeaderToStrError(_)
            | HttpError::MissingUriHost
            | HttpError::MissingHostHeader
            | HttpError::InvalidHostHeader
            | HttpError::InvalidHttpVersion(_)
            | HttpError::MissingUpgradeHeader => StatusCode::BAD_REQUEST,
            HttpError::RequestTimeout => StatusCode::REQUEST_TIMEOUT,
            HttpError::UnknownHost => StatusCode::NOT_FOUND,
            HttpError::BackendUnreachable => StatusCode::BAD_GATEWAY,
            HttpError::HyperError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Where the director decided a request should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DirectedTarget {
    pub(crate) scheme: &'static str,
    pub(crate) host: String,
    pub(crate) port: u16,
}

impl DirectedTarget {
    pub(crate) fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// Port 443 means the backend itself speaks TLS, so the forwarded scheme
// flips to https (and wss for upgrades).
fn scheme_for(port: u16) -> &'static str {
    if port == 443 { "https" } else { "http" }
}

// Data commonly reused between HTTP proxy requests.
#[derive(Builder)]
pub(crate) struct HttpProxy {
    // Instance storage to resolve decoded identities against.
    lookup: Arc<dyn InstanceLookup>,
    // Buffer size for bidirectional copying.
    buffer_size: usize,
    // Optional duration until an outgoing request is canceled.
    http_request_timeout: Option<Duration>,
    // Optional duration until an established WebSocket connection is canceled.
    websocket_timeout: Option<Duration>,
}

impl HttpProxy {
    // Map a Host header (no port suffix stripped) to the outbound dial
    // target. The port encoded in the hostname always wins; the explicit
    // `:port` suffix is the fallback, then plain 80.
    pub(crate) async fn director(&self, host: &str) -> Result<DirectedTarget, HttpError> {
        if let Ok(identity) = decode_host(host) {
            let (dial_host, _) = self
                .lookup
                .resolve_by_address(&identity.session_id, &identity.instance_address)
                .await
                .map_err(|_| HttpError::UnknownHost)?;
            let port = match (identity.encoded_port, identity.explicit_port) {
                (encoded, _) if encoded > 0 => encoded,
                (_, explicit) if explicit > 0 => explicit,
                _ => 80,
            };
            return Ok(DirectedTarget {
                scheme: scheme_for(port),
                host: dial_host,
                port,
            });
        }
        let identity = decode_alias_host(host).map_err(|_| HttpError::UnknownHost)?;
        let address = self
            .lookup
            .resolve_by_alias(&identity.alias, &identity.session_prefix)
            .await
            .map_err(|_| HttpError::UnknownHost)?;
        let port = if identity.encoded_port > 0 {
            identity.encoded_port
        } else {
            80
        };
        Ok(DirectedTarget {
            scheme: scheme_for(port),
            host: address,
            port,
        })
    }
}

fn status_response(status: StatusCode) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut response = Response::new(
        Empty::<Bytes>::new()
            .map_err(|never| match never {})
            .boxed(),
    );
    *response.status_mut() = status;
    response
}

// Receive an HTTP request and appropriately proxy it, with a possible upgrade
// to WebSocket.
pub(crate) async fn proxy_handler<B>(
    request: Request<B>,
    tcp_address: SocketAddr,
    proxy: Arc<HttpProxy>,
) -> color_eyre::Result<Response<BoxBody<Bytes, hyper::Error>>>
where
    B: Body + Debug + Send + Unpin + 'static,
    <B as Body>::Data: Send + Sync + 'static,
    <B as Body>::Error: Error + Send + Sync + 'static,
{
    match proxy_handler_inner(request, tcp_address, proxy).await {
        Ok(response) => Ok(response),
        Err(error) => {
            debug!(%error, "HTTP proxy error.");
            Ok(status_response(error.status()))
        }
    }
}

#[tracing::instrument(skip(proxy), level = "debug")]
async fn proxy_handler_inner<B>(
    mut request: Request<B>,
    tcp_address: SocketAddr,
    proxy: Arc<HttpProxy>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, HttpError>
where
    B: Body + Debug + Send + Unpin + 'static,
    <B as Body>::Data: Send + Sync + 'static,
    <B as Body>::Error: Error + Send + Sync + 'static,
{
    // Retrieve host from the headers. The whole header value goes to the
    // director; an explicit port suffix is part of the routing grammar.
    let host = match request.version() {
        Version::HTTP_2 => {
            let uri = request.uri();
            let host = uri.host().ok_or(HttpError::MissingUriHost)?;
            match uri.port_u16() {
                Some(port) => format!("{host}:{port}"),
                None => host.to_owned(),
            }
        }
        Version::HTTP_11 | Version::HTTP_10 => match request.headers().get(HOST) {
            Some(header_value) => header_value
                .to_str()
                .map_err(|_| HttpError::InvalidHostHeader)?
                .to_owned(),
            None => return Err(HttpError::MissingHostHeader),
        },
        version => return Err(HttpError::InvalidHttpVersion(version)),
    };
    let target = proxy.director(&host).await?;
    let backend = TcpStream::connect(target.authority())
        .await
        .map_err(|_| HttpError::BackendUnreachable)?;
    counter!(TELEMETRY_COUNTER_HTTP_REQUESTS).increment(1);
    let ip = tcp_address.ip().to_canonical().to_string();
    debug!(%host, authority = %target.authority(), %ip, "Proxying HTTP request.");

    // Add proxied info to the proper headers
    let bare_host = host.split(':').next().unwrap_or(&host).to_owned();
    let headers = request.headers_mut();
    if let Ok(value) = ip.parse() {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Ok(value) = bare_host.parse() {
        headers.insert(X_FORWARDED_HOST, value);
    }
    if let Ok(value) = target.scheme.parse() {
        headers.insert(X_FORWARDED_PROTO, value);
    }
    headers.insert(X_FORWARDED_PORT, target.port.into());

    // Ensure best-effort compatibility of the proxied request with the
    // HTTP/1.1 format the backend handshake speaks.
    if let Ok(value) = http::HeaderValue::from_str(&host) {
        request.headers_mut().entry(HOST).or_insert(value);
    }
    if let Some(path) = request
        .uri()
        .path_and_query()
        .and_then(|path| Uri::from_str(path.as_str()).ok())
    {
        *request.uri_mut() = path;
    }

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(backend)).await?;

    // Check for an Upgrade header
    if let Some(request_upgrade) = request.headers().get(UPGRADE) {
        tokio::spawn(async move {
            if let Err(error) = conn.with_upgrades().await {
                warn!(%error, "HTTP/1.1 connection with upgrades failed.");
            }
        });
        let request_type = request_upgrade.to_str()?.to_string();
        // Retrieve the OnUpgrade from the incoming request
        let upgraded_request = hyper::upgrade::on(&mut request);
        let mut response = send_with_timeout(&mut sender, request, &proxy).await?;
        // Check if the underlying server accepts the Upgrade request
        if response.status() == StatusCode::SWITCHING_PROTOCOLS
            && request_type
                == response
                    .headers()
                    .get(UPGRADE)
                    .ok_or(HttpError::MissingUpgradeHeader)?
                    .to_str()?
        {
            // Retrieve the upgraded connection from the response
            let upgraded_response = hyper::upgrade::on(&mut response).await?;
            let websocket_timeout = proxy.websocket_timeout;
            let buffer_size = proxy.buffer_size;
            // Start a task to copy data between the two upgraded parts
            tokio::spawn(async move {
                let Ok(upgraded_request) = upgraded_request.await else {
                    return;
                };
                let mut upgraded_request = TokioIo::new(upgraded_request);
                let mut upgraded_response = TokioIo::new(upgraded_response);
                match websocket_timeout {
                    Some(duration) => {
                        let _ = timeout(
                            duration,
                            copy_bidirectional_with_sizes(
                                &mut upgraded_response,
                                &mut upgraded_request,
                                buffer_size,
                                buffer_size,
                            ),
                        )
                        .await;
                    }
                    None => {
                        let _ = copy_bidirectional_with_sizes(
                            &mut upgraded_response,
                            &mut upgraded_request,
                            buffer_size,
                            buffer_size,
                        )
                        .await;
                    }
                }
            });
        }
        Ok(response.map(BodyExt::boxed))
    } else {
        // If the Upgrade header is not present, simply handle the request
        tokio::spawn(async move {
            if let Err(error) = conn.await {
                warn!(%error, "HTTP/1.1 connection failed.");
            }
        });
        let response = send_with_timeout(&mut sender, request, &proxy).await?;
        Ok(response.map(BodyExt::boxed))
    }
}

async fn send_with_timeout<B>(
    sender: &mut hyper::client::conn::http1::SendRequest<B>,
    request: Request<B>,
    proxy: &HttpProxy,
) -> Result<Response<hyper::body::Incoming>, HttpError>
where
    B: Body + Send + 'static,
    <B as Body>::Data: Send + Sync + 'static,
    <B as Body>::Error: Error + Send + Sync + 'static,
{
    match proxy.http_request_timeout {
        Some(duration) => timeout(duration, sender.send_request(request))
            .await
            .map_err(|_| HttpError::RequestTimeout)?
            .map_err(HttpError::from),
        None => sender.send_request(request).await.map_err(HttpError::from),
    }
}

#[cfg(test)]
mod director_tests {
    use mockall::predicate::eq;

    use super::*;
    use crate::lookup::{LookupError, MockInstanceLookup};

    fn proxy(lookup: MockInstanceLookup) -> HttpProxy {
        HttpProxy::builder()
            .lookup(Arc::new(lookup))
            .buffer_size(8_192)
            .build()
    }

    fn passthrough_lookup() -> MockInstanceLookup {
        let mut lookup = MockInstanceLookup::new();
        lookup
            .expect_resolve_by_address()
            .returning(|_, address| Ok((address.to_owned(), 80)));
        lookup
    }

    #[tokio::test]
    async fn encoded_port_wins() {
        let proxy = proxy(passthrough_lookup());
        let target = proxy
            .director("ip10-0-0-1-aabb-8080.foo.bar")
            .await
            .unwrap();
        assert_eq!(
            target,
            DirectedTarget {
                scheme: "http",
                host: "10.0.0.1".into(),
                port: 8080
            }
        );
    }

    #[tokio::test]
    async fn defaults_to_port_80() {
        let proxy = proxy(passthrough_lookup());
        let target = proxy.director("ip10-0-0-1-aabb.foo.bar").await.unwrap();
        assert_eq!(target.port, 80);
        assert_eq!(target.scheme, "http");
    }

    #[tokio::test]
    async fn explicit_port_applies_without_encoded_port() {
        let proxy = proxy(passthrough_lookup());
        let target = proxy
            .director("ip10-0-0-1-aabb.foo.bar:9090")
            .await
            .unwrap();
        assert_eq!(target.port, 9090);
    }

    #[tokio::test]
    async fn encoded_port_beats_explicit_port() {
        let proxy = proxy(passthrough_lookup());
        let target = proxy
            .director("ip10-0-0-1-aabb-8080.foo.bar:9090")
            .await
            .unwrap();
        assert_eq!(target.port, 8080);
    }

    #[tokio::test]
    async fn port_443_switches_scheme_to_https() {
        let proxy = proxy(passthrough_lookup());
        let target = proxy
            .director("ip10-0-0-1-aabb-443.foo.bar")
            .await
            .unwrap();
        assert_eq!(target.scheme, "https");
    }

    #[tokio::test]
    async fn undecodable_host_is_rejected() {
        let proxy = proxy(MockInstanceLookup::new());
        assert!(matches!(
            proxy.director("lala10-0-0-1-aabb.foo.bar").await,
            Err(HttpError::UnknownHost)
        ));
    }

    #[tokio::test]
    async fn unknown_instance_is_rejected() {
        let mut lookup = MockInstanceLookup::new();
        lookup
            .expect_resolve_by_address()
            .returning(|_, _| Err(LookupError::UnknownInstance));
        let proxy = proxy(lookup);
        assert!(proxy.director("ip10-0-0-1-aabb.foo.bar").await.is_err());
    }

    #[tokio::test]
    async fn alias_host_is_directed() {
        let mut lookup = MockInstanceLookup::new();
        lookup
            .expect_resolve_by_alias()
            .with(eq("my-alias"), eq("abcd1234"))
            .returning(|_, _| Ok("10.0.0.7".into()));
        let proxy = proxy(lookup);
        let target = proxy
            .director("pwdmy-alias-abcd1234-3000.foo.bar")
            .await
            .unwrap();
        assert_eq!(
            target,
            DirectedTarget {
                scheme: "http",
                host: "10.0.0.7".into(),
                port: 3000
            }
        );
    }
}
