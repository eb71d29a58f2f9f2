use crate::observer::observe;
use bytes::Bytes;
use http::header::{
    CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, TE,
    TRAILER, TRANSFER_ENCODING, UPGRADE,
};
use http::{HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode, Version};
use http_body_util::{BodyExt, Empty, Full, combinators::UnsyncBoxBody};
use hyper::body::Incoming;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tollgate_core::{GatewayConfig, GatewayError, KeyStore, UpstreamTarget};
use tollgate_observability::{AccessLogger, AccessRecord};
use tracing::{debug, warn};

/// Body type of every response the gateway sends downstream.
pub type GatewayBody = UnsyncBoxBody<Bytes, hyper::Error>;

/// Headers that describe a single hop and are never forwarded.
const HOP_BY_HOP: [HeaderName; 9] = [
    CONNECTION,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
    PROXY_AUTHENTICATE,
    PROXY_AUTHORIZATION,
    TE,
    TRAILER,
    TRANSFER_ENCODING,
    UPGRADE,
];

/// Outcome of the API-key check for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Key is a member of the key store; forward upstream.
    Forward { key: String },
    /// Key missing or unknown; answer 403. `key` is what was presented
    /// (empty when the header was absent).
    Reject { key: String },
}

/// Per-request pipeline: admission, forwarding, access logging.
///
/// One instance is shared by all connections through an `Arc`; every field
/// is either immutable or internally synchronized.
pub struct GatewayHandler {
    keys: Arc<KeyStore>,
    upstream: Arc<UpstreamTarget>,
    access_log: AccessLogger,
    client: Client<HttpConnector, Incoming>,
    auth_header: HeaderName,
    timeout: Option<Duration>,
}

impl GatewayHandler {
    pub fn new(
        keys: Arc<KeyStore>,
        upstream: Arc<UpstreamTarget>,
        access_log: AccessLogger,
        config: &GatewayConfig,
    ) -> Result<Self, GatewayError> {
        let auth_header = HeaderName::from_bytes(config.auth.header.as_bytes()).map_err(|e| {
            GatewayError::ConfigError(format!("invalid auth header {:?}: {e}", config.auth.header))
        })?;

        let upstream_cfg = &config.upstream;
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        if upstream_cfg.connect_timeout_ms > 0 {
            connector.set_connect_timeout(Some(Duration::from_millis(upstream_cfg.connect_timeout_ms)));
        }

        let client = Client::builder(TokioExecutor::new())
            .pool_timer(TokioTimer::new())
            .pool_max_idle_per_host(upstream_cfg.keepalive_pool_size)
            .pool_idle_timeout(Duration::from_secs(upstream_cfg.pool_idle_timeout_secs))
            .build(connector);

        let timeout = (upstream_cfg.timeout_ms > 0).then(|| Duration::from_millis(upstream_cfg.timeout_ms));

        Ok(Self {
            keys,
            upstream,
            access_log,
            client,
            auth_header,
            timeout,
        })
    }

    pub fn upstream(&self) -> &UpstreamTarget {
        &self.upstream
    }

    /// Decide whether a request may be forwarded, based on its key header.
    ///
    /// The raw header bytes are compared, so keys outside visible ASCII
    /// match as long as they are valid UTF-8.
    pub fn admit(&self, headers: &HeaderMap) -> Admission {
        let Some(value) = headers.get(&self.auth_header) else {
            return Admission::Reject { key: String::new() };
        };
        match std::str::from_utf8(value.as_bytes()) {
            Ok(key) if self.keys.contains(key) => Admission::Forward { key: key.to_string() },
            Ok(key) => Admission::Reject { key: key.to_string() },
            Err(_) => Admission::Reject {
                key: String::from_utf8_lossy(value.as_bytes()).into_owned(),
            },
        }
    }

    /// Serve one request. Never fails: every outcome is an HTTP response,
    /// and every response produces exactly one access record.
    pub async fn handle(&self, req: Request<Incoming>, peer: SocketAddr) -> Response<GatewayBody> {
        let path = req.uri().path().to_string();

        match self.admit(req.headers()) {
            Admission::Reject { key } => {
                debug!(peer = %peer, path = %path, key_present = !key.is_empty(), "Request rejected");
                self.access_log.record(AccessRecord::rejected(key, path));
                forbidden()
            }
            Admission::Forward { key } => {
                let response = self.forward(req, peer).await;
                let access_log = self.access_log.clone();
                observe(response, move |observed| {
                    access_log.record(AccessRecord::new(
                        key,
                        path,
                        observed.bytes_written(),
                        observed.status().as_u16(),
                    ));
                })
                .map(BodyExt::boxed_unsync)
            }
        }
    }

    async fn forward(&self, mut req: Request<Incoming>, peer: SocketAddr) -> Response<GatewayBody> {
        if let Err(e) = rewrite_request(&mut req, &self.upstream) {
            warn!(peer = %peer, error = %e, "Cannot build upstream request");
            return error_response(&e);
        }

        let pending = self.client.request(req);
        let result = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, pending).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(
                        peer = %peer,
                        upstream = %self.upstream.authority(),
                        timeout_ms = limit.as_millis() as u64,
                        "Upstream timed out"
                    );
                    return error_response(&GatewayError::UpstreamTimeout);
                }
            },
            None => pending.await,
        };

        match result {
            Ok(mut response) => {
                strip_hop_by_hop(response.headers_mut());
                response.map(BodyExt::boxed_unsync)
            }
            Err(e) => {
                warn!(
                    peer = %peer,
                    upstream = %self.upstream.authority(),
                    error = %e,
                    "Upstream request failed"
                );
                error_response(&GatewayError::Upstream(e.to_string()))
            }
        }
    }
}

/// Point `req` at the upstream origin.
///
/// Path and query are kept (joined under the upstream base path), `Host`
/// becomes the upstream authority and hop-by-hop headers are dropped.
/// Method, body and all other headers are left as they are.
pub fn rewrite_request<B>(req: &mut Request<B>, upstream: &UpstreamTarget) -> Result<(), GatewayError> {
    let uri = upstream.uri_for(req.uri().path_and_query())?;
    *req.uri_mut() = uri;
    *req.version_mut() = Version::HTTP_11;

    let headers = req.headers_mut();
    strip_hop_by_hop(headers);
    headers.insert(HOST, upstream.host_header().clone());
    Ok(())
}

/// Remove hop-by-hop headers, including any listed in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
}

/// 403 with an empty body.
pub fn forbidden() -> Response<GatewayBody> {
    let mut response = Response::new(
        Empty::<Bytes>::new()
            .map_err(|never| match never {})
            .boxed_unsync(),
    );
    *response.status_mut() = StatusCode::FORBIDDEN;
    response
        .headers_mut()
        .insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
    response
}

/// JSON error response for a gateway-side failure.
pub fn error_response(err: &GatewayError) -> Response<GatewayBody> {
    let body = err.to_json_body();
    let len = body.len();

    let mut response = Response::new(
        Full::new(Bytes::from(body))
            .map_err(|never| match never {})
            .boxed_unsync(),
    );
    *response.status_mut() =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
    response
}
