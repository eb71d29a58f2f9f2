#![allow(dead_code)]

use bytes::Bytes;
use http::{HeaderMap, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tollgate_core::{GatewayConfig, KeyStore, UpstreamTarget};
use tollgate_observability::{AccessLogger, AccessRecord};
use tollgate_proxy::GatewayHandler;
use tollgate_proxy::connection::serve_connection;

pub const KEYS: &str = "abc123\ndef456\nghi789\n";

/// Loopback HTTP/1.1 origin that echoes what it received as JSON.
///
/// `/status/<code>` answers with that status, `/slow` waits a second first.
pub struct EchoUpstream {
    pub addr: SocketAddr,
    hits: Arc<AtomicUsize>,
}

impl EchoUpstream {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&hits);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let counter = Arc::clone(&counter);
                tokio::spawn(async move {
                    let service = service_fn(move |req| echo(req, Arc::clone(&counter)));
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self { addr, hits }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

async fn echo(
    req: Request<Incoming>,
    hits: Arc<AtomicUsize>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    hits.fetch_add(1, Ordering::SeqCst);

    let path = req.uri().path().to_string();
    if path == "/slow" {
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    let status = path
        .strip_prefix("/status/")
        .and_then(|code| code.parse::<u16>().ok())
        .and_then(|code| StatusCode::from_u16(code).ok())
        .unwrap_or(StatusCode::OK);

    let mut headers = serde_json::Map::new();
    for (name, value) in req.headers() {
        headers.insert(
            name.as_str().to_string(),
            serde_json::Value::String(value.to_str().unwrap_or_default().to_string()),
        );
    }

    let method = req.method().to_string();
    let query = req.uri().query().unwrap_or_default().to_string();
    let version = format!("{:?}", req.version());
    let body = req.into_body().collect().await.map(|c| c.to_bytes()).unwrap_or_default();

    let json = serde_json::json!({
        "method": method,
        "path": path,
        "query": query,
        "version": version,
        "headers": headers,
        "body": String::from_utf8_lossy(&body),
    });

    Ok(Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .header("x-upstream", "echo")
        .body(Full::new(Bytes::from(json.to_string())))
        .unwrap())
}

/// Handler over `KEYS`, pointed at `upstream_url`, logging to `log_path`.
pub fn handler(upstream_url: &str, log_path: &Path, config: GatewayConfig) -> Arc<GatewayHandler> {
    Arc::new(
        GatewayHandler::new(
            Arc::new(KeyStore::from_lines(KEYS)),
            Arc::new(UpstreamTarget::parse(upstream_url).unwrap()),
            AccessLogger::open(log_path, 1024).unwrap(),
            &config,
        )
        .unwrap(),
    )
}

/// Serve the gateway over plain TCP on an ephemeral loopback port.
/// Connections never receive a shutdown signal.
pub async fn spawn_plain_gateway(handler: Arc<GatewayHandler>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (_, stop) = watch::channel(false);
    tokio::spawn(async move {
        loop {
            let Ok((stream, peer)) = listener.accept().await else {
                return;
            };
            tokio::spawn(serve_connection(stream, peer, Arc::clone(&handler), stop.clone()));
        }
    });
    addr
}

/// A port nothing is listening on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

pub fn get(path: &str, key: Option<&str>) -> Request<Full<Bytes>> {
    let mut builder = Request::builder().method("GET").uri(path).header("host", "gateway.test");
    if let Some(key) = key {
        builder = builder.header("x-api-key", key);
    }
    builder.body(Full::new(Bytes::new())).unwrap()
}

pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Reply {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap()
    }
}

/// One HTTP/1.1 request on a fresh plain TCP connection.
pub async fn send(addr: SocketAddr, req: Request<Full<Bytes>>) -> Reply {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(conn);
    read_reply(sender.send_request(req).await.unwrap()).await
}

pub async fn read_reply(response: Response<Incoming>) -> Reply {
    let (parts, body) = response.into_parts();
    Reply {
        status: parts.status,
        headers: parts.headers,
        body: body.collect().await.unwrap().to_bytes(),
    }
}

/// Wait until the access log holds at least `expected` records.
pub async fn access_records(path: &Path, expected: usize) -> Vec<AccessRecord> {
    for _ in 0..300 {
        let content = tokio::fs::read_to_string(path).await.unwrap_or_default();
        let records: Vec<AccessRecord> = content
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        if records.len() >= expected {
            return records;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {expected} access records in {}", path.display());
}
