use crate::proxy::GatewayHandler;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;

/// A client must finish sending request headers within this window.
pub const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Serve every request on one accepted connection.
///
/// `io` is the decrypted TLS stream in production and a plain TCP stream in
/// tests. HTTP/1.1 and HTTP/2 are both accepted; the handler itself never
/// fails, so an error here is always a transport or protocol problem.
///
/// When `shutdown` flips to `true` the connection is told to finish its
/// in-flight requests and close: idle keep-alive connections end at once,
/// HTTP/2 peers get a GOAWAY. A dropped sender means no shutdown is coming.
pub async fn serve_connection<I>(
    io: I,
    peer: SocketAddr,
    handler: Arc<GatewayHandler>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()>
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req| {
        let handler = Arc::clone(&handler);
        async move { Ok::<_, Infallible>(handler.handle(req, peer).await) }
    });

    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(HEADER_READ_TIMEOUT);

    let conn = builder.serve_connection(TokioIo::new(io), service);
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = shutdown_requested(&mut shutdown) => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };
    result.map_err(|e| anyhow::anyhow!("connection from {peer}: {e}"))
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}
