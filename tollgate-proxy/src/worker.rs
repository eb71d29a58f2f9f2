use crate::connection::serve_connection;
use crate::proxy::GatewayHandler;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;
use tollgate_core::GatewayError;
use tracing::{debug, error, info, warn};

/// Pause after a failed accept (e.g. fd exhaustion) before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// How long open connections may keep running once shutdown is requested.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// A peer that has not completed the TLS handshake by then is dropped.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Bind the listener socket. Failure here is fatal at startup.
pub async fn bind(addr: &str) -> Result<TcpListener, GatewayError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| GatewayError::Bind {
            addr: addr.to_string(),
            source,
        })?;
    info!(addr = %addr, "Listener bound");
    Ok(listener)
}

/// Accept loop. Each connection gets its own task: TLS handshake, then HTTP
/// serving. A failed handshake or broken connection only affects that task.
///
/// Once `shutdown` resolves no new connections are accepted and open ones
/// are asked to close gracefully. They get up to [`DRAIN_TIMEOUT`] to finish
/// before they are aborted and the function returns.
pub async fn run<F>(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    handler: Arc<GatewayHandler>,
    shutdown: F,
) where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let mut connections = JoinSet::new();
    let (stop_tx, stop_rx) = watch::channel(false);

    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, upstream = %handler.upstream().authority(), "Gateway accepting connections");
    }

    loop {
        let (stream, peer) = tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown requested, no longer accepting connections");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            },
        };

        // Reap finished connection tasks so the set stays small.
        while connections.try_join_next().is_some() {}

        // TCP_NODELAY: responses are often small streamed chunks
        let _ = stream.set_nodelay(true);

        let acceptor = acceptor.clone();
        let handler = Arc::clone(&handler);
        let stop = stop_rx.clone();
        connections.spawn(async move {
            let tls = match handshake(&acceptor, stream, HANDSHAKE_TIMEOUT).await {
                Ok(tls) => tls,
                Err(e) => {
                    debug!(peer = %peer, error = %e, "TLS handshake failed");
                    return;
                }
            };
            if let Err(e) = serve_connection(tls, peer, handler, stop).await {
                debug!(peer = %peer, error = %e, "Connection ended with error");
            }
        });
    }

    drop(listener);
    let _ = stop_tx.send(true);
    if connections.is_empty() {
        return;
    }

    info!(open = connections.len(), "Waiting for open connections to finish");
    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(aborted = connections.len(), "Drain timeout reached, closing remaining connections");
        connections.shutdown().await;
    }
}

/// TLS handshake bounded by `limit`.
pub async fn handshake(
    acceptor: &TlsAcceptor,
    stream: TcpStream,
    limit: Duration,
) -> Result<TlsStream<TcpStream>, GatewayError> {
    match tokio::time::timeout(limit, acceptor.accept(stream)).await {
        Ok(Ok(tls)) => Ok(tls),
        Ok(Err(e)) => Err(GatewayError::Tls(e.to_string())),
        Err(_) => Err(GatewayError::Tls(format!(
            "handshake not completed within {}ms",
            limit.as_millis()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::build_acceptor;
    use tollgate_core::ssl;

    #[tokio::test]
    async fn bind_reports_address_in_use() {
        let taken = bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap().to_string();

        let err = bind(&addr).await.unwrap_err();
        match err {
            GatewayError::Bind { addr: reported, .. } => assert_eq!(reported, addr),
            other => panic!("expected Bind error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn bind_rejects_unparseable_address() {
        assert!(matches!(
            bind("not-an-address").await,
            Err(GatewayError::Bind { .. })
        ));
    }

    #[tokio::test]
    async fn silent_client_hits_the_handshake_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let (cert, key) = (dir.path().join("cert.pem"), dir.path().join("key.pem"));
        ssl::ensure(&cert, &key).unwrap();
        let acceptor = build_acceptor(ssl::load(&cert, &key).unwrap()).unwrap();

        let listener = bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Connects and never sends a ClientHello.
        let _silent = TcpStream::connect(addr).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            handshake(&acceptor, stream, Duration::from_millis(100)),
        )
        .await
        .expect("handshake should give up on its own");
        assert!(matches!(outcome, Err(GatewayError::Tls(_))));
    }
}
