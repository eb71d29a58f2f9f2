// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Tollgate: API-key gated TLS reverse proxy
//
//  Data plane:  tokio multi-thread runtime, hyper (h1 + h2) over rustls
//  Admission:   static key file, checked per request
//  Upstream:    single plain-HTTP origin, pooled keepalive client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tollgate_core::ssl::{self, Provisioned};
use tollgate_core::{GatewayConfig, KeyStore, UpstreamTarget};
use tollgate_observability::AccessLogger;
use tollgate_proxy::{GatewayHandler, tls, worker};
use tracing::{error, info, warn};

/// Upper bound on waiting for the access log writer at exit. HTTP/2 stream
/// tasks spawned by hyper can outlive the accept loop and keep a logger clone.
const ACCESS_LOG_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "tollgate", version, about = "Tollgate: API-key gated TLS reverse proxy")]
struct Cli {
    /// Path to configuration file (defaults + TOLLGATE_* env when absent)
    #[arg(short, long, default_value = "tollgate.yaml")]
    config: PathBuf,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit diagnostics as JSON lines instead of text
    #[arg(long)]
    log_json: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // ── Tracing ──
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }

    info!(version = env!("CARGO_PKG_VERSION"), "Tollgate starting");

    #[cfg(unix)]
    raise_fd_limit();

    // ── Config ──
    let config = if cli.config.exists() {
        info!(path = %cli.config.display(), "Loading config file");
        GatewayConfig::load(&cli.config)
            .with_context(|| format!("loading config {}", cli.config.display()))?
    } else {
        info!("No config file found, using defaults");
        GatewayConfig::from_env().context("reading TOLLGATE_* environment")?
    };

    let workers = config.effective_workers();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .thread_name("tollgate-worker")
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    runtime.block_on(serve(config, workers))?;

    info!("Tollgate stopped");
    Ok(())
}

async fn serve(config: GatewayConfig, workers: usize) -> anyhow::Result<()> {
    // ── API keys ──
    let keys = KeyStore::load(&config.auth.keys_file)
        .with_context(|| format!("loading API keys from {}", config.auth.keys_file.display()))?;
    if keys.is_empty() {
        warn!(path = %config.auth.keys_file.display(), "Key file is empty, every request will be rejected");
    } else {
        info!(keys = keys.len(), "API keys loaded");
    }

    // ── TLS ──
    let (cert_path, key_path) = (&config.tls.cert_path, &config.tls.key_path);
    if ssl::ensure(cert_path, key_path).context("provisioning TLS certificate")? == Provisioned::Generated {
        warn!("Serving a self-signed certificate for localhost; clients must trust it explicitly");
    }
    let material = ssl::load(cert_path, key_path).context("loading TLS certificate")?;
    let acceptor = tls::build_acceptor(material).context("configuring TLS")?;

    // ── Upstream ──
    let upstream = UpstreamTarget::parse(&config.upstream.url).context("parsing upstream.url")?;

    // ── Access log (never fatal) ──
    let access_log = match AccessLogger::open(&config.access_log.path, config.access_log.buffer_size) {
        Ok(logger) => logger,
        Err(e) => {
            error!(
                path = %config.access_log.path.display(),
                error = %e,
                "Cannot open access log, continuing without it"
            );
            AccessLogger::disabled()
        }
    };

    let log_closer = access_log.clone();
    let handler = GatewayHandler::new(Arc::new(keys), Arc::new(upstream), access_log, &config)
        .context("building request handler")?;

    // ── Listener ──
    let listener = worker::bind(&config.listener.addr)
        .await
        .context("binding TLS listener")?;

    info!(
        addr = %config.listener.addr,
        upstream = %config.upstream.url,
        workers,
        "Tollgate is ready, serving traffic"
    );

    // The handler (and its logger clone) is dropped when run returns.
    worker::run(listener, acceptor, Arc::new(handler), shutdown_signal()).await;

    if tokio::time::timeout(ACCESS_LOG_FLUSH_TIMEOUT, log_closer.shutdown())
        .await
        .is_err()
    {
        warn!("Access log still busy at exit, pending records may be lost");
    }
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("SIGINT received, stopping"),
        _ = terminate => info!("SIGTERM received, stopping"),
    }
}

/// Raise RLIMIT_NOFILE towards min(hard limit, 65536). Each proxied request
/// holds a client socket plus a pooled upstream socket.
#[cfg(unix)]
fn raise_fd_limit() {
    const TARGET: libc::rlim_t = 65536;

    let mut limit = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
    // SAFETY: getrlimit/setrlimit only read and write the struct we pass.
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } != 0 {
        warn!("getrlimit(RLIMIT_NOFILE) failed, fd limit unchanged");
        return;
    }

    let wanted = if limit.rlim_max == libc::RLIM_INFINITY {
        TARGET
    } else {
        limit.rlim_max.min(TARGET)
    };
    if limit.rlim_cur >= wanted {
        return;
    }

    limit.rlim_cur = wanted;
    if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &limit) } != 0 {
        warn!(wanted = wanted as u64, "setrlimit(RLIMIT_NOFILE) failed, run 'ulimit -n 65536'");
    } else {
        info!(limit = wanted as u64, "File descriptor limit raised");
    }
}
