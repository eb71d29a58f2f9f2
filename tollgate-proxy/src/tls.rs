use rustls::ServerConfig;
use rustls::crypto::aws_lc_rs;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tollgate_core::{CertificateMaterial, GatewayError};
use tracing::info;

/// ALPN protocols offered to clients, most preferred first.
pub const ALPN_PROTOCOLS: [&[u8]; 2] = [b"h2", b"http/1.1"];

/// Build the TLS acceptor for the listener. No client certificates.
pub fn build_acceptor(material: CertificateMaterial) -> Result<TlsAcceptor, GatewayError> {
    let mut config = ServerConfig::builder_with_provider(Arc::new(aws_lc_rs::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| GatewayError::Tls(format!("protocol versions: {e}")))?
        .with_no_client_auth()
        .with_single_cert(material.certs, material.key)
        .map_err(|e| GatewayError::Tls(format!("certificate rejected: {e}")))?;

    config.alpn_protocols = ALPN_PROTOCOLS.iter().map(|p| p.to_vec()).collect();

    info!(alpn = "h2,http/1.1", "TLS acceptor ready");
    Ok(TlsAcceptor::from(Arc::new(config)))
}
