//! Certificate provisioning for the TLS listener.
//!
//! On first start the gateway has no certificate; [`ensure`] writes a
//! self-signed RSA-2048 pair covering `localhost` so the listener can come
//! up. Existing files are reused as-is without any expiry check. [`load`]
//! turns the two PEM files into DER material for rustls.

use crate::error::GatewayError;
use rcgen::{CertificateParams, DnType, KeyPair, PKCS_RSA_SHA256, SerialNumber};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Write};
use std::path::Path;
use time::{Duration, OffsetDateTime};
use tracing::info;

/// Hostname the self-signed certificate is issued for.
pub const SELF_SIGNED_HOST: &str = "localhost";

/// Validity of a generated certificate.
pub const SELF_SIGNED_VALIDITY_DAYS: i64 = 365;

/// Certificate chain and private key, ready for the TLS acceptor.
#[derive(Debug)]
pub struct CertificateMaterial {
    pub certs: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

/// Outcome of [`ensure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provisioned {
    /// Both files were already present and left untouched.
    Existing,
    /// A new self-signed pair was written.
    Generated,
}

/// Make sure a certificate/key pair exists at the given paths.
pub fn ensure(cert_path: &Path, key_path: &Path) -> Result<Provisioned, GatewayError> {
    if cert_path.exists() && key_path.exists() {
        info!(cert = %cert_path.display(), "Using existing TLS certificate");
        return Ok(Provisioned::Existing);
    }

    let key_pair = KeyPair::generate_for(&PKCS_RSA_SHA256)?;
    let cert = self_signed_params(OffsetDateTime::now_utc())?.self_signed(&key_pair)?;

    write_pem(cert_path, cert.pem().as_bytes(), false)?;
    write_pem(key_path, key_pair.serialize_pem().as_bytes(), true)?;

    info!(
        cert = %cert_path.display(),
        key = %key_path.display(),
        host = SELF_SIGNED_HOST,
        days = SELF_SIGNED_VALIDITY_DAYS,
        "Generated self-signed TLS certificate"
    );
    Ok(Provisioned::Generated)
}

/// Parameters for the self-signed certificate, valid from `now` for 365 days.
pub fn self_signed_params(now: OffsetDateTime) -> Result<CertificateParams, GatewayError> {
    let mut params = CertificateParams::new(vec![SELF_SIGNED_HOST.to_string()])?;
    params
        .distinguished_name
        .push(DnType::CommonName, SELF_SIGNED_HOST);
    // Single-node gateway: a fixed serial is fine.
    params.serial_number = Some(SerialNumber::from(1u64));
    params.not_before = now;
    params.not_after = now + Duration::days(SELF_SIGNED_VALIDITY_DAYS);
    Ok(params)
}

/// Load PEM-encoded certificate chain and private key.
pub fn load(cert_path: &Path, key_path: &Path) -> Result<CertificateMaterial, GatewayError> {
    let certs = load_certificates(cert_path)?;
    let key = load_private_key(key_path)?;
    info!(certs = certs.len(), path = %cert_path.display(), "TLS certificate loaded");
    Ok(CertificateMaterial { certs, key })
}

fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, GatewayError> {
    let file = File::open(path).map_err(|e| {
        GatewayError::Certificate(format!("cannot open {}: {e}", path.display()))
    })?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| GatewayError::Certificate(format!("cannot parse {}: {e}", path.display())))?;

    if certs.is_empty() {
        return Err(GatewayError::Certificate(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, GatewayError> {
    let file = File::open(path).map_err(|e| {
        GatewayError::Certificate(format!("cannot open {}: {e}", path.display()))
    })?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| GatewayError::Certificate(format!("cannot parse {}: {e}", path.display())))?
        .ok_or_else(|| {
            GatewayError::Certificate(format!("no private key found in {}", path.display()))
        })
}

fn write_pem(path: &Path, pem: &[u8], private: bool) -> Result<(), GatewayError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    if private {
        owner_only(&mut options);
    }

    let mut file = options.open(path)?;
    file.write_all(pem)?;
    file.sync_all()?;
    Ok(())
}

#[cfg(unix)]
fn owner_only(options: &mut OpenOptions) {
    use std::os::unix::fs::OpenOptionsExt;
    options.mode(0o600);
}

#[cfg(not(unix))]
fn owner_only(_options: &mut OpenOptions) {}
