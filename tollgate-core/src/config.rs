use crate::error::GatewayError;
use figment::{Figment, providers::{Env, Format, Yaml}};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub access_log: AccessLogConfig,
}

/// TLS listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    #[serde(default = "default_listen_addr")]
    pub addr: String,
    /// Number of runtime worker threads. 0 = number of CPU cores.
    #[serde(default)]
    pub workers: usize,
}

/// The single upstream origin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_upstream_url")]
    pub url: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Deadline for the upstream response head. 0 = no deadline.
    #[serde(default)]
    pub timeout_ms: u64,
    /// Max idle keepalive connections kept to the upstream.
    #[serde(default = "default_keepalive_pool")]
    pub keepalive_pool_size: usize,
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

/// API-key authentication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Request header carrying the API key.
    #[serde(default = "default_auth_header")]
    pub header: String,
    /// Newline-delimited list of valid keys.
    #[serde(default = "default_keys_file")]
    pub keys_file: PathBuf,
}

/// Certificate and key locations. Generated on first start if missing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default = "default_cert_path")]
    pub cert_path: PathBuf,
    #[serde(default = "default_key_path")]
    pub key_path: PathBuf,
}

/// JSON-lines access log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessLogConfig {
    #[serde(default = "default_access_log_path")]
    pub path: PathBuf,
    /// Records queued for the writer before new ones are dropped.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

// ── Defaults ──────────────────────────────────────────────────

fn default_listen_addr() -> String { "0.0.0.0:8443".into() }
fn default_upstream_url() -> String { "http://localhost:11434".into() }
fn default_connect_timeout() -> u64 { 2000 }
fn default_keepalive_pool() -> usize { 256 }
fn default_pool_idle_timeout() -> u64 { 90 }
fn default_auth_header() -> String { "X-Api-Key".into() }
fn default_keys_file() -> PathBuf { "keys.txt".into() }
fn default_cert_path() -> PathBuf { "cert.pem".into() }
fn default_key_path() -> PathBuf { "key.pem".into() }
fn default_access_log_path() -> PathBuf { "gateway.log".into() }
fn default_buffer_size() -> usize { 10_000 }

// ── Impls ─────────────────────────────────────────────────────

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listener: ListenerConfig::default(),
            upstream: UpstreamConfig::default(),
            auth: AuthConfig::default(),
            tls: TlsConfig::default(),
            access_log: AccessLogConfig::default(),
        }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            addr: default_listen_addr(),
            workers: 0,
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: default_upstream_url(),
            connect_timeout_ms: default_connect_timeout(),
            timeout_ms: 0,
            keepalive_pool_size: default_keepalive_pool(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            header: default_auth_header(),
            keys_file: default_keys_file(),
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_path: default_cert_path(),
            key_path: default_key_path(),
        }
    }
}

impl Default for AccessLogConfig {
    fn default() -> Self {
        Self {
            path: default_access_log_path(),
            buffer_size: default_buffer_size(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from YAML file + env overrides.
    ///
    /// Env vars use the `TOLLGATE_` prefix and `__` between sections,
    /// e.g. `TOLLGATE_UPSTREAM__URL=http://10.0.0.5:8080`.
    pub fn load(path: &Path) -> Result<Self, GatewayError> {
        Ok(Self::figment(Figment::new().merge(Yaml::file(path))).extract()?)
    }

    /// Defaults + env overrides, for running without a config file.
    pub fn from_env() -> Result<Self, GatewayError> {
        Ok(Self::figment(Figment::new()).extract()?)
    }

    fn figment(base: Figment) -> Figment {
        base.merge(Env::prefixed("TOLLGATE_").split("__"))
    }

    /// Effective worker count (0 → available CPUs).
    pub fn effective_workers(&self) -> usize {
        if self.listener.workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            self.listener.workers
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    // ── Default values ────────────────────────────────────────────

    #[test]
    fn default_listener_config_has_expected_values() {
        let cfg = ListenerConfig::default();
        assert_eq!(cfg.addr, "0.0.0.0:8443");
        assert_eq!(cfg.workers, 0);
    }

    #[test]
    fn default_upstream_config_has_expected_values() {
        let cfg = UpstreamConfig::default();
        assert_eq!(cfg.url, "http://localhost:11434");
        assert_eq!(cfg.connect_timeout_ms, 2000);
        assert_eq!(cfg.timeout_ms, 0);
        assert_eq!(cfg.keepalive_pool_size, 256);
        assert_eq!(cfg.pool_idle_timeout_secs, 90);
    }

    #[test]
    fn default_auth_and_file_locations() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.auth.header, "X-Api-Key");
        assert_eq!(cfg.auth.keys_file, PathBuf::from("keys.txt"));
        assert_eq!(cfg.tls.cert_path, PathBuf::from("cert.pem"));
        assert_eq!(cfg.tls.key_path, PathBuf::from("key.pem"));
        assert_eq!(cfg.access_log.path, PathBuf::from("gateway.log"));
        assert_eq!(cfg.access_log.buffer_size, 10_000);
    }

    // ── effective_workers() ───────────────────────────────────────

    #[test]
    fn effective_workers_returns_explicit_value_when_nonzero() {
        let mut cfg = GatewayConfig::default();
        cfg.listener.workers = 4;
        assert_eq!(cfg.effective_workers(), 4);
    }

    #[test]
    fn effective_workers_with_zero_returns_at_least_one() {
        let cfg = GatewayConfig::default();
        let workers = cfg.effective_workers();
        assert!(workers >= 1, "effective_workers must be at least 1, got {workers}");
    }

    // ── GatewayConfig::load() ─────────────────────────────────────

    #[test]
    fn load_from_valid_yaml_overrides_defaults() {
        let mut tmpfile = tempfile::NamedTempFile::new().unwrap();
        write!(
            tmpfile,
            "listener:\n  addr: \"127.0.0.1:9443\"\n  workers: 2\nupstream:\n  url: \"http://10.0.0.5:8080\"\n"
        )
        .unwrap();
        let cfg = GatewayConfig::load(tmpfile.path()).unwrap();
        assert_eq!(cfg.listener.addr, "127.0.0.1:9443");
        assert_eq!(cfg.listener.workers, 2);
        assert_eq!(cfg.upstream.url, "http://10.0.0.5:8080");
        // Defaults still apply for unspecified fields
        assert_eq!(cfg.upstream.connect_timeout_ms, 2000);
        assert_eq!(cfg.auth.header, "X-Api-Key");
    }

    #[test]
    fn load_yaml_with_file_locations() {
        let yaml = r#"
auth:
  header: "Authorization-Key"
  keys_file: "/etc/tollgate/keys.txt"
tls:
  cert_path: "/etc/tollgate/tls/cert.pem"
  key_path: "/etc/tollgate/tls/key.pem"
access_log:
  path: "/var/log/tollgate/access.log"
  buffer_size: 64
"#;
        let mut tmpfile = tempfile::NamedTempFile::new().unwrap();
        write!(tmpfile, "{yaml}").unwrap();
        let cfg = GatewayConfig::load(tmpfile.path()).unwrap();
        assert_eq!(cfg.auth.header, "Authorization-Key");
        assert_eq!(cfg.auth.keys_file, PathBuf::from("/etc/tollgate/keys.txt"));
        assert_eq!(cfg.tls.cert_path, PathBuf::from("/etc/tollgate/tls/cert.pem"));
        assert_eq!(cfg.tls.key_path, PathBuf::from("/etc/tollgate/tls/key.pem"));
        assert_eq!(cfg.access_log.path, PathBuf::from("/var/log/tollgate/access.log"));
        assert_eq!(cfg.access_log.buffer_size, 64);
    }

    #[test]
    fn load_rejects_wrongly_typed_fields() {
        let mut tmpfile = tempfile::NamedTempFile::new().unwrap();
        write!(tmpfile, "listener:\n  workers: \"many\"\n").unwrap();
        let err = GatewayConfig::load(tmpfile.path()).unwrap_err();
        assert!(matches!(err, GatewayError::ConfigError(_)));
    }

    #[test]
    fn config_serializes_to_json() {
        let cfg = GatewayConfig::default();
        let json = serde_json::to_value(&cfg).unwrap();
        assert_eq!(json["listener"]["addr"], "0.0.0.0:8443");
        assert_eq!(json["upstream"]["url"], "http://localhost:11434");
    }
}
