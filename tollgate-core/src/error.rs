use std::path::PathBuf;
use thiserror::Error;

/// Unified error type for Tollgate.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Key source {} unreadable: {source}", .path.display())]
    KeySource {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Certificate generation failed: {0}")]
    CertGen(#[from] rcgen::Error),

    #[error("TLS config error: {0}")]
    Tls(String),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Invalid upstream: {0}")]
    InvalidUpstream(String),

    #[error("Forbidden")]
    Forbidden,

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Upstream timeout")]
    UpstreamTimeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Map to HTTP status code.
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::Forbidden => 403,
            GatewayError::Upstream(_) => 502,
            GatewayError::UpstreamTimeout => 504,
            _ => 500,
        }
    }

    /// JSON error body.
    pub fn to_json_body(&self) -> Vec<u8> {
        serde_json::json!({
            "error": self.to_string(),
            "status": self.status_code(),
        })
        .to_string()
        .into_bytes()
    }
}

impl From<figment::Error> for GatewayError {
    fn from(e: figment::Error) -> Self {
        GatewayError::ConfigError(e.to_string())
    }
}
