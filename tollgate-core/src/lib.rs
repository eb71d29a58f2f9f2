pub mod config;
pub mod error;
pub mod keystore;
pub mod ssl;
pub mod upstream;

pub use config::GatewayConfig;
pub use error::GatewayError;
pub use keystore::KeyStore;
pub use ssl::CertificateMaterial;
pub use upstream::UpstreamTarget;
