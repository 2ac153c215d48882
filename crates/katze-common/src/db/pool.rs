use std::str::FromStr;
use std::sync::Arc;

use deadpool_postgres::{
    Config, CreatePoolError, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime,
};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use thiserror::Error;
use tokio_postgres::NoTls;
use tokio_postgres::config::SslMode;
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::debug;

pub type PgPool = Pool;

#[derive(Debug, Error)]
pub enum DbPoolError {
    #[error("invalid database url: {0}")]
    InvalidConfig(String),
    #[error("failed to build TLS config: {0}")]
    Tls(#[from] rustls::Error),
    #[error("failed to create database pool: {0}")]
    PoolCreation(#[from] CreatePoolError),
}

/// How connections negotiate TLS, taken from the url's `sslmode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbTls {
    /// `sslmode=disable`: plaintext only.
    Disabled,
    /// `prefer` (the default) or `require`: TLS without certificate verification, the way
    /// hosted Postgres with self-signed certificates is usually reached.
    Unverified,
}

pub fn tls_mode(config: &tokio_postgres::Config) -> DbTls {
    match config.get_ssl_mode() {
        SslMode::Disable => DbTls::Disabled,
        _ => DbTls::Unverified,
    }
}

/// Accepts any server certificate but still checks handshake signatures.
#[derive(Debug)]
struct AcceptAnyServerCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

fn unverified_tls_connector() -> Result<MakeRustlsConnect, DbPoolError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert(provider)))
        .with_no_client_auth();
    Ok(MakeRustlsConnect::new(config))
}

/// Build a lazily connecting pool. The url is validated up front so a typo fails at start-up
/// instead of on the first cycle.
pub fn create_pool_from_url(db_url: &str, max_size: usize) -> Result<PgPool, DbPoolError> {
    let parsed = tokio_postgres::Config::from_str(db_url)
        .map_err(|e| DbPoolError::InvalidConfig(e.to_string()))?;
    if max_size == 0 {
        return Err(DbPoolError::InvalidConfig(
            "pool size must be at least 1".to_string(),
        ));
    }

    let mut cfg = Config::new();
    cfg.url = Some(db_url.to_string());
    cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });
    cfg.pool = Some(PoolConfig::new(max_size));

    let tls = tls_mode(&parsed);
    debug!(?tls, max_size, "creating postgres pool");
    let pool = match tls {
        DbTls::Disabled => cfg.create_pool(Some(Runtime::Tokio1), NoTls)?,
        DbTls::Unverified => cfg.create_pool(Some(Runtime::Tokio1), unverified_tls_connector()?)?,
    };
    Ok(pool)
}
