//! ACME error types

use std::time::Duration;

use certfleet_cache::CacheError;
use thiserror::Error;

/// Errors from certificate management.
#[derive(Debug, Error)]
pub enum AcmeError {
    #[error("a cache is required to build the certificate manager")]
    MissingCache,

    #[error("invalid ACME provider '{provider}': {reason}")]
    InvalidProvider { provider: String, reason: String },

    #[error("host \"{0}\" is not in the host whitelist")]
    HostNotAllowed(String),

    #[error("missing server name")]
    MissingServerName,

    #[error("no certificate for \"{0}\" in the cache and issuance is disabled on this host")]
    NotIssued(String),

    #[error("no RSA certificate for \"{0}\" in the cache; only ECDSA certificates are issued")]
    UnsupportedKeyType(String),

    #[error("ACME server offered no HTTP-01 challenge for \"{0}\"")]
    NoHttp01Challenge(String),

    #[error("authorization for \"{host}\" is {status}")]
    AuthorizationFailed { host: String, status: String },

    #[error("order for \"{host}\" ended as {status}")]
    OrderFailed { host: String, status: String },

    #[error("invalid certificate bundle: {0}")]
    InvalidBundle(String),

    #[error("no ACME account in cache")]
    NoAccount,

    #[error("revocation failed: {0}")]
    Revocation(String),

    #[error("cannot sign with certificate key: {0}")]
    Signing(String),

    #[error("refresh interval must be greater than zero")]
    InvalidInterval,

    #[error("renewal tasks did not stop within {0:?}")]
    StopTimeout(Duration),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("ACME protocol error: {0}")]
    Protocol(#[from] instant_acme::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("failed to encode account credentials: {0}")]
    Credentials(#[from] serde_json::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AcmeError {
    /// Whether the error came from a cache miss.
    pub fn is_cache_miss(&self) -> bool {
        matches!(self, AcmeError::Cache(e) if e.is_cache_miss())
    }
}
