//! TLS hello summaries and certificate key type negotiation

use rustls::crypto::CryptoProvider;
use rustls::server::ClientHello;
use rustls::{CipherSuite, SignatureScheme};

use certfleet_cache::RSA_SUFFIX;

/// The parts of a TLS ClientHello that decide which certificate to serve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloInfo {
    pub server_name: String,
    pub signature_schemes: Vec<SignatureScheme>,
    pub cipher_suites: Vec<CipherSuite>,
}

/// Certificate key algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    Ecdsa,
    Rsa,
}

impl KeyType {
    /// Cache entry holding a certificate of this type for `host`.
    pub fn cache_name(self, host: &str) -> String {
        match self {
            KeyType::Ecdsa => host.to_string(),
            KeyType::Rsa => format!("{host}{RSA_SUFFIX}"),
        }
    }
}

const ECDSA_SCHEMES: &[SignatureScheme] = &[
    SignatureScheme::ECDSA_NISTP256_SHA256,
    SignatureScheme::ECDSA_NISTP384_SHA384,
    SignatureScheme::ECDSA_NISTP521_SHA512,
];

/// Suites usable with an ECDSA certificate. TLS 1.3 suites are
/// certificate-agnostic.
const ECDSA_CAPABLE_SUITES: &[CipherSuite] = &[
    CipherSuite::TLS13_AES_128_GCM_SHA256,
    CipherSuite::TLS13_AES_256_GCM_SHA384,
    CipherSuite::TLS13_CHACHA20_POLY1305_SHA256,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
];

impl HelloInfo {
    /// A hello carrying only a server name. Clients that say nothing about
    /// their capabilities get an ECDSA certificate.
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            signature_schemes: Vec::new(),
            cipher_suites: Vec::new(),
        }
    }

    /// A hello advertising exactly what `provider` supports, so a synthetic
    /// handshake negotiates the same certificate type as real clients of a
    /// server using that provider.
    pub fn synthetic(server_name: impl Into<String>, provider: &CryptoProvider) -> Self {
        Self {
            server_name: server_name.into(),
            signature_schemes: provider
                .signature_verification_algorithms
                .supported_schemes(),
            cipher_suites: provider.cipher_suites.iter().map(|s| s.suite()).collect(),
        }
    }

    /// Summary of a real handshake. `None` without SNI.
    pub fn from_client_hello(hello: &ClientHello<'_>) -> Option<Self> {
        Some(Self {
            server_name: hello.server_name()?.to_string(),
            signature_schemes: hello.signature_schemes().to_vec(),
            cipher_suites: hello.cipher_suites().to_vec(),
        })
    }

    /// Whether the client can use an ECDSA certificate.
    pub fn supports_ecdsa(&self) -> bool {
        if self.signature_schemes.is_empty() && self.cipher_suites.is_empty() {
            return true;
        }
        let scheme_ok = self
            .signature_schemes
            .iter()
            .any(|s| ECDSA_SCHEMES.contains(s));
        let suite_ok = self.cipher_suites.is_empty()
            || self
                .cipher_suites
                .iter()
                .any(|s| ECDSA_CAPABLE_SUITES.contains(s));
        scheme_ok && suite_ok
    }

    pub fn key_type(&self) -> KeyType {
        if self.supports_ecdsa() {
            KeyType::Ecdsa
        } else {
            KeyType::Rsa
        }
    }
}
