//! Certificate bundles
//!
//! A cache entry for a certificate is a PEM document holding the private
//! key followed by the certificate chain, leaf first.

use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use rustls_pemfile::Item;
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

use super::error::AcmeError;

/// Private key and certificate chain for one host.
#[derive(Debug)]
pub struct CertBundle {
    key: PrivateKeyDer<'static>,
    chain: Vec<CertificateDer<'static>>,
}

impl CertBundle {
    pub fn new(
        key: PrivateKeyDer<'static>,
        chain: Vec<CertificateDer<'static>>,
    ) -> Result<Self, AcmeError> {
        if chain.is_empty() {
            return Err(AcmeError::InvalidBundle("no certificates".to_string()));
        }
        Ok(Self { key, chain })
    }

    /// Build from the key and chain PEM returned by a finalized order.
    pub fn from_pem(key_pem: &str, chain_pem: &str) -> Result<Self, AcmeError> {
        let mut combined = String::with_capacity(key_pem.len() + chain_pem.len() + 1);
        combined.push_str(key_pem);
        if !key_pem.ends_with('\n') {
            combined.push('\n');
        }
        combined.push_str(chain_pem);
        Self::decode(combined.as_bytes())
    }

    /// Parse a cache entry. Exactly one private key is required.
    pub fn decode(data: &[u8]) -> Result<Self, AcmeError> {
        let mut key = None;
        let mut chain = Vec::new();

        for item in rustls_pemfile::read_all(&mut &data[..]) {
            let item = item.map_err(|e| AcmeError::InvalidBundle(format!("bad PEM: {e}")))?;
            let parsed: Option<PrivateKeyDer<'static>> = match item {
                Item::X509Certificate(cert) => {
                    chain.push(cert);
                    None
                }
                Item::Pkcs8Key(k) => Some(k.into()),
                Item::Sec1Key(k) => Some(k.into()),
                Item::Pkcs1Key(k) => Some(k.into()),
                _ => None,
            };
            if let Some(parsed) = parsed {
                if key.replace(parsed).is_some() {
                    return Err(AcmeError::InvalidBundle(
                        "more than one private key".to_string(),
                    ));
                }
            }
        }

        let key = key.ok_or_else(|| AcmeError::InvalidBundle("no private key".to_string()))?;
        Self::new(key, chain)
    }

    /// PEM encoding suitable for [`CertBundle::decode`].
    pub fn encode(&self) -> Vec<u8> {
        let label = match &self.key {
            PrivateKeyDer::Pkcs1(_) => "RSA PRIVATE KEY",
            PrivateKeyDer::Sec1(_) => "EC PRIVATE KEY",
            _ => "PRIVATE KEY",
        };

        let mut out = pem_block(label, self.key.secret_der());
        for cert in &self.chain {
            out.push_str(&pem_block("CERTIFICATE", cert.as_ref()));
        }
        out.into_bytes()
    }

    pub fn leaf_der(&self) -> &CertificateDer<'static> {
        &self.chain[0]
    }

    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    pub fn key(&self) -> &PrivateKeyDer<'static> {
        &self.key
    }

    /// The issuing certificate, when the chain carries one.
    pub fn issuer_der(&self) -> Option<&CertificateDer<'static>> {
        self.chain.get(1)
    }

    pub fn leaf(&self) -> Result<LeafInfo, AcmeError> {
        LeafInfo::parse(self.leaf_der())
    }

    /// Signing key and chain for rustls.
    pub fn certified_key(&self) -> Result<Arc<CertifiedKey>, AcmeError> {
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&self.key)?;
        Ok(Arc::new(CertifiedKey::new(self.chain.clone(), signing_key)))
    }
}

fn pem_block(label: &str, der: &[u8]) -> String {
    let encoded = STANDARD.encode(der);
    let mut out = format!("-----BEGIN {label}-----\n");
    // 64 byte chunks of base64 are always valid UTF-8
    for line in encoded.as_bytes().chunks(64) {
        out.push_str(std::str::from_utf8(line).unwrap_or_default());
        out.push('\n');
    }
    out.push_str(&format!("-----END {label}-----\n"));
    out
}

// ============================================================================
// Leaf certificate details
// ============================================================================

/// What the manager needs to know about a leaf certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafInfo {
    pub subject: String,
    pub issuer: String,
    /// Colon separated hex.
    pub serial: String,
    pub dns_names: Vec<String>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl LeafInfo {
    pub fn parse(der: &[u8]) -> Result<Self, AcmeError> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| AcmeError::InvalidBundle(format!("invalid X509 certificate: {e}")))?;

        let mut dns_names = Vec::new();
        if let Ok(Some(san)) = cert.subject_alternative_name() {
            for name in &san.value.general_names {
                if let GeneralName::DNSName(dns) = name {
                    dns_names.push(dns.to_ascii_lowercase());
                }
            }
        }
        // Certificates without a SAN extension fall back to the common name.
        if dns_names.is_empty() {
            dns_names.extend(
                cert.subject()
                    .iter_common_name()
                    .filter_map(|cn| cn.as_str().ok())
                    .map(|cn| cn.to_ascii_lowercase()),
            );
        }

        let timestamp = |ts: i64| {
            DateTime::from_timestamp(ts, 0)
                .ok_or_else(|| AcmeError::InvalidBundle(format!("validity out of range: {ts}")))
        };

        Ok(Self {
            subject: cert.subject().to_string(),
            issuer: cert.issuer().to_string(),
            serial: cert.raw_serial_as_string(),
            dns_names,
            not_before: timestamp(cert.validity().not_before.timestamp())?,
            not_after: timestamp(cert.validity().not_after.timestamp())?,
        })
    }

    /// Whether the certificate names `host`, directly or by wildcard.
    pub fn covers(&self, host: &str) -> bool {
        self.dns_names.iter().any(|name| hostname_matches(name, host))
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now && now < self.not_after
    }

    /// Whether `now` falls inside the renewal window before expiry.
    pub fn needs_renewal(&self, now: DateTime<Utc>, renew_before: Duration) -> bool {
        let window = chrono::Duration::from_std(renew_before).unwrap_or(chrono::Duration::MAX);
        match self.not_after.checked_sub_signed(window) {
            Some(renew_at) => now >= renew_at,
            None => true,
        }
    }

    /// Time left before expiry, zero once expired.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.not_after - now).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Match a certificate name against a host, with single-label wildcards.
pub fn hostname_matches(pattern: &str, host: &str) -> bool {
    let pattern = pattern.trim_end_matches('.').to_ascii_lowercase();
    let host = host.trim_end_matches('.').to_ascii_lowercase();

    match pattern.strip_prefix("*.") {
        Some(suffix) => match host.split_once('.') {
            Some((label, rest)) => !label.is_empty() && rest == suffix,
            None => false,
        },
        None => pattern == host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, KeyPair};
    use time::OffsetDateTime;

    fn self_signed(names: &[&str], valid_for: time::Duration) -> (String, String) {
        let key_pair = KeyPair::generate().unwrap();
        let mut params =
            CertificateParams::new(names.iter().map(|n| n.to_string()).collect::<Vec<_>>())
                .unwrap();
        let now = OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::hours(1);
        params.not_after = now + valid_for;
        let cert = params.self_signed(&key_pair).unwrap();
        (key_pair.serialize_pem(), cert.pem())
    }

    #[test]
    fn test_encode_decode() {
        let (key, cert) = self_signed(&["example.com"], time::Duration::days(90));
        let bundle = CertBundle::from_pem(&key, &cert).unwrap();
        assert_eq!(bundle.chain().len(), 1);

        let decoded = CertBundle::decode(&bundle.encode()).unwrap();
        assert_eq!(decoded.chain(), bundle.chain());
        assert_eq!(decoded.key().secret_der(), bundle.key().secret_der());
        assert!(decoded.certified_key().is_ok());
    }

    #[test]
    fn test_decode_rejects_incomplete_bundles() {
        let (key, cert) = self_signed(&["example.com"], time::Duration::days(90));
        assert!(CertBundle::decode(cert.as_bytes()).is_err());
        assert!(CertBundle::decode(key.as_bytes()).is_err());
        assert!(CertBundle::decode(b"garbage").is_err());

        let doubled = format!("{key}{key}{cert}");
        assert!(CertBundle::decode(doubled.as_bytes()).is_err());
    }

    #[test]
    fn test_leaf_info() {
        let (key, cert) = self_signed(&["example.com", "*.example.org"], time::Duration::days(90));
        let leaf = CertBundle::from_pem(&key, &cert).unwrap().leaf().unwrap();

        assert_eq!(leaf.dns_names, vec!["example.com", "*.example.org"]);
        assert!(leaf.covers("example.com"));
        assert!(leaf.covers("EXAMPLE.COM."));
        assert!(leaf.covers("www.example.org"));
        assert!(!leaf.covers("example.org"));
        assert!(!leaf.covers("a.b.example.org"));
        assert!(!leaf.covers("www.example.com"));

        let now = Utc::now();
        assert!(leaf.is_valid_at(now));
        assert!(!leaf.needs_renewal(now, Duration::from_secs(30 * 86400)));
        assert!(leaf.needs_renewal(now, Duration::from_secs(91 * 86400)));
        assert!(leaf.remaining(now) > Duration::from_secs(89 * 86400));
    }

    #[test]
    fn test_expired_leaf() {
        let (key, cert) = self_signed(&["example.com"], -time::Duration::minutes(1));
        let leaf = CertBundle::from_pem(&key, &cert).unwrap().leaf().unwrap();
        let now = Utc::now();
        assert!(!leaf.is_valid_at(now));
        assert!(leaf.needs_renewal(now, Duration::ZERO));
        assert_eq!(leaf.remaining(now), Duration::ZERO);
    }

    #[test]
    fn test_hostname_matches() {
        assert!(hostname_matches("example.com", "example.com"));
        assert!(hostname_matches("*.example.com", "www.example.com"));
        assert!(!hostname_matches("*.example.com", "example.com"));
        assert!(!hostname_matches("*.example.com", ".example.com"));
        assert!(!hostname_matches("example.com", "www.example.com"));
    }
}
