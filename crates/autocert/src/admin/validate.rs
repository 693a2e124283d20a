//! Certificate checks for operators

use std::fmt;

use certfleet_cache::Cache;
use chrono::{DateTime, Utc};
use rustls::pki_types::CertificateDer;

use crate::acme::{AcmeError, LeafInfo};

/// Summary of a stored certificate.
#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub leaf: LeafInfo,
    pub chain_len: usize,
    /// Host that was checked against the certificate names.
    pub host: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl ValidationReport {
    pub fn new(chain: &[CertificateDer<'_>], host: Option<&str>) -> Result<Self, AcmeError> {
        let leaf = chain
            .first()
            .ok_or_else(|| AcmeError::InvalidBundle("no certificate found".to_string()))?;
        Ok(Self {
            leaf: LeafInfo::parse(leaf)?,
            chain_len: chain.len(),
            host: host.map(str::to_string),
            checked_at: Utc::now(),
        })
    }

    pub fn is_current(&self) -> bool {
        self.leaf.is_valid_at(self.checked_at)
    }

    pub fn host_matches(&self) -> bool {
        self.host.as_deref().is_none_or(|h| self.leaf.covers(h))
    }

    pub fn is_valid(&self) -> bool {
        self.is_current() && self.host_matches()
    }

    /// Problems found, empty when the certificate is usable.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.checked_at < self.leaf.not_before {
            problems.push(format!("not valid before {}", self.leaf.not_before));
        }
        if self.checked_at >= self.leaf.not_after {
            problems.push(format!("expired at {}", self.leaf.not_after));
        }
        if let Some(host) = &self.host {
            if !self.leaf.covers(host) {
                problems.push(format!(
                    "does not cover {host} (names: {})",
                    self.leaf.dns_names.join(", ")
                ));
            }
        }
        problems
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "subject:    {}", self.leaf.subject)?;
        writeln!(f, "issuer:     {}", self.leaf.issuer)?;
        writeln!(f, "serial:     {}", self.leaf.serial)?;
        writeln!(f, "names:      {}", self.leaf.dns_names.join(", "))?;
        writeln!(f, "not before: {}", self.leaf.not_before)?;
        writeln!(f, "not after:  {}", self.leaf.not_after)?;
        writeln!(
            f,
            "remaining:  {}",
            humantime::format_duration(std::time::Duration::from_secs(
                self.leaf.remaining(self.checked_at).as_secs()
            ))
        )?;
        writeln!(f, "chain:      {} certificate(s)", self.chain_len)?;

        let problems = self.problems();
        if problems.is_empty() {
            write!(f, "status:     valid")
        } else {
            write!(f, "status:     INVALID: {}", problems.join("; "))
        }
    }
}

/// Check a PEM certificate chain, optionally against `host`. Private keys
/// in the input are skipped, so both cached bundles and bare chains work.
pub fn validate_pem(pem: &[u8], host: Option<&str>) -> Result<ValidationReport, AcmeError> {
    let chain = rustls_pemfile::certs(&mut &pem[..]).collect::<Result<Vec<_>, _>>()?;
    ValidationReport::new(&chain, host)
}

/// Check the ECDSA certificate cached for `host`.
pub async fn validate_host(cache: &dyn Cache, host: &str) -> Result<ValidationReport, AcmeError> {
    let data = cache.get(host).await?;
    validate_pem(&data, Some(host))
}
