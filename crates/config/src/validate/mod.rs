//! Configuration validation
//!
//! Hard errors ([`ConfigError`]) stop the process; warnings from
//! [`lint_config`] are logged and ignored.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::{BackingConfig, Config, PROVIDER_LETSENCRYPT, PROVIDER_LETSENCRYPT_STAGING};

mod lint;

pub use lint::{lint_config, ValidationWarning};

/// A configuration that cannot be used.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("cache local directory must not be empty")]
    EmptyLocalDir,

    #[error("backing 'dir' requires a path")]
    MissingBackingPath,

    #[error("{field} must be greater than zero")]
    ZeroDuration { field: &'static str },

    #[error("invalid ACME provider '{provider}': {reason}")]
    InvalidProvider { provider: String, reason: String },

    #[error("invalid contact email '{0}'")]
    InvalidEmail(String),

    #[error("host names must not be empty")]
    EmptyHost,

    #[error("host '{0}' is listed more than once")]
    DuplicateHost(String),

    #[error("invalid challenge address '{address}': {reason}")]
    InvalidChallengeAddress { address: String, reason: String },
}

impl Config {
    /// Check the configuration for values that cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.local_dir.as_os_str().is_empty() {
            return Err(ConfigError::EmptyLocalDir);
        }

        if let BackingConfig::Dir { path } = &self.cache.backing {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::MissingBackingPath);
            }
        }

        check_nonzero("renew-before", self.acme.renew_before)?;
        check_nonzero("refresh-interval", self.renewal.refresh_interval)?;
        check_nonzero("stop-timeout", self.renewal.stop_timeout)?;

        validate_provider(&self.acme.provider)?;

        if let Some(email) = &self.acme.email {
            validate_email(email)?;
        }

        let mut seen = HashSet::new();
        for host in &self.hosts {
            if host.trim().is_empty() {
                return Err(ConfigError::EmptyHost);
            }
            if !seen.insert(host.to_ascii_lowercase()) {
                return Err(ConfigError::DuplicateHost(host.clone()));
            }
        }

        self.challenge
            .address
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidChallengeAddress {
                address: self.challenge.address.clone(),
                reason: e.to_string(),
            })?;

        Ok(())
    }
}

fn check_nonzero(field: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::ZeroDuration { field });
    }
    Ok(())
}

/// Aliases and the empty string are always fine; anything else must be an
/// absolute http(s) URL.
fn validate_provider(provider: &str) -> Result<(), ConfigError> {
    if provider.is_empty()
        || provider == PROVIDER_LETSENCRYPT
        || provider == PROVIDER_LETSENCRYPT_STAGING
    {
        return Ok(());
    }

    let invalid = |reason: String| ConfigError::InvalidProvider {
        provider: provider.to_string(),
        reason,
    };

    let url = url::Url::parse(provider).map_err(|e| invalid(e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme '{}'", url.scheme())));
    }
    if url.host_str().is_none() {
        return Err(invalid("missing host".to_string()));
    }
    Ok(())
}

fn validate_email(email: &str) -> Result<(), ConfigError> {
    let email = email.strip_prefix("mailto:").unwrap_or(email);
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(()),
        _ => Err(ConfigError::InvalidEmail(email.to_string())),
    }
}
