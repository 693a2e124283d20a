//! Configuration linting
//!
//! Flags settings that work but are probably not what an operator wants.

use std::fmt;
use std::time::Duration;

use crate::{BackingConfig, Config, PROVIDER_LETSENCRYPT_STAGING};

/// Let's Encrypt certificates are valid for 90 days.
const TYPICAL_VALIDITY: Duration = Duration::from_secs(90 * 24 * 3600);

/// Non-fatal configuration issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationWarning {
    pub message: String,
}

impl ValidationWarning {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Lint configuration for likely mistakes
pub fn lint_config(config: &Config) -> Vec<ValidationWarning> {
    let mut warnings = Vec::new();

    if config.hosts.is_empty() {
        warnings.push(ValidationWarning::new(
            "No hosts configured; no certificates will be managed",
        ));
    }

    if config.acme.provider.is_empty() || config.acme.provider == PROVIDER_LETSENCRYPT_STAGING {
        warnings.push(ValidationWarning::new(
            "Using the Let's Encrypt staging directory; issued certificates are not publicly trusted",
        ));
    }

    if config.acme.email.is_none() {
        warnings.push(ValidationWarning::new(
            "No contact email; the provider cannot send expiry notices",
        ));
    }

    if config.acme.renew_before >= TYPICAL_VALIDITY {
        warnings.push(ValidationWarning::new(format!(
            "renew-before ({}) is not shorter than a 90 day certificate; every refresh will renew",
            humantime::format_duration(config.acme.renew_before)
        )));
    }

    if config.renewal.refresh_interval > config.acme.renew_before {
        warnings.push(ValidationWarning::new(format!(
            "refresh-interval ({}) exceeds renew-before ({}); a certificate may expire between checks",
            humantime::format_duration(config.renewal.refresh_interval),
            humantime::format_duration(config.acme.renew_before)
        )));
    }

    if config.client_host.is_none() && !config.hosts.is_empty() {
        warnings.push(ValidationWarning::new(
            "No client-host configured; every fleet member will try to renew",
        ));
    }

    if config.cache.backing == BackingConfig::Memory {
        warnings.push(ValidationWarning::new(
            "Memory backing is not shared; certificates are lost on exit",
        ));
    }

    if !config.challenge.address.ends_with(":80") {
        warnings.push(ValidationWarning::new(format!(
            "Challenge server listens on {}; ACME providers connect to port 80",
            config.challenge.address
        )));
    }

    warnings
}

#[cfg(test)]
mod tests {
    use super::*;

    fn production() -> Config {
        let mut config = Config::default();
        config.acme.provider = "letsencrypt".to_string();
        config.acme.email = Some("ops@example.com".to_string());
        config.hosts = vec!["example.com".to_string()];
        config.client_host = Some("renewer-01".to_string());
        config
    }

    #[test]
    fn test_production_config_is_clean() {
        assert!(lint_config(&production()).is_empty());
    }

    #[test]
    fn test_flags_staging_and_missing_email() {
        let warnings = lint_config(&Config::default());
        let text: Vec<String> = warnings.iter().map(ToString::to_string).collect();
        assert!(text.iter().any(|w| w.contains("staging")));
        assert!(text.iter().any(|w| w.contains("contact email")));
        assert!(text.iter().any(|w| w.contains("No hosts")));
    }

    #[test]
    fn test_flags_timing_mistakes() {
        let mut config = production();
        config.acme.renew_before = Duration::from_secs(3600);
        config.renewal.refresh_interval = Duration::from_secs(7200);
        let warnings = lint_config(&config);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].message.contains("refresh-interval"));

        let mut config = production();
        config.acme.renew_before = TYPICAL_VALIDITY;
        assert!(lint_config(&config)[0].message.contains("renew-before"));
    }

    #[test]
    fn test_flags_non_standard_port() {
        let mut config = production();
        config.challenge.address = "127.0.0.1:5002".to_string();
        assert!(lint_config(&config)[0].message.contains("port 80"));
    }
}
