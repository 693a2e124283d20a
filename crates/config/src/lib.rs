//! Certfleet configuration
//!
//! The configuration file is a KDL document:
//!
//! ```kdl
//! acme {
//!     provider "letsencrypt"
//!     email "ops@example.com"
//!     renew-before "720h"
//! }
//! hosts "a.example.com" "b.example.com"
//! client-host "renewer-01"
//! cache {
//!     local-dir "/var/lib/certfleet"
//!     backing "dir" "/mnt/shared/certfleet"
//! }
//! renewal {
//!     refresh-interval "6h"
//! }
//! ```
//!
//! Every field has a default, so an empty document is a valid (if not very
//! useful) configuration. Command-line flags are applied on top of the parsed
//! value by the binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use tracing::{debug, info};

mod kdl;
mod validate;

pub use validate::{lint_config, ConfigError, ValidationWarning};

/// Provider alias for the Let's Encrypt production directory.
pub const PROVIDER_LETSENCRYPT: &str = "letsencrypt";

/// Provider alias for the Let's Encrypt staging directory.
pub const PROVIDER_LETSENCRYPT_STAGING: &str = "letsencrypt-staging";

// ============================================================================
// Top-level configuration
// ============================================================================

/// Complete certfleet configuration.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Config {
    pub acme: AcmeConfig,

    /// Hosts certificates are managed for. Requests for any other host are
    /// refused before contacting the provider.
    pub hosts: Vec<String>,

    /// Fleet member that performs renewals and owns the writable cache.
    /// `None` means every member renews, which is only sensible for a
    /// single-machine deployment.
    pub client_host: Option<String>,

    pub cache: CacheConfig,
    pub renewal: RenewalConfig,
    pub challenge: ChallengeConfig,
}

impl Config {
    /// Parse a KDL document. The result is not validated.
    pub fn from_kdl(content: &str) -> anyhow::Result<Self> {
        kdl::parse_document(content)
    }

    /// Load and validate a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Loading configuration file");

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::from_kdl(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;

        info!(
            path = %path.display(),
            hosts = config.hosts.len(),
            provider = %config.acme.provider,
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Whether `hostname` is the configured renewal authority. Without a
    /// configured client host every machine is considered one.
    pub fn is_client_host(&self, hostname: &str) -> bool {
        match &self.client_host {
            Some(client) => client.eq_ignore_ascii_case(hostname),
            None => true,
        }
    }
}

// ============================================================================
// Sections
// ============================================================================

/// ACME account and provider settings.
#[derive(Debug, Clone, PartialEq)]
pub struct AcmeConfig {
    /// `letsencrypt`, `letsencrypt-staging`, a directory URL, or empty for
    /// staging.
    pub provider: String,
    pub email: Option<String>,
    /// Renew once the certificate is within this long of expiring.
    pub renew_before: Duration,
    pub user_agent: String,
    /// Extra PEM root trusted when talking to the provider (test servers).
    pub root_ca: Option<PathBuf>,
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            provider: PROVIDER_LETSENCRYPT_STAGING.to_string(),
            email: None,
            renew_before: default_renew_before(),
            user_agent: default_user_agent(),
            root_ca: None,
        }
    }
}

/// Cache locations.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Directory holding local-only entries and `dir.lock`.
    pub local_dir: PathBuf,
    pub backing: BackingConfig,
    /// Permissions for objects written to the backing store.
    pub file_mode: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            local_dir: PathBuf::from(DEFAULT_LOCAL_DIR),
            backing: BackingConfig::default(),
            file_mode: 0o600,
        }
    }
}

/// Where shared entries (issued certificates) live.
#[derive(Debug, Clone, PartialEq)]
pub enum BackingConfig {
    /// A directory, normally a mount shared by the fleet.
    Dir { path: PathBuf },
    /// Process memory. Only useful for tests and single-shot commands.
    Memory,
}

impl Default for BackingConfig {
    fn default() -> Self {
        BackingConfig::Dir {
            path: PathBuf::from(DEFAULT_LOCAL_DIR).join("shared"),
        }
    }
}

impl BackingConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            BackingConfig::Dir { .. } => "dir",
            BackingConfig::Memory => "memory",
        }
    }
}

/// Renewal loop timing.
#[derive(Debug, Clone, PartialEq)]
pub struct RenewalConfig {
    pub refresh_interval: Duration,
    /// How long stopping waits for in-flight renewals.
    pub stop_timeout: Duration,
}

impl Default for RenewalConfig {
    fn default() -> Self {
        Self {
            refresh_interval: default_refresh_interval(),
            stop_timeout: default_stop_timeout(),
        }
    }
}

/// HTTP-01 listener.
#[derive(Debug, Clone, PartialEq)]
pub struct ChallengeConfig {
    pub address: String,
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            address: default_challenge_address(),
        }
    }
}

// ============================================================================
// Defaults
// ============================================================================

const DEFAULT_LOCAL_DIR: &str = "/var/lib/certfleet";

pub fn default_renew_before() -> Duration {
    Duration::from_secs(30 * 24 * 3600)
}

pub fn default_refresh_interval() -> Duration {
    Duration::from_secs(6 * 3600)
}

pub fn default_stop_timeout() -> Duration {
    Duration::from_secs(5)
}

pub fn default_user_agent() -> String {
    format!("certfleet/{}", env!("CARGO_PKG_VERSION"))
}

pub fn default_challenge_address() -> String {
    "0.0.0.0:80".to_string()
}
