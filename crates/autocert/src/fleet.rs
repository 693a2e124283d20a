//! Wiring a fleet member from its configuration
//!
//! Every member opens the same cache layout. Only the client host opens it
//! read-write and may run ACME orders; the others read what it publishes to
//! the shared tier.

use std::sync::Arc;

use certfleet_cache::{CacheError, CacheFs, CachingStore, LocalFs, MemoryFs};
use certfleet_config::{BackingConfig, CacheConfig, Config};
use tracing::info;

use crate::acme::{AcmeError, Manager};

/// Role of this machine in the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Renews certificates and owns the writable cache.
    ClientHost,
    /// Serves certificates the client host published.
    Member,
}

impl Role {
    pub fn for_host(config: &Config, hostname: &str) -> Self {
        if config.is_client_host(hostname) {
            Role::ClientHost
        } else {
            Role::Member
        }
    }

    pub fn can_issue(self) -> bool {
        self == Role::ClientHost
    }
}

/// This machine's host name.
pub fn local_hostname() -> Result<String, AcmeError> {
    let name = nix::unistd::gethostname().map_err(std::io::Error::from)?;
    name.into_string().map_err(|raw| {
        AcmeError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("host name is not UTF-8: {raw:?}"),
        ))
    })
}

/// Backing medium named by the configuration.
pub fn backing_fs(config: &BackingConfig) -> Arc<dyn CacheFs> {
    match config {
        BackingConfig::Dir { path } => Arc::new(LocalFs::new(path)),
        BackingConfig::Memory => Arc::new(MemoryFs::new()),
    }
}

/// Open the caching store described by `config`.
pub fn open_cache(config: &CacheConfig, read_only: bool) -> Result<Arc<CachingStore>, CacheError> {
    let store = CachingStore::builder(&config.local_dir, backing_fs(&config.backing))
        .read_only(read_only)
        .file_mode(config.file_mode)
        .build()?;
    Ok(Arc::new(store))
}

/// Cache and manager for a machine in `role`.
pub fn build_manager(config: &Config, role: Role) -> Result<(Arc<CachingStore>, Arc<Manager>), AcmeError> {
    let cache = open_cache(&config.cache, !role.can_issue())?;
    let manager = Manager::builder_from_config(&config.acme)
        .cache(cache.clone())
        .hosts(config.hosts.iter().cloned())
        .allow_issuance(role.can_issue())
        .build()?;

    info!(
        role = ?role,
        hosts = config.hosts.len(),
        local_dir = %config.cache.local_dir.display(),
        backing = config.cache.backing.kind(),
        "Fleet member ready"
    );
    Ok((cache, Arc::new(manager)))
}
