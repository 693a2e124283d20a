//! Certificate manager
//!
//! [`Manager`] answers "which certificate for this hello?" in three steps:
//! memory, then the cache, then (when issuance is allowed on this machine)
//! a fresh ACME order. Issued certificates are written back to the cache,
//! where the shared tier makes them visible to the rest of the fleet.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use certfleet_cache::Cache;
use chrono::Utc;
use dashmap::DashMap;
use instant_acme::RevocationReason;
use parking_lot::RwLock;
use rustls::pki_types::CertificateDer;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tracing::{debug, info, trace, warn};

use super::bundle::{CertBundle, LeafInfo};
use super::challenge::{ChallengeTokens, Http01Handler};
use super::client::AcmeClient;
use super::error::AcmeError;
use super::hello::{HelloInfo, KeyType};
use super::policy::{host_whitelist, normalize_host, HostPolicy};
use super::provider::resolve_directory_url;
use super::renewal::CertificateSource;

/// Let's Encrypt recommends renewing with a third of the lifetime left;
/// 30 days of a 90 day certificate.
pub const DEFAULT_RENEW_BEFORE: Duration = Duration::from_secs(30 * 24 * 3600);

/// A certificate held in memory.
struct Loaded {
    key: Arc<CertifiedKey>,
    leaf: LeafInfo,
}

/// Builder for [`Manager`].
pub struct ManagerBuilder {
    cache: Option<Arc<dyn Cache>>,
    provider: String,
    email: Option<String>,
    renew_before: Duration,
    root_ca: Option<PathBuf>,
    hosts: Vec<String>,
    policy: Option<HostPolicy>,
    allow_issuance: bool,
}

impl ManagerBuilder {
    pub fn cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// `letsencrypt`, `letsencrypt-staging`, or a directory URL. Empty
    /// means staging.
    pub fn provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    pub fn email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn renew_before(mut self, renew_before: Duration) -> Self {
        self.renew_before = renew_before;
        self
    }

    /// PEM file with a root trusted for the provider's TLS certificate.
    pub fn root_ca(mut self, path: impl Into<PathBuf>) -> Self {
        self.root_ca = Some(path.into());
        self
    }

    /// Allowed hosts. Ignored when a custom policy is set.
    pub fn hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.hosts.extend(hosts.into_iter().map(Into::into));
        self
    }

    pub fn host_policy(mut self, policy: HostPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Whether this manager may run ACME orders. Fleet members other than
    /// the client host only read what the client host has issued.
    pub fn allow_issuance(mut self, allow: bool) -> Self {
        self.allow_issuance = allow;
        self
    }

    pub fn build(self) -> Result<Manager, AcmeError> {
        let cache = self.cache.ok_or(AcmeError::MissingCache)?;
        let directory_url = resolve_directory_url(&self.provider)?;
        let policy = self
            .policy
            .unwrap_or_else(|| host_whitelist(self.hosts.iter()));

        info!(
            directory = %directory_url,
            renew_before = %humantime::format_duration(self.renew_before),
            allow_issuance = self.allow_issuance,
            "Created certificate manager"
        );

        Ok(Manager {
            client: AcmeClient::new(directory_url, self.email, self.root_ca, Arc::clone(&cache)),
            tokens: ChallengeTokens::with_cache(Arc::clone(&cache)),
            cache,
            policy,
            renew_before: self.renew_before,
            allow_issuance: self.allow_issuance,
            loaded: RwLock::new(HashMap::new()),
            inflight: DashMap::new(),
        })
    }
}

/// Obtains, caches and renews certificates.
pub struct Manager {
    cache: Arc<dyn Cache>,
    client: AcmeClient,
    tokens: ChallengeTokens,
    policy: HostPolicy,
    renew_before: Duration,
    allow_issuance: bool,
    /// Certificates by cache name.
    loaded: RwLock<HashMap<String, Arc<Loaded>>>,
    /// Serializes cache loads and orders per cache name.
    inflight: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl Manager {
    pub fn builder() -> ManagerBuilder {
        ManagerBuilder {
            cache: None,
            provider: String::new(),
            email: None,
            renew_before: DEFAULT_RENEW_BEFORE,
            root_ca: None,
            hosts: Vec::new(),
            policy: None,
            allow_issuance: true,
        }
    }

    /// Builder preconfigured from the `acme` configuration section.
    pub fn builder_from_config(config: &certfleet_config::AcmeConfig) -> ManagerBuilder {
        let mut builder = Self::builder()
            .provider(config.provider.clone())
            .renew_before(config.renew_before);
        builder.email = config.email.clone();
        builder.root_ca = config.root_ca.clone();
        builder
    }

    pub fn directory_url(&self) -> &str {
        self.client.directory_url()
    }

    pub fn renew_before(&self) -> Duration {
        self.renew_before
    }

    pub fn allows_issuance(&self) -> bool {
        self.allow_issuance
    }

    pub fn host_policy(&self) -> &HostPolicy {
        &self.policy
    }

    /// Challenge tokens of orders run by this manager.
    pub fn tokens(&self) -> &ChallengeTokens {
        &self.tokens
    }

    /// Handler for the HTTP-01 challenge server.
    pub fn http_handler(&self) -> Http01Handler {
        Http01Handler::new(self.tokens.clone(), Arc::clone(&self.policy))
    }

    /// rustls resolver backed by this manager.
    pub fn resolver(self: &Arc<Self>) -> Arc<CertResolver> {
        Arc::new(CertResolver {
            manager: Arc::clone(self),
        })
    }

    /// Certificate for the host named in `hello`, obtaining or renewing it
    /// as needed.
    pub async fn get_certificate(&self, hello: &HelloInfo) -> Result<Arc<CertifiedKey>, AcmeError> {
        let host = normalize_host(&hello.server_name);
        if host.is_empty() {
            return Err(AcmeError::MissingServerName);
        }
        (self.policy)(&host)?;

        let key_type = hello.key_type();
        let name = key_type.cache_name(&host);

        if let Some(loaded) = self.fresh_in_memory(&name) {
            trace!(host = %host, "Serving certificate from memory");
            return Ok(loaded);
        }

        let lock = self
            .inflight
            .entry(name.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Another task may have finished while we waited.
        if let Some(loaded) = self.fresh_in_memory(&name) {
            return Ok(loaded);
        }

        let in_memory = self.loaded.read().get(&name).cloned();
        let current = match self.load_from_cache(&host, &name).await {
            Ok(Some(loaded)) => Some(loaded),
            Ok(None) => in_memory,
            // Keep serving what we hold while the cache is unreachable.
            Err(e) => match in_memory {
                Some(held) if held.leaf.is_valid_at(Utc::now()) => {
                    warn!(host = %host, error = %e, "Cache read failed, using certificate in memory");
                    Some(held)
                }
                _ => return Err(e),
            },
        };
        let now = Utc::now();

        if let Some(current) = &current {
            let due = current.leaf.needs_renewal(now, self.renew_before);
            if !due || !self.allow_issuance {
                if due {
                    debug!(host = %host, "Certificate due for renewal on the client host");
                }
                self.store(&name, Arc::clone(current));
                return Ok(Arc::clone(&current.key));
            }
        }

        if !self.allow_issuance {
            return Err(AcmeError::NotIssued(host));
        }
        if key_type == KeyType::Rsa {
            return Err(AcmeError::UnsupportedKeyType(host));
        }

        match self.issue(&host, &name).await {
            Ok(key) => Ok(key),
            // A renewal failure keeps serving the current certificate until
            // it expires; the next refresh tries again.
            Err(e) => match current {
                Some(current) if current.leaf.is_valid_at(now) => {
                    warn!(
                        host = %host,
                        error = %e,
                        expires = %current.leaf.not_after,
                        "Certificate renewal failed, serving current certificate"
                    );
                    Ok(Arc::clone(&current.key))
                }
                _ => Err(e),
            },
        }
    }

    /// Revoke a certificate with the ACME account key.
    pub async fn revoke(
        &self,
        certificate: &CertificateDer<'_>,
        reason: Option<RevocationReason>,
    ) -> Result<(), AcmeError> {
        self.client.revoke(certificate, reason).await?;
        info!("Certificate revoked with the account key");
        Ok(())
    }

    /// Fetch the certificate for `hello` in the background. Nothing is
    /// spawned for hosts the policy rejects or while a fetch for the same
    /// name is already running. Returns whether a task was spawned.
    fn spawn_fetch(self: &Arc<Self>, hello: HelloInfo) -> bool {
        let host = normalize_host(&hello.server_name);
        if host.is_empty() || (self.policy)(&host).is_err() {
            return false;
        }
        let name = hello.key_type().cache_name(&host);
        let busy = self
            .inflight
            .get(&name)
            .is_some_and(|lock| lock.try_lock().is_err());
        if busy {
            trace!(host = %host, "Certificate fetch already in flight");
            return false;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return false;
        };
        let manager = Arc::clone(self);
        handle.spawn(async move {
            if let Err(e) = manager.get_certificate(&hello).await {
                debug!(host = %hello.server_name, error = %e, "Background certificate fetch failed");
            }
        });
        true
    }

    fn fresh_in_memory(&self, name: &str) -> Option<Arc<CertifiedKey>> {
        let loaded = self.loaded.read().get(name).cloned()?;
        let now = Utc::now();
        (loaded.leaf.is_valid_at(now) && !loaded.leaf.needs_renewal(now, self.renew_before))
            .then(|| Arc::clone(&loaded.key))
    }

    fn store(&self, name: &str, loaded: Arc<Loaded>) {
        self.loaded.write().insert(name.to_string(), loaded);
    }

    /// Cached certificate for `host`, ignoring entries that do not parse,
    /// have expired, or do not cover the host.
    async fn load_from_cache(&self, host: &str, name: &str) -> Result<Option<Arc<Loaded>>, AcmeError> {
        let data = match self.cache.get(name).await {
            Ok(data) => data,
            Err(e) if e.is_cache_miss() => {
                debug!(host = %host, name = %name, "Certificate not in cache");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        match load_bundle(&data, host) {
            Ok(loaded) => {
                debug!(
                    host = %host,
                    serial = %loaded.leaf.serial,
                    expires = %loaded.leaf.not_after,
                    "Loaded certificate from cache"
                );
                Ok(Some(Arc::new(loaded)))
            }
            Err(e) => {
                warn!(host = %host, name = %name, error = %e, "Ignoring unusable cached certificate");
                Ok(None)
            }
        }
    }

    async fn issue(&self, host: &str, name: &str) -> Result<Arc<CertifiedKey>, AcmeError> {
        info!(host = %host, "Requesting certificate");
        let bundle = self.client.issue(host, &self.tokens).await?;
        let loaded = Loaded {
            key: bundle.certified_key()?,
            leaf: bundle.leaf()?,
        };

        self.cache.put(name, &bundle.encode()).await?;
        info!(
            host = %host,
            serial = %loaded.leaf.serial,
            expires = %loaded.leaf.not_after,
            "Stored new certificate"
        );

        let key = Arc::clone(&loaded.key);
        self.store(name, Arc::new(loaded));
        Ok(key)
    }
}

fn load_bundle(data: &[u8], host: &str) -> Result<Loaded, AcmeError> {
    let bundle = CertBundle::decode(data)?;
    let leaf = bundle.leaf()?;
    if !leaf.is_valid_at(Utc::now()) {
        return Err(AcmeError::InvalidBundle(format!(
            "certificate not valid now ({} to {})",
            leaf.not_before, leaf.not_after
        )));
    }
    if !leaf.covers(host) {
        return Err(AcmeError::InvalidBundle(format!(
            "certificate names {:?}, not {host}",
            leaf.dns_names
        )));
    }
    Ok(Loaded {
        key: bundle.certified_key()?,
        leaf,
    })
}

#[async_trait]
impl CertificateSource for Manager {
    async fn get_certificate(&self, hello: &HelloInfo) -> Result<Arc<CertifiedKey>, AcmeError> {
        Manager::get_certificate(self, hello).await
    }
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manager")
            .field("directory_url", &self.client.directory_url())
            .field("renew_before", &self.renew_before)
            .field("allow_issuance", &self.allow_issuance)
            .field("loaded", &self.loaded.read().len())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// rustls integration
// ============================================================================

/// Serves certificates the manager holds in memory during TLS handshakes.
///
/// Resolution cannot wait on the network, so a handshake for a host with no
/// usable certificate fails while a background task fetches one for the
/// next handshake.
pub struct CertResolver {
    manager: Arc<Manager>,
}

impl ResolvesServerCert for CertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let hello = HelloInfo::from_client_hello(&client_hello)?;
        let name = hello.key_type().cache_name(&normalize_host(&hello.server_name));

        let loaded = self.manager.loaded.read().get(&name).cloned();
        if let Some(loaded) = &loaded {
            let now = Utc::now();
            if !loaded.leaf.needs_renewal(now, self.manager.renew_before) {
                return Some(Arc::clone(&loaded.key));
            }
        }

        self.manager.spawn_fetch(hello);

        // Keep serving a certificate that is due for renewal but still valid.
        loaded
            .filter(|l| l.leaf.is_valid_at(Utc::now()))
            .map(|l| Arc::clone(&l.key))
    }
}

impl fmt::Debug for CertResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertResolver")
            .field("manager", &self.manager)
            .finish()
    }
}
