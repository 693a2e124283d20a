//! ACME protocol client
//!
//! Thin layer over `instant-acme`: the account is loaded from (or registered
//! and saved to) the cache on first use, and each issuance runs one order
//! for one host through HTTP-01.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use certfleet_cache::{Cache, ACCOUNT_KEY_NAME};
use instant_acme::{
    Account, AccountBuilder, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier,
    NewAccount, NewOrder, Order, OrderStatus, RetryPolicy, RevocationReason, RevocationRequest,
};
use rustls::pki_types::CertificateDer;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::bundle::CertBundle;
use super::challenge::ChallengeTokens;
use super::error::AcmeError;

/// How long to wait for the provider to validate and issue.
const ORDER_TIMEOUT: Duration = Duration::from_secs(120);

/// First poll delay while waiting on an order.
const POLL_INITIAL_DELAY: Duration = Duration::from_millis(500);

pub(crate) struct AcmeClient {
    directory_url: String,
    contact: Option<String>,
    root_ca: Option<PathBuf>,
    cache: Arc<dyn Cache>,
    account: OnceCell<Account>,
}

impl AcmeClient {
    pub(crate) fn new(
        directory_url: String,
        contact: Option<String>,
        root_ca: Option<PathBuf>,
        cache: Arc<dyn Cache>,
    ) -> Self {
        Self {
            directory_url,
            contact,
            root_ca,
            cache,
            account: OnceCell::new(),
        }
    }

    pub(crate) fn directory_url(&self) -> &str {
        &self.directory_url
    }

    fn builder(&self) -> Result<AccountBuilder, AcmeError> {
        let builder = match &self.root_ca {
            Some(root) => Account::builder_with_root(root)?,
            None => Account::builder()?,
        };
        Ok(builder)
    }

    /// The ACME account, registered at most once per client.
    async fn account(&self) -> Result<&Account, AcmeError> {
        self.account
            .get_or_try_init(|| self.load_or_register())
            .await
    }

    /// The ACME account saved in the cache. Never registers a new one.
    async fn existing_account(&self) -> Result<&Account, AcmeError> {
        self.account
            .get_or_try_init(|| async { self.load().await?.ok_or(AcmeError::NoAccount) })
            .await
    }

    async fn load(&self) -> Result<Option<Account>, AcmeError> {
        let data = match self.cache.get(ACCOUNT_KEY_NAME).await {
            Ok(data) => data,
            Err(e) if e.is_cache_miss() => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let credentials: AccountCredentials = serde_json::from_slice(&data)?;
        let account = self.builder()?.from_credentials(credentials).await?;
        debug!(account = %account.id(), "Loaded ACME account from cache");
        Ok(Some(account))
    }

    async fn load_or_register(&self) -> Result<Account, AcmeError> {
        if let Some(account) = self.load().await? {
            return Ok(account);
        }

        let contact = self.contact.as_deref().map(|email| {
            if email.starts_with("mailto:") {
                email.to_string()
            } else {
                format!("mailto:{email}")
            }
        });
        let contacts: Vec<&str> = contact.iter().map(String::as_str).collect();

        let (account, credentials) = self
            .builder()?
            .create(
                &NewAccount {
                    contact: &contacts,
                    terms_of_service_agreed: true,
                    only_return_existing: false,
                },
                self.directory_url.clone(),
                None,
            )
            .await?;

        self.cache
            .put(ACCOUNT_KEY_NAME, &serde_json::to_vec(&credentials)?)
            .await?;

        info!(
            account = %account.id(),
            directory = %self.directory_url,
            "Registered ACME account"
        );
        Ok(account)
    }

    /// Run an order for `host` and return the issued bundle. Challenge
    /// tokens staged for the order are removed whatever the outcome.
    pub(crate) async fn issue(
        &self,
        host: &str,
        tokens: &ChallengeTokens,
    ) -> Result<CertBundle, AcmeError> {
        let start = Instant::now();
        let account = self.account().await?;

        let identifiers = [Identifier::Dns(host.to_string())];
        let mut order = account.new_order(&NewOrder::new(&identifiers)).await?;
        debug!(host = %host, "Created ACME order");

        let mut staged = Vec::new();
        let result = complete_order(host, &mut order, tokens, &mut staged).await;
        for token in &staged {
            tokens.remove(token).await;
        }

        let bundle = result?;
        info!(
            host = %host,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Certificate issued"
        );
        Ok(bundle)
    }

    /// Revoke `certificate`, signing with the key of the cached account.
    pub(crate) async fn revoke(
        &self,
        certificate: &CertificateDer<'_>,
        reason: Option<RevocationReason>,
    ) -> Result<(), AcmeError> {
        let account = self.existing_account().await?;
        account
            .revoke(&RevocationRequest {
                certificate,
                reason,
            })
            .await?;
        Ok(())
    }
}

async fn complete_order(
    host: &str,
    order: &mut Order,
    tokens: &ChallengeTokens,
    staged: &mut Vec<String>,
) -> Result<CertBundle, AcmeError> {
    let mut authorizations = order.authorizations();
    while let Some(authz) = authorizations.next().await {
        let mut authz = authz?;
        match &authz.status {
            AuthorizationStatus::Valid => {
                debug!(host = %host, "Authorization already valid");
                continue;
            }
            AuthorizationStatus::Pending => {}
            other => {
                return Err(AcmeError::AuthorizationFailed {
                    host: host.to_string(),
                    status: format!("{other:?}"),
                });
            }
        }

        let mut challenge = authz
            .challenge(ChallengeType::Http01)
            .ok_or_else(|| AcmeError::NoHttp01Challenge(host.to_string()))?;

        let token = challenge.token.clone();
        let key_authorization = challenge.key_authorization();
        tokens.add(&token, key_authorization.as_str()).await?;
        staged.push(token);

        challenge.set_ready().await?;
        debug!(host = %host, "HTTP-01 challenge ready");
    }
    drop(authorizations);

    let retry = RetryPolicy::new()
        .timeout(ORDER_TIMEOUT)
        .initial_delay(POLL_INITIAL_DELAY);

    let status = order.poll_ready(&retry).await?;
    if !matches!(status, OrderStatus::Ready) {
        warn!(host = %host, status = ?status, "ACME order did not become ready");
        return Err(AcmeError::OrderFailed {
            host: host.to_string(),
            status: format!("{status:?}"),
        });
    }

    let key_pem = order.finalize().await?;
    let chain_pem = order.poll_certificate(&retry).await?;
    CertBundle::from_pem(&key_pem, &chain_pem)
}
