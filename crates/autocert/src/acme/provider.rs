//! ACME directory resolution

use certfleet_config::{PROVIDER_LETSENCRYPT, PROVIDER_LETSENCRYPT_STAGING};
use tracing::debug;

use super::error::AcmeError;

/// Let's Encrypt production directory
pub const LETSENCRYPT_URL: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Let's Encrypt staging directory
pub const LETSENCRYPT_STAGING_URL: &str =
    "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Map a provider setting to a directory URL.
///
/// The two Let's Encrypt aliases map to their well-known directories; an
/// empty provider means staging so that a forgotten setting never burns
/// production rate limits. Anything else must be an absolute http(s) URL
/// and is used verbatim.
pub fn resolve_directory_url(provider: &str) -> Result<String, AcmeError> {
    let url = match provider {
        "" | PROVIDER_LETSENCRYPT_STAGING => LETSENCRYPT_STAGING_URL.to_string(),
        PROVIDER_LETSENCRYPT => LETSENCRYPT_URL.to_string(),
        custom => {
            let invalid = |reason: String| AcmeError::InvalidProvider {
                provider: custom.to_string(),
                reason,
            };
            let parsed = url::Url::parse(custom).map_err(|e| invalid(e.to_string()))?;
            if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
                return Err(invalid("expected an http(s) directory URL".to_string()));
            }
            custom.to_string()
        }
    };

    debug!(provider = %provider, directory = %url, "Resolved ACME directory");
    Ok(url)
}
