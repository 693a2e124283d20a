//! Certificate revocation
//!
//! A certificate can be revoked with the ACME account key, through the
//! [`Manager`], or with the certificate's own private key. The second path
//! needs no account and is what an operator uses when the account is lost
//! or the key has leaked; `instant-acme` only signs with account keys, so
//! that request is built here.

use std::path::Path;
use std::time::Duration;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use instant_acme::RevocationReason;
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::jws::JwsKey;
use crate::acme::{AcmeError, CertBundle, Manager};

const REPLAY_NONCE: &str = "replay-nonce";
const BAD_NONCE: &str = "urn:ietf:params:acme:error:badNonce";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Directory endpoints used for revocation.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Directory {
    new_nonce: String,
    revoke_cert: String,
}

#[derive(Serialize)]
struct RevokeRequest {
    certificate: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<u8>,
}

#[derive(Deserialize)]
struct Problem {
    #[serde(rename = "type", default)]
    kind: String,
}

/// Parse a revocation reason as written on the command line, either its
/// RFC 5280 name (`keyCompromise`, `key-compromise`) or its code.
pub fn parse_reason(s: &str) -> Option<RevocationReason> {
    let normalized: String = s
        .chars()
        .filter(|c| *c != '-' && *c != '_')
        .collect::<String>()
        .to_ascii_lowercase();
    let reason = match normalized.as_str() {
        "0" | "unspecified" => RevocationReason::Unspecified,
        "1" | "keycompromise" => RevocationReason::KeyCompromise,
        "2" | "cacompromise" => RevocationReason::CaCompromise,
        "3" | "affiliationchanged" => RevocationReason::AffiliationChanged,
        "4" | "superseded" => RevocationReason::Superseded,
        "5" | "cessationofoperation" => RevocationReason::CessationOfOperation,
        "6" | "certificatehold" => RevocationReason::CertificateHold,
        "8" | "removefromcrl" => RevocationReason::RemoveFromCrl,
        "9" | "privilegewithdrawn" => RevocationReason::PrivilegeWithdrawn,
        "10" | "aacompromise" => RevocationReason::AaCompromise,
        _ => return None,
    };
    Some(reason)
}

/// RFC 5280 CRLReason code.
pub fn reason_code(reason: RevocationReason) -> u8 {
    match reason {
        RevocationReason::Unspecified => 0,
        RevocationReason::KeyCompromise => 1,
        RevocationReason::CaCompromise => 2,
        RevocationReason::AffiliationChanged => 3,
        RevocationReason::Superseded => 4,
        RevocationReason::CessationOfOperation => 5,
        RevocationReason::CertificateHold => 6,
        RevocationReason::RemoveFromCrl => 8,
        RevocationReason::PrivilegeWithdrawn => 9,
        RevocationReason::AaCompromise => 10,
        #[allow(unreachable_patterns)]
        _ => 0,
    }
}

/// Build the HTTP client for provider and OCSP requests.
pub fn http_client(user_agent: &str, root_ca: Option<&Path>) -> Result<Client, AcmeError> {
    let mut builder = Client::builder()
        .user_agent(user_agent)
        .timeout(REQUEST_TIMEOUT);
    if let Some(path) = root_ca {
        let pem = std::fs::read(path)?;
        builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
    }
    Ok(builder.build()?)
}

/// Revokes certificates at an ACME provider with the certificate's key.
pub struct Revoker {
    http: Client,
    directory_url: String,
}

impl Revoker {
    pub fn new(http: Client, directory_url: impl Into<String>) -> Self {
        Self {
            http,
            directory_url: directory_url.into(),
        }
    }

    /// Revoke the leaf of `bundle`, signing with the bundle's private key.
    ///
    /// A rejected request fails with the provider's problem document as the
    /// error message.
    pub async fn revoke_with_certificate_key(
        &self,
        bundle: &CertBundle,
        reason: Option<RevocationReason>,
    ) -> Result<(), AcmeError> {
        let key = JwsKey::from_private_key(bundle.key())?;
        let directory = self.directory().await?;
        let request = RevokeRequest {
            certificate: base64_url(bundle.leaf_der().as_ref()),
            reason: reason.map(reason_code),
        };

        let mut nonce = self.new_nonce(&directory).await?;
        // One retry, with the nonce from the rejection, if the nonce went stale.
        for attempt in 0..2 {
            let jws = key.sign(&nonce, &directory.revoke_cert, &request)?;
            let response = self
                .http
                .post(&directory.revoke_cert)
                .header(CONTENT_TYPE, HeaderValue::from_static("application/jose+json"))
                .json(&jws)
                .send()
                .await?;

            let status = response.status();
            let next_nonce = replay_nonce(response.headers());
            if status == StatusCode::OK {
                info!(url = %directory.revoke_cert, "Certificate revoked with certificate key");
                return Ok(());
            }

            let body = response.text().await?;
            let is_bad_nonce = serde_json::from_str::<Problem>(&body)
                .map(|p| p.kind == BAD_NONCE)
                .unwrap_or(false);

            match next_nonce {
                Some(fresh) if is_bad_nonce && attempt == 0 => {
                    debug!("Stale nonce, retrying revocation");
                    nonce = fresh;
                }
                _ => {
                    warn!(status = %status, "Provider rejected revocation");
                    return Err(AcmeError::Revocation(body));
                }
            }
        }

        Err(AcmeError::Revocation("nonce rejected twice".to_string()))
    }

    async fn directory(&self) -> Result<Directory, AcmeError> {
        let directory = self
            .http
            .get(&self.directory_url)
            .send()
            .await?
            .error_for_status()?
            .json::<Directory>()
            .await?;
        Ok(directory)
    }

    async fn new_nonce(&self, directory: &Directory) -> Result<String, AcmeError> {
        let response = self.http.head(&directory.new_nonce).send().await?;
        replay_nonce(response.headers())
            .ok_or_else(|| AcmeError::Revocation("no Replay-Nonce in newNonce response".to_string()))
    }
}

/// Revoke with the ACME account key held by `manager`.
pub async fn revoke_with_account_key(
    manager: &Manager,
    bundle: &CertBundle,
    reason: Option<RevocationReason>,
) -> Result<(), AcmeError> {
    manager.revoke(bundle.leaf_der(), reason).await
}

fn replay_nonce(headers: &reqwest::header::HeaderMap) -> Option<String> {
    headers
        .get(REPLAY_NONCE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn base64_url(der: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(der)
}
