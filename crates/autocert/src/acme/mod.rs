//! ACME certificate management
//!
//! Obtains certificates from Let's Encrypt or any ACME provider and shares
//! them across a fleet through a [`Cache`](certfleet_cache::Cache).
//!
//! # Architecture
//!
//! - [`Manager`] - serves certificates from memory or the cache and runs
//!   ACME orders through `instant-acme` when none is usable
//! - [`HostPolicy`] - gate consulted before any cache read or order
//! - [`RenewalClient`] - one background task per host asking the manager
//!   for a certificate on every tick
//! - [`ChallengeServer`] - plain HTTP listener answering HTTP-01 challenges
//!
//! # Challenge Flow
//!
//! 1. The manager creates an order for the host
//! 2. Each pending authorization's HTTP-01 token is staged in
//!    [`ChallengeTokens`] and in the cache as `<token>+http-01`
//! 3. The provider requests `/.well-known/acme-challenge/<token>`
//! 4. [`Http01Handler`] answers with the key authorization
//! 5. The order is finalized and the bundle stored under the host name,
//!    which the cache routes to the shared tier
//! 6. Staged tokens are removed

mod bundle;
mod challenge;
mod client;
mod error;
mod hello;
mod manager;
mod policy;
mod provider;
mod renewal;

pub use bundle::{hostname_matches, CertBundle, LeafInfo};
pub use challenge::{
    forbidden, ChallengeBody, ChallengeServer, ChallengeTokens, Fallback, Http01Handler,
    ACME_CHALLENGE_PREFIX,
};
pub use error::AcmeError;
pub use hello::{HelloInfo, KeyType};
pub use manager::{CertResolver, Manager, ManagerBuilder, DEFAULT_RENEW_BEFORE};
pub use policy::{host_whitelist, split_port, strip_port, HostPolicy};
pub use provider::{resolve_directory_url, LETSENCRYPT_STAGING_URL, LETSENCRYPT_URL};
pub use renewal::{
    CertificateSource, RenewalClient, RenewalHandle, DEFAULT_REFRESH_INTERVAL,
    DEFAULT_STOP_TIMEOUT,
};

pub use instant_acme::RevocationReason;
