//! Certfleet autocert
//!
//! ACME certificates for a fleet of TLS servers that share one cache. A
//! single machine, the client host, talks to the provider; every member
//! serves what it publishes.
//!
//! ```no_run
//! use std::sync::Arc;
//! use certfleet_autocert::acme::{Manager, RenewalClient};
//! use certfleet_cache::{CachingStore, LocalFs};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let cache = Arc::new(CachingStore::new(
//!     "/var/lib/certfleet",
//!     Arc::new(LocalFs::new("/mnt/shared/certfleet")),
//! )?);
//! let manager = Arc::new(
//!     Manager::builder()
//!         .cache(cache)
//!         .provider("letsencrypt")
//!         .email("ops@example.com")
//!         .hosts(["example.com"])
//!         .build()?,
//! );
//!
//! let shutdown = CancellationToken::new();
//! let renewal = RenewalClient::new(manager.clone(), ["example.com"]).start(&shutdown)?;
//! // ... serve TLS with manager.resolver() ...
//! renewal.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod acme;
pub mod admin;
pub mod fleet;

pub use acme::{AcmeError, HelloInfo, Manager, RenewalClient};
