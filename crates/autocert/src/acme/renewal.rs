//! Background certificate renewal
//!
//! [`RenewalClient`] keeps a fixed set of hosts supplied with certificates by
//! asking a [`CertificateSource`] for each of them on a timer, as if a TLS
//! client had connected. The source decides whether that means serving a
//! held certificate, renewing it, or issuing a first one.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::crypto::CryptoProvider;
use rustls::sign::CertifiedKey;
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::AcmeError;
use super::hello::HelloInfo;

/// Default time between certificate checks (6 hours)
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(6 * 3600);

/// Default time to wait for tasks on [`RenewalHandle::stop`]
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Anything that can produce a certificate for a TLS hello.
#[async_trait]
pub trait CertificateSource: Send + Sync {
    async fn get_certificate(&self, hello: &HelloInfo) -> Result<Arc<CertifiedKey>, AcmeError>;
}

/// Periodically requests certificates for a set of hosts.
pub struct RenewalClient {
    source: Arc<dyn CertificateSource>,
    hosts: Vec<String>,
    refresh_interval: Duration,
    stop_timeout: Duration,
    provider: Arc<CryptoProvider>,
}

impl RenewalClient {
    pub fn new<I, S>(source: Arc<dyn CertificateSource>, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            source,
            hosts: hosts.into_iter().map(Into::into).collect(),
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        }
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Crypto provider of the TLS server the certificates are for. Synthetic
    /// hellos advertise what it supports.
    pub fn with_crypto_provider(mut self, provider: Arc<CryptoProvider>) -> Self {
        self.provider = provider;
        self
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    /// Spawn one renewal task per host. The first check runs immediately.
    ///
    /// Tasks stop when `shutdown` or the returned handle is cancelled.
    pub fn start(&self, shutdown: &CancellationToken) -> Result<RenewalHandle, AcmeError> {
        if self.refresh_interval.is_zero() {
            return Err(AcmeError::InvalidInterval);
        }

        let cancel = shutdown.child_token();
        let mut tasks = JoinSet::new();

        for host in &self.hosts {
            let hello = HelloInfo::synthetic(host.clone(), &self.provider);
            tasks.spawn(renew_host(
                Arc::clone(&self.source),
                hello,
                self.refresh_interval,
                cancel.clone(),
            ));
        }

        info!(
            hosts = self.hosts.len(),
            refresh_interval = %humantime::format_duration(self.refresh_interval),
            "Started certificate renewal"
        );

        Ok(RenewalHandle {
            cancel,
            tasks,
            stop_timeout: self.stop_timeout,
        })
    }
}

async fn renew_host(
    source: Arc<dyn CertificateSource>,
    hello: HelloInfo,
    refresh_interval: Duration,
    cancel: CancellationToken,
) {
    let host = hello.server_name.clone();
    let mut ticker = interval(refresh_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(host = %host, "Renewal task stopping");
                return;
            }
            _ = ticker.tick() => {}
        }

        // An in-flight request is allowed to finish; cancellation is
        // observed at the next tick.
        match source.get_certificate(&hello).await {
            Ok(_) => debug!(host = %host, "Certificate check complete"),
            Err(e) => error!(host = %host, error = %e, "Certificate renewal failed"),
        }
    }
}

/// Running renewal tasks.
pub struct RenewalHandle {
    cancel: CancellationToken,
    tasks: JoinSet<()>,
    stop_timeout: Duration,
}

impl RenewalHandle {
    /// Token cancelled when the tasks are told to stop.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Cancel all tasks and wait for them to exit.
    ///
    /// Tasks still running after the stop timeout are aborted and
    /// [`AcmeError::StopTimeout`] is returned.
    pub async fn stop(mut self) -> Result<(), AcmeError> {
        self.cancel.cancel();

        let timeout = self.stop_timeout;
        let drain = async {
            while let Some(result) = self.tasks.join_next().await {
                if let Err(e) = result {
                    if e.is_panic() {
                        warn!(error = %e, "Renewal task panicked");
                    }
                }
            }
        };

        match tokio::time::timeout(timeout, drain).await {
            Ok(()) => {
                info!("Certificate renewal stopped");
                Ok(())
            }
            Err(_) => {
                warn!(
                    remaining = self.tasks.len(),
                    timeout = ?timeout,
                    "Renewal tasks did not stop in time"
                );
                self.tasks.abort_all();
                Err(AcmeError::StopTimeout(timeout))
            }
        }
    }
}
