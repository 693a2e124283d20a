//! HTTP-01 ACME challenge handling
//!
//! Pending challenges are kept in memory and written to the cache as
//! `<token>+http-01`, a local-only name, so that a challenge server running
//! in another process on the same machine can answer them too.
//!
//! The provider validates by requesting
//! `http://<host>/.well-known/acme-challenge/<token>` on port 80.
//! [`Http01Handler`] answers those requests and hands everything else to a
//! fallback which, unless replaced, responds 403 so that probing does not
//! reveal which hosts are managed.

use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use certfleet_cache::{http01_token_name, Cache};
use dashmap::DashMap;
use http::{header, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::error::AcmeError;
use super::policy::{strip_port, HostPolicy};

/// HTTP-01 challenge path prefix
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Response body type of the challenge server.
pub type ChallengeBody = Full<Bytes>;

/// Handler for requests that are not pending challenges.
pub type Fallback = Arc<dyn Fn(&http::request::Parts) -> Response<ChallengeBody> + Send + Sync>;

// ============================================================================
// Token store
// ============================================================================

/// Pending HTTP-01 challenges: token to key authorization.
///
/// Clones share state.
#[derive(Clone)]
pub struct ChallengeTokens {
    challenges: Arc<DashMap<String, String>>,
    cache: Option<Arc<dyn Cache>>,
}

impl ChallengeTokens {
    /// Memory-only store.
    pub fn new() -> Self {
        Self {
            challenges: Arc::new(DashMap::new()),
            cache: None,
        }
    }

    /// Store that also persists tokens to `cache`.
    pub fn with_cache(cache: Arc<dyn Cache>) -> Self {
        Self {
            challenges: Arc::new(DashMap::new()),
            cache: Some(cache),
        }
    }

    /// Register a pending challenge
    pub async fn add(&self, token: &str, key_authorization: &str) -> Result<(), AcmeError> {
        debug!(token = %token, "Registering ACME HTTP-01 challenge");
        self.challenges
            .insert(token.to_string(), key_authorization.to_string());

        if let Some(cache) = &self.cache {
            cache
                .put(&http01_token_name(token), key_authorization.as_bytes())
                .await?;
        }
        Ok(())
    }

    /// Remove a completed or abandoned challenge. Cache failures are logged;
    /// a stale token is harmless once its order is gone.
    pub async fn remove(&self, token: &str) {
        if self.challenges.remove(token).is_some() {
            debug!(token = %token, "Removed ACME challenge");
        }

        if let Some(cache) = &self.cache {
            if let Err(e) = cache.delete(&http01_token_name(token)).await {
                warn!(token = %token, error = %e, "Failed to delete challenge token from cache");
            }
        }
    }

    /// Key authorization for `token`, from memory or the cache.
    pub async fn get(&self, token: &str) -> Option<String> {
        if let Some(value) = self.challenges.get(token) {
            trace!(token = %token, "ACME challenge token found");
            return Some(value.clone());
        }

        let cache = self.cache.as_ref()?;
        match cache.get(&http01_token_name(token)).await {
            Ok(data) => {
                trace!(token = %token, "ACME challenge token found in cache");
                String::from_utf8(data).ok()
            }
            Err(e) if e.is_cache_miss() => {
                trace!(token = %token, "ACME challenge token not found");
                None
            }
            Err(e) => {
                warn!(token = %token, error = %e, "Failed to read challenge token from cache");
                None
            }
        }
    }

    /// Token part of a challenge request path, if it is one.
    pub fn extract_token(path: &str) -> Option<&str> {
        path.strip_prefix(ACME_CHALLENGE_PREFIX)
            .filter(|t| !t.is_empty() && !t.contains('/'))
    }

    /// Number of challenges pending in this process.
    pub fn pending_count(&self) -> usize {
        self.challenges.len()
    }
}

impl Default for ChallengeTokens {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ChallengeTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChallengeTokens")
            .field("pending", &self.challenges.len())
            .field("persistent", &self.cache.is_some())
            .finish()
    }
}

// ============================================================================
// Request handler
// ============================================================================

/// Answers HTTP-01 challenge requests for allowed hosts.
#[derive(Clone)]
pub struct Http01Handler {
    tokens: ChallengeTokens,
    policy: HostPolicy,
    fallback: Fallback,
}

impl Http01Handler {
    /// The policy is wrapped with [`strip_port`] since challenge requests
    /// arriving on a non-standard port carry it in the Host header.
    pub fn new(tokens: ChallengeTokens, policy: HostPolicy) -> Self {
        Self {
            tokens,
            policy: strip_port(policy),
            fallback: Arc::new(forbidden_fallback),
        }
    }

    /// Replace the 403 fallback.
    pub fn with_fallback(mut self, fallback: Fallback) -> Self {
        self.fallback = fallback;
        self
    }

    pub async fn handle<B>(&self, req: Request<B>) -> Response<ChallengeBody> {
        let (parts, _) = req.into_parts();

        if let Some(token) = ChallengeTokens::extract_token(parts.uri.path()) {
            let host = request_host(&parts).unwrap_or_default();
            match (self.policy)(&host) {
                Ok(()) => {
                    if let Some(key_authorization) = self.tokens.get(token).await {
                        debug!(host = %host, token = %token, "Serving ACME challenge response");
                        return Response::builder()
                            .status(StatusCode::OK)
                            .header(header::CONTENT_TYPE, "text/plain")
                            .body(Full::new(Bytes::from(key_authorization)))
                            .unwrap_or_else(|_| forbidden());
                    }
                    debug!(host = %host, token = %token, "Unknown ACME challenge token");
                }
                Err(e) => debug!(host = %host, error = %e, "Challenge request for disallowed host"),
            }
        }

        (self.fallback)(&parts)
    }
}

impl std::fmt::Debug for Http01Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Http01Handler")
            .field("tokens", &self.tokens)
            .finish_non_exhaustive()
    }
}

fn request_host(parts: &http::request::Parts) -> Option<String> {
    parts
        .headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| parts.uri.authority().map(|a| a.to_string()))
}

fn forbidden_fallback(_parts: &http::request::Parts) -> Response<ChallengeBody> {
    forbidden()
}

/// Plain 403 response.
pub fn forbidden() -> Response<ChallengeBody> {
    let mut response = Response::new(Full::new(Bytes::from_static(b"Forbidden\n")));
    *response.status_mut() = StatusCode::FORBIDDEN;
    response
}

// ============================================================================
// Server
// ============================================================================

/// Plain HTTP listener serving an [`Http01Handler`].
pub struct ChallengeServer {
    listener: TcpListener,
    handler: Arc<Http01Handler>,
}

impl ChallengeServer {
    /// Bind the listener. Port 80 in production; tests use port 0.
    pub async fn bind(addr: SocketAddr, handler: Http01Handler) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            handler: Arc::new(handler),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until `shutdown` is cancelled. Connections in progress are
    /// left to finish on their own.
    pub async fn run(self, shutdown: CancellationToken) -> io::Result<()> {
        info!(address = %self.local_addr()?, "ACME challenge server listening");

        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept challenge connection");
                        continue;
                    }
                },
            };

            let handler = Arc::clone(&self.handler);
            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let handler = Arc::clone(&handler);
                    async move { Ok::<_, Infallible>(handler.handle(req).await) }
                });

                if let Err(e) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    trace!(peer = %peer, error = %e, "Challenge connection ended with error");
                }
            });
        }

        info!("ACME challenge server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::policy::host_whitelist;
    use certfleet_cache::{CachingStore, MemoryFs};
    use http_body_util::BodyExt;

    fn request(host: &str, path: &str) -> Request<()> {
        Request::builder()
            .uri(path)
            .header(header::HOST, host)
            .body(())
            .unwrap()
    }

    async fn body_string(response: Response<ChallengeBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_add_get_remove() {
        let tokens = ChallengeTokens::new();
        tokens.add("tok", "tok.thumb").await.unwrap();
        assert_eq!(tokens.get("tok").await.as_deref(), Some("tok.thumb"));
        assert_eq!(tokens.pending_count(), 1);

        tokens.remove("tok").await;
        assert_eq!(tokens.get("tok").await, None);
        assert_eq!(tokens.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_tokens_are_shared_through_the_cache() {
        let tmp = tempfile::TempDir::new().unwrap();
        let backing = Arc::new(MemoryFs::new());
        let cache: Arc<dyn Cache> =
            Arc::new(CachingStore::new(tmp.path(), backing.clone()).unwrap());

        let renewer = ChallengeTokens::with_cache(cache.clone());
        let server = ChallengeTokens::with_cache(cache.clone());

        renewer.add("tok", "tok.thumb").await.unwrap();
        assert_eq!(server.get("tok").await.as_deref(), Some("tok.thumb"));
        assert!(tmp.path().join("tok+http-01").exists());
        // tokens are local entries
        assert!(backing.is_empty());

        renewer.remove("tok").await;
        assert_eq!(server.get("tok").await, None);
    }

    #[test]
    fn test_extract_token() {
        assert_eq!(
            ChallengeTokens::extract_token("/.well-known/acme-challenge/abc123"),
            Some("abc123")
        );
        assert_eq!(ChallengeTokens::extract_token("/.well-known/acme-challenge/"), None);
        assert_eq!(ChallengeTokens::extract_token("/.well-known/acme-challenge/a/b"), None);
        assert_eq!(ChallengeTokens::extract_token("/other/path"), None);
    }

    #[tokio::test]
    async fn test_handler_serves_allowed_hosts_only() {
        let tokens = ChallengeTokens::new();
        tokens.add("tok", "tok.thumb").await.unwrap();
        let handler = Http01Handler::new(tokens, host_whitelist(["a.com"]));

        let ok = handler
            .handle(request("a.com:5002", "/.well-known/acme-challenge/tok"))
            .await;
        assert_eq!(ok.status(), StatusCode::OK);
        assert_eq!(body_string(ok).await, "tok.thumb");

        let other_host = handler
            .handle(request("c.com", "/.well-known/acme-challenge/tok"))
            .await;
        assert_eq!(other_host.status(), StatusCode::FORBIDDEN);

        let unknown_token = handler
            .handle(request("a.com", "/.well-known/acme-challenge/nope"))
            .await;
        assert_eq!(unknown_token.status(), StatusCode::FORBIDDEN);

        let other_path = handler.handle(request("a.com", "/")).await;
        assert_eq!(other_path.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_custom_fallback() {
        let handler = Http01Handler::new(ChallengeTokens::new(), host_whitelist(["a.com"]))
            .with_fallback(Arc::new(|parts: &http::request::Parts| {
                let mut response = Response::new(Full::new(Bytes::from(parts.uri.path().to_string())));
                *response.status_mut() = StatusCode::MOVED_PERMANENTLY;
                response
            }));

        let response = handler.handle(request("a.com", "/login")).await;
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(body_string(response).await, "/login");
    }
}
