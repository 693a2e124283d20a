//! Cache error types.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// The kind of operation being performed when a wrapped error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Get,
    Put,
    Delete,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Get => f.write_str("get"),
            Operation::Put => f.write_str("put"),
            Operation::Delete => f.write_str("delete"),
        }
    }
}

/// Errors returned by [`Cache`](crate::Cache) implementations.
///
/// The wrapping variants (`Local`, `Backing`, `Lock`) keep the underlying
/// error reachable through [`std::error::Error::source`], so callers can
/// match on the category and still inspect the original cause.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The requested entry does not exist. Expected during first issuance.
    #[error("cache miss")]
    CacheMiss,

    /// A mutation was attempted on a read-only store.
    #[error("cache is read-only")]
    ReadOnly,

    /// The local directory cache failed.
    #[error("local cache {op} failed for {name:?}")]
    Local {
        op: Operation,
        name: String,
        #[source]
        source: io::Error,
    },

    /// The backing store failed.
    #[error("backing store {op} failed for {name:?}")]
    Backing {
        op: Operation,
        name: String,
        #[source]
        source: FsError,
    },

    /// The local cache lock could not be acquired.
    #[error("failed to acquire cache lock {path:?}")]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A blocking cache task panicked or was cancelled.
    #[error("cache task failed: {0}")]
    Task(String),
}

impl CacheError {
    /// Returns true for [`CacheError::CacheMiss`].
    pub fn is_cache_miss(&self) -> bool {
        matches!(self, CacheError::CacheMiss)
    }

    /// Returns true if the error came from acquiring the local lock.
    pub fn is_lock_failure(&self) -> bool {
        matches!(self, CacheError::Lock { .. })
    }
}

/// Errors returned by [`CacheFs`](crate::CacheFs) backends.
#[derive(Debug, Error)]
pub enum FsError {
    /// The named object does not exist in the backing medium.
    #[error("{0:?} not found")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Backend specific failure (network, permissions, throttling).
    #[error("backend error: {0}")]
    Backend(String),
}

impl FsError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::NotFound(_))
    }
}
