//! The dual-tier caching store.
//!
//! [`CachingStore`] partitions cache entries by name (see
//! [`is_local_name`]):
//!
//! - **local** names (account keys, challenge tokens, RSA material) are read
//!   and written in a directory on this machine, under a cross-process file
//!   lock, and never leave it;
//! - **shared** names (issued certificates) go straight to the backing
//!   [`CacheFs`], which is responsible for its own consistency. The lock is
//!   never taken for them and is never held across a backing call.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::dir::{DirCache, DirRead};
use crate::error::{CacheError, CacheResult, Operation};
use crate::fs::{CacheFs, DEFAULT_FILE_MODE};
use crate::lock::{FileLock, Lock};
use crate::names::is_local_name;
use crate::Cache;

/// Cache with a locked local tier and a shared backing tier.
pub struct CachingStore {
    local: DirCache,
    lock: Arc<dyn Lock>,
    backing: Arc<dyn CacheFs>,
    read_only: bool,
    file_mode: u32,
}

/// Builder for [`CachingStore`].
pub struct CachingStoreBuilder {
    local_dir: PathBuf,
    backing: Arc<dyn CacheFs>,
    lock: Option<Arc<dyn Lock>>,
    read_only: bool,
    file_mode: u32,
}

impl CachingStoreBuilder {
    /// Open the store read-only. Mutations fail with [`CacheError::ReadOnly`]
    /// and local reads take a shared lock.
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Replace the default `flock(2)` lock on `<local_dir>/dir.lock`.
    pub fn lock(mut self, lock: Arc<dyn Lock>) -> Self {
        self.lock = Some(lock);
        self
    }

    /// Permissions used for objects written to the backing store.
    pub fn file_mode(mut self, mode: u32) -> Self {
        self.file_mode = mode;
        self
    }

    /// Build the store. A writable store creates its local directory.
    pub fn build(self) -> CacheResult<CachingStore> {
        let local = DirCache::new(self.local_dir);
        if !self.read_only {
            local.ensure_dir().map_err(|source| CacheError::Local {
                op: Operation::Put,
                name: local.dir().display().to_string(),
                source,
            })?;
        }

        let lock = self
            .lock
            .unwrap_or_else(|| Arc::new(FileLock::for_dir(local.dir())));

        debug!(
            local_dir = %local.dir().display(),
            read_only = self.read_only,
            "Opened caching store"
        );

        Ok(CachingStore {
            local,
            lock,
            backing: self.backing,
            read_only: self.read_only,
            file_mode: self.file_mode,
        })
    }
}

impl CachingStore {
    /// Start building a store over `local_dir` and `backing`.
    pub fn builder(local_dir: impl Into<PathBuf>, backing: Arc<dyn CacheFs>) -> CachingStoreBuilder {
        CachingStoreBuilder {
            local_dir: local_dir.into(),
            backing,
            lock: None,
            read_only: false,
            file_mode: DEFAULT_FILE_MODE,
        }
    }

    /// Read-write store with the default lock.
    pub fn new(local_dir: impl Into<PathBuf>, backing: Arc<dyn CacheFs>) -> CacheResult<Self> {
        Self::builder(local_dir, backing).build()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn local_dir(&self) -> &Path {
        self.local.dir()
    }

    /// Run a local-tier operation under the lock on the blocking pool.
    ///
    /// Read-only stores take a shared lock for reads so that several
    /// extractor processes can proceed together. The read-write store takes
    /// the exclusive lock even for reads: it is the only writer, and the
    /// exclusive lock keeps it from racing its own in-flight writes issued
    /// from other tasks.
    async fn with_local<T, F>(&self, op: Operation, name: &str, f: F) -> CacheResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&DirCache, &str) -> std::io::Result<T> + Send + 'static,
    {
        let shared = self.read_only && op == Operation::Get;
        let lock = Arc::clone(&self.lock);
        let local = self.local.clone();
        let name = name.to_string();

        tokio::task::spawn_blocking(move || {
            let guard = if shared { lock.rlock() } else { lock.lock() };
            let _guard = guard.map_err(|source| CacheError::Lock {
                path: lock.path().to_path_buf(),
                source,
            })?;
            f(&local, &name).map_err(|source| CacheError::Local { op, name, source })
        })
        .await
        .map_err(|e| CacheError::Task(e.to_string()))?
    }
}

#[async_trait]
impl Cache for CachingStore {
    async fn get(&self, name: &str) -> CacheResult<Vec<u8>> {
        if !is_local_name(name) {
            trace!(name = %name, "Reading shared entry from backing store");
            return self.backing.read_file(name).await.map_err(|source| {
                if source.is_not_found() {
                    CacheError::CacheMiss
                } else {
                    CacheError::Backing {
                        op: Operation::Get,
                        name: name.to_string(),
                        source,
                    }
                }
            });
        }

        trace!(name = %name, "Reading local entry");
        match self.with_local(Operation::Get, name, |local, name| local.get(name)).await {
            Ok(DirRead::Found(data)) => Ok(data),
            Ok(DirRead::Missing) => Err(CacheError::CacheMiss),
            // No writer has created the directory or its lock file yet.
            Err(CacheError::Lock { source, .. })
                if self.read_only && source.kind() == std::io::ErrorKind::NotFound =>
            {
                Err(CacheError::CacheMiss)
            }
            Err(e) => Err(e),
        }
    }

    async fn put(&self, name: &str, data: &[u8]) -> CacheResult<()> {
        if self.read_only {
            return Err(CacheError::ReadOnly);
        }

        if !is_local_name(name) {
            trace!(name = %name, "Writing shared entry to backing store");
            return self
                .backing
                .write_file(name, data, self.file_mode)
                .await
                .map_err(|source| CacheError::Backing {
                    op: Operation::Put,
                    name: name.to_string(),
                    source,
                });
        }

        trace!(name = %name, "Writing local entry");
        let data = data.to_vec();
        self.with_local(Operation::Put, name, move |local, name| local.put(name, &data))
            .await
    }

    async fn delete(&self, name: &str) -> CacheResult<()> {
        if self.read_only {
            return Err(CacheError::ReadOnly);
        }

        if !is_local_name(name) {
            return self
                .backing
                .delete(name)
                .await
                .map_err(|source| CacheError::Backing {
                    op: Operation::Delete,
                    name: name.to_string(),
                    source,
                });
        }

        self.with_local(Operation::Delete, name, |local, name| local.delete(name))
            .await
    }
}

impl fmt::Debug for CachingStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachingStore")
            .field("local_dir", &self.local.dir())
            .field("lock", &self.lock.path())
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemoryFs;
    use tempfile::TempDir;

    fn store(tmp: &TempDir, backing: &MemoryFs) -> CachingStore {
        CachingStore::new(tmp.path().join("local"), Arc::new(backing.clone())).unwrap()
    }

    #[tokio::test]
    async fn test_local_entries_stay_local() {
        let tmp = TempDir::new().unwrap();
        let backing = MemoryFs::new();
        let store = store(&tmp, &backing);

        store.put("acme_account+key", b"account").await.unwrap();
        assert!(backing.is_empty());
        assert!(tmp.path().join("local/acme_account+key").exists());
        assert_eq!(store.get("acme_account+key").await.unwrap(), b"account");
    }

    #[tokio::test]
    async fn test_shared_entries_go_to_backing() {
        let tmp = TempDir::new().unwrap();
        let backing = MemoryFs::new();
        let store = store(&tmp, &backing);

        store.put("example.com", b"cert").await.unwrap();
        assert!(backing.contains("example.com"));
        assert!(!tmp.path().join("local/example.com").exists());
        assert_eq!(store.get("example.com").await.unwrap(), b"cert");

        store.delete("example.com").await.unwrap();
        assert!(store.get("example.com").await.unwrap_err().is_cache_miss());
    }

    #[tokio::test]
    async fn test_read_only_rejects_mutations() {
        let tmp = TempDir::new().unwrap();
        let store = CachingStore::builder(tmp.path(), Arc::new(MemoryFs::new()))
            .read_only(true)
            .build()
            .unwrap();

        assert!(store.is_read_only());
        assert!(matches!(store.put("example.com", b"x").await, Err(CacheError::ReadOnly)));
        assert!(matches!(store.delete("a+rsa").await, Err(CacheError::ReadOnly)));
        assert!(store.get("a+rsa").await.unwrap_err().is_cache_miss());
    }

    #[tokio::test]
    async fn test_read_only_store_over_missing_directory_misses() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("never-created");
        let store = CachingStore::builder(&dir, Arc::new(MemoryFs::new()))
            .read_only(true)
            .build()
            .unwrap();

        let err = store.get("example.com+rsa").await.unwrap_err();
        assert!(err.is_cache_miss(), "{err:?}");
        assert!(!dir.exists());
    }
}
