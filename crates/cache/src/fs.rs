//! Backing store capability and the bundled implementations.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, trace};

use crate::error::FsError;

/// Default permissions for files written to a backing store.
pub const DEFAULT_FILE_MODE: u32 = 0o600;

/// Durable storage behind the shared cache tier.
///
/// Implementations may be slow (network file systems, cloud secret
/// managers) and are assumed to provide atomic single-key reads, writes and
/// deletes. A missing object must be reported as [`FsError::NotFound`].
#[async_trait]
pub trait CacheFs: Send + Sync {
    async fn read_file(&self, name: &str) -> Result<Vec<u8>, FsError>;

    async fn write_file(&self, name: &str, data: &[u8], mode: u32) -> Result<(), FsError>;

    /// Remove `name`. Removing a missing object is not an error.
    async fn delete(&self, name: &str) -> Result<(), FsError>;
}

#[async_trait]
impl<T: CacheFs + ?Sized> CacheFs for Arc<T> {
    async fn read_file(&self, name: &str) -> Result<Vec<u8>, FsError> {
        (**self).read_file(name).await
    }

    async fn write_file(&self, name: &str, data: &[u8], mode: u32) -> Result<(), FsError> {
        (**self).write_file(name, data, mode).await
    }

    async fn delete(&self, name: &str) -> Result<(), FsError> {
        (**self).delete(name).await
    }
}

// ============================================================================
// Directory backend
// ============================================================================

/// Backing store rooted at a directory, typically a shared mount.
#[derive(Debug, Clone)]
pub struct LocalFs {
    root: PathBuf,
}

impl LocalFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, name: &str) -> Result<PathBuf, FsError> {
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(FsError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid object name {name:?}"),
            )));
        }
        Ok(self.root.join(name))
    }
}

#[async_trait]
impl CacheFs for LocalFs {
    async fn read_file(&self, name: &str) -> Result<Vec<u8>, FsError> {
        let path = self.path(name)?;
        match tokio::fs::read(&path).await {
            Ok(data) => {
                trace!(name = %name, bytes = data.len(), "Read backing object");
                Ok(data)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(FsError::NotFound(name.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_file(&self, name: &str, data: &[u8], mode: u32) -> Result<(), FsError> {
        let path = self.path(name)?;
        let root = self.root.clone();
        let data = data.to_vec();

        // Write next to the target and rename so readers on other hosts
        // never observe a truncated object. The temporary file is created
        // 0600 under a unique name and removed if any step fails.
        let written = tokio::task::spawn_blocking(move || -> io::Result<usize> {
            std::fs::create_dir_all(&root)?;
            let mut tmp = tempfile::Builder::new()
                .prefix(".tmp-")
                .tempfile_in(&root)?;
            tmp.write_all(&data)?;
            tmp.as_file().sync_all()?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(mode))?;
            }
            #[cfg(not(unix))]
            let _ = mode;

            tmp.persist(&path).map_err(|e| e.error)?;
            Ok(data.len())
        })
        .await
        .map_err(|e| FsError::Backend(format!("write task failed: {e}")))??;

        debug!(name = %name, bytes = written, "Wrote backing object");
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), FsError> {
        let path = self.path(name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(name = %name, "Deleted backing object");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ============================================================================
// In-memory backend
// ============================================================================

/// In-process key store. Clones share the same contents.
#[derive(Debug, Clone, Default)]
pub struct MemoryFs {
    objects: Arc<DashMap<String, Vec<u8>>>,
}

impl MemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.objects.contains_key(name)
    }
}

#[async_trait]
impl CacheFs for MemoryFs {
    async fn read_file(&self, name: &str) -> Result<Vec<u8>, FsError> {
        self.objects
            .get(name)
            .map(|v| v.value().clone())
            .ok_or_else(|| FsError::NotFound(name.to_string()))
    }

    async fn write_file(&self, name: &str, data: &[u8], _mode: u32) -> Result<(), FsError> {
        self.objects.insert(name.to_string(), data.to_vec());
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), FsError> {
        self.objects.remove(name);
        Ok(())
    }
}
