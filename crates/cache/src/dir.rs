//! Plain directory cache used for the local tier.
//!
//! Each entry is a file named after its cache key. Writes go through a
//! temporary file in the same directory followed by a rename, so a reader
//! never sees a partially written entry even without the lock. Callers are
//! expected to hold the directory lock anyway; this type does no locking.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

/// Outcome of a directory read.
#[derive(Debug)]
pub(crate) enum DirRead {
    Found(Vec<u8>),
    Missing,
}

/// Blocking, unlocked file-per-entry cache.
#[derive(Debug, Clone)]
pub(crate) struct DirCache {
    dir: PathBuf,
}

impl DirCache {
    pub(crate) fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub(crate) fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the directory with owner-only permissions.
    pub(crate) fn ensure_dir(&self) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.dir, fs::Permissions::from_mode(0o700))?;
        }

        Ok(())
    }

    fn entry_path(&self, name: &str) -> io::Result<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid cache entry name {name:?}"),
            ));
        }
        Ok(self.dir.join(name))
    }

    pub(crate) fn get(&self, name: &str) -> io::Result<DirRead> {
        let path = self.entry_path(name)?;
        match fs::read(&path) {
            Ok(data) => {
                trace!(name = %name, bytes = data.len(), "Read local cache entry");
                Ok(DirRead::Found(data))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(DirRead::Missing),
            Err(e) => Err(e),
        }
    }

    pub(crate) fn put(&self, name: &str, data: &[u8]) -> io::Result<()> {
        let path = self.entry_path(name)?;
        self.ensure_dir()?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".tmp-")
            .tempfile_in(&self.dir)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o600))?;
        }

        tmp.persist(&path).map_err(|e| e.error)?;
        debug!(name = %name, bytes = data.len(), "Wrote local cache entry");
        Ok(())
    }

    pub(crate) fn delete(&self, name: &str) -> io::Result<()> {
        let path = self.entry_path(name)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(name = %name, "Deleted local cache entry");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}
