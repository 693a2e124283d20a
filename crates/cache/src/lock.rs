//! Cross-process locking for the local cache directory.
//!
//! The local directory may be shared by several processes (the renewing
//! authority plus read-only extractors), so mutual exclusion cannot rely on
//! an in-process mutex. [`FileLock`] uses advisory `flock(2)` on a single
//! lock file per directory. Other strategies can be plugged in through the
//! [`Lock`] trait without touching the store.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};
use tracing::trace;

/// Name of the lock file created inside each local cache directory.
pub const LOCK_FILE_NAME: &str = "dir.lock";

/// A held lock. Released when dropped.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    _held: Box<dyn Send>,
}

impl LockGuard {
    /// Wrap any value whose `Drop` releases the lock.
    pub fn new<T: Send + 'static>(held: T) -> Self {
        Self {
            _held: Box::new(held),
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").finish_non_exhaustive()
    }
}

/// Reader/writer lock capability used by the caching store.
///
/// Both methods block the calling thread until the lock is held.
pub trait Lock: Send + Sync {
    /// Acquire an exclusive (writer) lock.
    fn lock(&self) -> io::Result<LockGuard>;

    /// Acquire a shared (reader) lock.
    fn rlock(&self) -> io::Result<LockGuard>;

    /// Path identifying the lock, used in error messages.
    fn path(&self) -> &Path;
}

/// `flock(2)` based lock on a file.
#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Lock file for a cache directory (`<dir>/dir.lock`).
    pub fn for_dir(dir: &Path) -> Self {
        Self::new(dir.join(LOCK_FILE_NAME))
    }

    /// Exclusive locks create the lock file; shared locks only open an
    /// existing one, so readers never write to the directory.
    fn acquire(&self, arg: FlockArg) -> io::Result<LockGuard> {
        let exclusive = matches!(arg, FlockArg::LockExclusive);
        let file = OpenOptions::new()
            .read(true)
            .write(exclusive)
            .create(exclusive)
            .truncate(false)
            .open(&self.path)?;
        let held: Flock<File> =
            Flock::lock(file, arg).map_err(|(_, errno)| io::Error::from(errno))?;
        trace!(path = %self.path.display(), "Acquired cache lock");
        Ok(LockGuard::new(held))
    }
}

impl Lock for FileLock {
    fn lock(&self) -> io::Result<LockGuard> {
        self.acquire(FlockArg::LockExclusive)
    }

    fn rlock(&self) -> io::Result<LockGuard> {
        self.acquire(FlockArg::LockShared)
    }

    fn path(&self) -> &Path {
        &self.path
    }
}
