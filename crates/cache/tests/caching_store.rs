//! Routing, locking and error-classification tests for `CachingStore`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use certfleet_cache::{
    Cache, CacheError, CacheFs, CachingStore, FileLock, FsError, Lock, MemoryFs, LOCK_FILE_NAME,
};
use parking_lot::Mutex;
use tempfile::TempDir;

const LOCAL_NAMES: &[&str] = &[
    "acme_account+key",
    "example.com+rsa",
    "example.com+token",
    "Zm9vYmFy+http-01",
];

const SHARED_NAMES: &[&str] = &["example.com", "www.example.com", "test.example.com"];

/// Backing store that records every call it receives.
#[derive(Default)]
struct RecordingFs {
    inner: MemoryFs,
    calls: Mutex<Vec<String>>,
}

impl RecordingFs {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl CacheFs for RecordingFs {
    async fn read_file(&self, name: &str) -> Result<Vec<u8>, FsError> {
        self.calls.lock().push(format!("read {name}"));
        self.inner.read_file(name).await
    }

    async fn write_file(&self, name: &str, data: &[u8], mode: u32) -> Result<(), FsError> {
        self.calls.lock().push(format!("write {name}"));
        self.inner.write_file(name, data, mode).await
    }

    async fn delete(&self, name: &str) -> Result<(), FsError> {
        self.calls.lock().push(format!("delete {name}"));
        self.inner.delete(name).await
    }
}

/// Backing store that fails every call.
struct BrokenFs;

#[async_trait]
impl CacheFs for BrokenFs {
    async fn read_file(&self, _name: &str) -> Result<Vec<u8>, FsError> {
        Err(FsError::Backend("throttled".to_string()))
    }

    async fn write_file(&self, _name: &str, _data: &[u8], _mode: u32) -> Result<(), FsError> {
        Err(FsError::Backend("throttled".to_string()))
    }

    async fn delete(&self, _name: &str) -> Result<(), FsError> {
        Err(FsError::Backend("throttled".to_string()))
    }
}

fn local_files(dir: &std::path::Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

#[tokio::test]
async fn local_names_never_touch_backing() {
    let tmp = TempDir::new().unwrap();
    let backing = Arc::new(RecordingFs::default());
    let store = CachingStore::new(tmp.path(), backing.clone()).unwrap();

    for name in LOCAL_NAMES {
        assert!(store.get(name).await.unwrap_err().is_cache_miss());
        store.put(name, name.as_bytes()).await.unwrap();
        assert_eq!(store.get(name).await.unwrap(), name.as_bytes());
        store.delete(name).await.unwrap();
        assert!(store.get(name).await.unwrap_err().is_cache_miss());
    }

    assert!(backing.calls().is_empty(), "unexpected calls: {:?}", backing.calls());
}

#[tokio::test]
async fn shared_names_never_touch_local_tier() {
    let tmp = TempDir::new().unwrap();
    // A directory where the lock file should be makes every lock attempt
    // fail, so any local access would surface as an error.
    std::fs::create_dir(tmp.path().join(LOCK_FILE_NAME)).unwrap();

    let backing = Arc::new(RecordingFs::default());
    let store = CachingStore::new(tmp.path(), backing.clone()).unwrap();

    for name in SHARED_NAMES {
        assert!(store.get(name).await.unwrap_err().is_cache_miss());
        store.put(name, b"certificate").await.unwrap();
        assert_eq!(store.get(name).await.unwrap(), b"certificate");
        store.delete(name).await.unwrap();
    }

    assert_eq!(local_files(tmp.path()), vec![LOCK_FILE_NAME.to_string()]);
    assert_eq!(backing.calls().len(), SHARED_NAMES.len() * 4);
    assert_eq!(backing.calls()[0], "read example.com");
    assert_eq!(backing.calls()[1], "write example.com");
}

#[tokio::test]
async fn round_trip_preserves_bytes() {
    let tmp = TempDir::new().unwrap();
    let store = CachingStore::new(tmp.path().join("local"), Arc::new(MemoryFs::new())).unwrap();

    let payload: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
    for name in LOCAL_NAMES.iter().chain(SHARED_NAMES) {
        store.put(name, &payload).await.unwrap();
        assert_eq!(store.get(name).await.unwrap(), payload, "{name}");
    }
}

#[tokio::test]
async fn read_only_store_rejects_all_mutations() {
    let tmp = TempDir::new().unwrap();
    let backing = Arc::new(RecordingFs::default());
    let store = CachingStore::builder(tmp.path(), backing.clone())
        .read_only(true)
        .build()
        .unwrap();

    for name in LOCAL_NAMES.iter().chain(SHARED_NAMES) {
        assert!(matches!(store.put(name, b"x").await, Err(CacheError::ReadOnly)));
        assert!(matches!(store.delete(name).await, Err(CacheError::ReadOnly)));
        assert!(store.get(name).await.unwrap_err().is_cache_miss());
    }

    // mutations are rejected before reaching the backing store
    assert!(backing.calls().iter().all(|c| c.starts_with("read ")));
}

#[tokio::test]
async fn read_only_store_sees_authority_writes() {
    let tmp = TempDir::new().unwrap();
    let backing = Arc::new(MemoryFs::new());
    let authority = CachingStore::new(tmp.path(), backing.clone()).unwrap();
    let reader = CachingStore::builder(tmp.path(), backing)
        .read_only(true)
        .build()
        .unwrap();

    authority.put("example.com+rsa", b"rsa bundle").await.unwrap();
    authority.put("example.com", b"ecdsa bundle").await.unwrap();

    assert_eq!(reader.get("example.com+rsa").await.unwrap(), b"rsa bundle");
    assert_eq!(reader.get("example.com").await.unwrap(), b"ecdsa bundle");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn contender_blocks_while_lock_is_held() {
    let tmp = TempDir::new().unwrap();
    let backing = Arc::new(MemoryFs::new());
    let first = CachingStore::new(tmp.path(), backing.clone()).unwrap();
    let second = Arc::new(CachingStore::new(tmp.path(), backing).unwrap());

    first.put("acme_account+key", b"v1").await.unwrap();

    // Hold the directory lock the way another process would.
    let holder = FileLock::for_dir(tmp.path());
    let guard = tokio::task::spawn_blocking(move || holder.lock())
        .await
        .unwrap()
        .unwrap();

    let contender = {
        let second = second.clone();
        tokio::spawn(async move {
            second.put("acme_account+key", b"v2").await?;
            second.get("acme_account+key").await
        })
    };

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!contender.is_finished(), "contender should wait for the lock");

    drop(guard);
    let value = tokio::time::timeout(Duration::from_secs(5), contender)
        .await
        .expect("contender finished after release")
        .unwrap()
        .unwrap();
    assert_eq!(value, b"v2");
    assert_eq!(first.get("acme_account+key").await.unwrap(), b"v2");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn read_only_readers_share_the_lock() {
    let tmp = TempDir::new().unwrap();
    let backing = Arc::new(MemoryFs::new());
    let authority = CachingStore::new(tmp.path(), backing.clone()).unwrap();
    authority.put("example.com+rsa", b"bundle").await.unwrap();

    let reader = CachingStore::builder(tmp.path(), backing)
        .read_only(true)
        .build()
        .unwrap();

    // Another extractor holds a shared lock; readers proceed, writers wait.
    let holder = FileLock::for_dir(tmp.path());
    let guard = tokio::task::spawn_blocking(move || holder.rlock())
        .await
        .unwrap()
        .unwrap();

    let value = tokio::time::timeout(Duration::from_secs(5), reader.get("example.com+rsa"))
        .await
        .expect("shared lock should not block readers")
        .unwrap();
    assert_eq!(value, b"bundle");

    let writer = tokio::spawn(async move { authority.put("example.com+rsa", b"new").await });
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!writer.is_finished(), "writer should wait for readers");

    drop(guard);
    tokio::time::timeout(Duration::from_secs(5), writer)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn lock_failure_is_reported_distinctly() {
    let tmp = TempDir::new().unwrap();
    std::fs::create_dir(tmp.path().join(LOCK_FILE_NAME)).unwrap();
    let store = CachingStore::new(tmp.path(), Arc::new(MemoryFs::new())).unwrap();

    for name in LOCAL_NAMES {
        let get = store.get(name).await.unwrap_err();
        let put = store.put(name, b"x").await.unwrap_err();
        let delete = store.delete(name).await.unwrap_err();
        for err in [get, put, delete] {
            assert!(err.is_lock_failure(), "{name}: {err:?}");
            assert!(!matches!(err, CacheError::Local { .. }));
            assert!(std::error::Error::source(&err).is_some());
        }
    }
}

#[tokio::test]
async fn missing_local_directory_is_a_lock_failure() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().join("local");
    let store = CachingStore::new(&dir, Arc::new(MemoryFs::new())).unwrap();
    std::fs::remove_dir_all(&dir).unwrap();

    assert!(store.get("acme_account+key").await.unwrap_err().is_lock_failure());
    assert!(store.put("acme_account+key", b"x").await.unwrap_err().is_lock_failure());
    assert!(store.delete("acme_account+key").await.unwrap_err().is_lock_failure());
}

#[tokio::test]
async fn local_io_failure_is_wrapped_as_local() {
    let tmp = TempDir::new().unwrap();
    let store = CachingStore::new(tmp.path(), Arc::new(MemoryFs::new())).unwrap();
    // A directory in place of the entry makes the read itself fail.
    std::fs::create_dir(tmp.path().join("example.com+rsa")).unwrap();

    let err = store.get("example.com+rsa").await.unwrap_err();
    assert!(matches!(err, CacheError::Local { .. }), "{err:?}");
    assert!(!err.is_lock_failure());
}

#[tokio::test]
async fn backing_failure_is_wrapped_as_backing() {
    let tmp = TempDir::new().unwrap();
    let store = CachingStore::new(tmp.path(), Arc::new(BrokenFs)).unwrap();

    for err in [
        store.get("example.com").await.unwrap_err(),
        store.put("example.com", b"x").await.unwrap_err(),
        store.delete("example.com").await.unwrap_err(),
    ] {
        match &err {
            CacheError::Backing { source, .. } => {
                assert!(matches!(source, FsError::Backend(msg) if msg == "throttled"))
            }
            other => panic!("expected backing error, got {other:?}"),
        }
    }

    // local entries are unaffected by the broken backend
    store.put("acme_account+key", b"ok").await.unwrap();
    assert_eq!(store.get("acme_account+key").await.unwrap(), b"ok");
}

#[tokio::test]
async fn custom_lock_is_used_for_local_entries() {
    struct CountingLock {
        inner: FileLock,
        exclusive: Mutex<usize>,
        shared: Mutex<usize>,
    }

    impl Lock for CountingLock {
        fn lock(&self) -> std::io::Result<certfleet_cache::LockGuard> {
            *self.exclusive.lock() += 1;
            self.inner.lock()
        }

        fn rlock(&self) -> std::io::Result<certfleet_cache::LockGuard> {
            *self.shared.lock() += 1;
            self.inner.rlock()
        }

        fn path(&self) -> &std::path::Path {
            self.inner.path()
        }
    }

    let tmp = TempDir::new().unwrap();
    let lock = Arc::new(CountingLock {
        inner: FileLock::for_dir(tmp.path()),
        exclusive: Mutex::new(0),
        shared: Mutex::new(0),
    });

    let backing = Arc::new(MemoryFs::new());
    let writer = CachingStore::builder(tmp.path(), backing.clone())
        .lock(lock.clone())
        .build()
        .unwrap();
    writer.put("a+token", b"1").await.unwrap();
    writer.get("a+token").await.unwrap();
    writer.get("example.com").await.unwrap_err();
    // read-write store uses the exclusive lock for reads as well
    assert_eq!(*lock.exclusive.lock(), 2);
    assert_eq!(*lock.shared.lock(), 0);

    let reader = CachingStore::builder(tmp.path(), backing)
        .read_only(true)
        .lock(lock.clone())
        .build()
        .unwrap();
    reader.get("a+token").await.unwrap();
    assert_eq!(*lock.shared.lock(), 1);
    assert_eq!(*lock.exclusive.lock(), 2);
}
