use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tempfile::tempdir;

use casfs::cache::{
    CacheError, CacheManager, CacheResult, CacheTransaction, ObjectHandle, ObjectInfo,
    PosixCacheManager, TieredCacheManager, UnmanagedQuota, SIZE_UNKNOWN,
};
use casfs::hash::ContentHash;

/// Counts calls through to an inner layer; used to verify which layer served
/// a request.
struct SpyCache {
    inner: Arc<dyn CacheManager>,
    opens: AtomicU64,
    txns: AtomicU64,
    fail_commits: AtomicBool,
}

impl SpyCache {
    fn new(inner: Arc<dyn CacheManager>) -> Self {
        Self {
            inner,
            opens: AtomicU64::new(0),
            txns: AtomicU64::new(0),
            fail_commits: AtomicBool::new(false),
        }
    }
}

struct FailingCommitTxn {
    inner: Box<dyn CacheTransaction>,
}

impl CacheTransaction for FailingCommitTxn {
    fn ctrl(&mut self, info: &ObjectInfo) {
        self.inner.ctrl(info)
    }
    fn write(&mut self, buf: &[u8]) -> CacheResult<usize> {
        self.inner.write(buf)
    }
    fn reset(&mut self) -> CacheResult<()> {
        self.inner.reset()
    }
    fn open_from_txn(&mut self) -> CacheResult<ObjectHandle> {
        self.inner.open_from_txn()
    }
    fn commit(self: Box<Self>) -> CacheResult<()> {
        let _ = self.inner.abort();
        Err(CacheError::NoSpace)
    }
    fn abort(self: Box<Self>) -> CacheResult<()> {
        self.inner.abort()
    }
}

impl CacheManager for SpyCache {
    fn open(&self, id: &ContentHash) -> CacheResult<ObjectHandle> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.inner.open(id)
    }

    fn start_txn(&self, id: &ContentHash, size: u64) -> CacheResult<Box<dyn CacheTransaction>> {
        self.txns.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.start_txn(id, size)?;
        if self.fail_commits.load(Ordering::SeqCst) {
            Ok(Box::new(FailingCommitTxn { inner }))
        } else {
            Ok(inner)
        }
    }

    fn describe(&self) -> String {
        format!("spy over {}", self.inner.describe())
    }

    fn readonly(&self) -> bool {
        self.inner.readonly()
    }
}

struct Layers {
    _dirs: (tempfile::TempDir, tempfile::TempDir),
    upper: Arc<PosixCacheManager>,
    lower: Arc<SpyCache>,
    tiered: TieredCacheManager,
}

fn layers(lower_readonly: bool) -> Layers {
    let upper_dir = tempdir().expect("upper dir");
    let lower_dir = tempdir().expect("lower dir");
    let upper = Arc::new(
        PosixCacheManager::new(upper_dir.path(), Arc::new(UnmanagedQuota), false, false)
            .expect("upper"),
    );
    let lower_posix = Arc::new(
        PosixCacheManager::new(
            lower_dir.path(),
            Arc::new(UnmanagedQuota),
            lower_readonly,
            false,
        )
        .expect("lower"),
    );
    let lower = Arc::new(SpyCache::new(lower_posix as Arc<dyn CacheManager>));
    let tiered = TieredCacheManager::new(
        Arc::clone(&upper) as Arc<dyn CacheManager>,
        Arc::clone(&lower) as Arc<dyn CacheManager>,
    );
    Layers {
        _dirs: (upper_dir, lower_dir),
        upper,
        lower,
        tiered,
    }
}

fn store(cache: &dyn CacheManager, content: &[u8]) -> ContentHash {
    let id = ContentHash::of_buffer(content);
    let mut txn = cache.start_txn(&id, content.len() as u64).expect("txn");
    txn.write(content).expect("write");
    txn.commit().expect("commit");
    id
}

fn read_all(handle: &ObjectHandle) -> Vec<u8> {
    let mut buf = vec![0u8; handle.size() as usize];
    handle.pread_full(&mut buf, 0).expect("pread");
    buf
}

#[test]
fn populate_on_miss_copies_into_the_upper_layer() {
    let layers = layers(false);
    let content = vec![7u8; 1024 * 1024];
    let id = store(layers.lower.inner.as_ref(), &content);

    // First open: upper miss, lower hit, populate.
    let first = layers.tiered.open(&id).expect("first open");
    assert_eq!(read_all(&first).len(), content.len());
    assert_eq!(layers.lower.opens.load(Ordering::SeqCst), 1);
    drop(first);

    // Second open is served by the upper layer without touching the lower.
    let second = layers.tiered.open(&id).expect("second open");
    assert_eq!(read_all(&second), content);
    assert_eq!(layers.lower.opens.load(Ordering::SeqCst), 1);
    assert!(layers.upper.object_path(&id).is_file());
}

#[test]
fn miss_in_both_layers_stays_not_found() {
    let layers = layers(false);
    match layers.tiered.open(&ContentHash::of_buffer(b"nowhere")) {
        Err(CacheError::NotFound) => {}
        other => panic!("expected NotFound, got {other:?}"),
    }
}

#[test]
fn writes_fan_out_to_both_layers() {
    let layers = layers(false);
    let id = store(&layers.tiered, b"fan out");

    assert!(layers.upper.open(&id).is_ok());
    // Served directly by the lower layer as well.
    assert!(layers.lower.inner.open(&id).is_ok());
    assert_eq!(layers.lower.txns.load(Ordering::SeqCst), 1);
}

#[test]
fn readonly_lower_layer_sees_no_writes() {
    let layers = layers(true);
    let id = store(&layers.tiered, b"upper only");

    assert!(layers.upper.open(&id).is_ok());
    assert_eq!(layers.lower.txns.load(Ordering::SeqCst), 0);
    assert!(matches!(
        layers.lower.inner.open(&id),
        Err(CacheError::NotFound)
    ));
}

#[test]
fn commit_succeeds_when_only_the_lower_layer_fails() {
    let layers = layers(false);
    layers.lower.fail_commits.store(true, Ordering::SeqCst);

    let id = ContentHash::of_buffer(b"upper wins");
    let mut txn = layers.tiered.start_txn(&id, SIZE_UNKNOWN).expect("txn");
    txn.write(b"upper wins").expect("write");
    txn.commit().expect("upper commit carries the transaction");

    assert!(layers.upper.open(&id).is_ok());
    assert!(matches!(
        layers.lower.inner.open(&id),
        Err(CacheError::NotFound)
    ));
}

#[test]
fn quota_is_borrowed_from_the_upper_layer() {
    let layers = layers(false);
    assert!(layers.tiered.quota().is_some());
}
