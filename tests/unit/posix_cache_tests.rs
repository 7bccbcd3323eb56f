use std::sync::Arc;

use tempfile::tempdir;

use casfs::cache::{
    CacheError, CacheManager, ObjectInfo, PosixCacheManager, UnmanagedQuota, SIZE_UNKNOWN,
};
use casfs::hash::ContentHash;

fn manager(dir: &std::path::Path) -> PosixCacheManager {
    PosixCacheManager::new(dir, Arc::new(UnmanagedQuota), false, false).expect("cache dir")
}

fn store(cache: &PosixCacheManager, content: &[u8]) -> ContentHash {
    let id = ContentHash::of_buffer(content);
    let mut txn = cache.start_txn(&id, content.len() as u64).expect("txn");
    txn.ctrl(&ObjectInfo::new("test object"));
    txn.write(content).expect("write");
    txn.commit().expect("commit");
    id
}

#[test]
fn commit_makes_the_object_openable() -> casfs::Result<()> {
    let dir = tempdir()?;
    let cache = manager(dir.path());
    let id = store(&cache, b"hello object");

    let handle = cache.open(&id)?;
    assert_eq!(handle.size(), 12);
    let mut buf = vec![0u8; 12];
    assert_eq!(handle.pread_full(&mut buf, 0)?, 12);
    assert_eq!(&buf, b"hello object");

    // The object sits at its sharded path.
    assert!(cache.object_path(&id).is_file());
    Ok(())
}

#[test]
fn missing_objects_are_not_found_not_errors() {
    let dir = tempdir().expect("tempdir");
    let cache = manager(dir.path());
    match cache.open(&ContentHash::of_buffer(b"absent")) {
        Err(CacheError::NotFound) => {}
        other => panic!("expected NotFound, got {other:?}"),
    }
}

#[test]
fn short_transactions_fail_commit() {
    let dir = tempdir().expect("tempdir");
    let cache = manager(dir.path());
    let id = ContentHash::of_buffer(b"sized");
    let mut txn = cache.start_txn(&id, 100).expect("txn");
    txn.write(b"only a little").expect("write");
    match txn.commit() {
        Err(CacheError::Corrupted(_)) => {}
        other => panic!("expected corrupted, got {other:?}"),
    }
    assert!(matches!(cache.open(&id), Err(CacheError::NotFound)));
}

#[test]
fn reset_rewinds_a_transaction() -> casfs::Result<()> {
    let dir = tempdir()?;
    let cache = manager(dir.path());
    let id = ContentHash::of_buffer(b"reset me");
    let mut txn = cache.start_txn(&id, SIZE_UNKNOWN)?;
    txn.write(b"wrong data")?;
    txn.reset()?;
    txn.write(b"reset me")?;

    let handle = txn.open_from_txn()?;
    assert_eq!(handle.size(), 8);
    txn.commit()?;
    assert_eq!(cache.open(&id)?.size(), 8);
    Ok(())
}

#[test]
fn open_from_txn_survives_commit() -> casfs::Result<()> {
    let dir = tempdir()?;
    let cache = manager(dir.path());
    let id = ContentHash::of_buffer(b"early handle");
    let mut txn = cache.start_txn(&id, SIZE_UNKNOWN)?;
    txn.write(b"early handle")?;
    let handle = txn.open_from_txn()?;
    txn.commit()?;

    let mut buf = vec![0u8; 12];
    assert_eq!(handle.pread_full(&mut buf, 0)?, 12);
    assert_eq!(&buf, b"early handle");
    Ok(())
}

#[test]
fn abort_removes_the_scratch_file() -> casfs::Result<()> {
    let dir = tempdir()?;
    let cache = manager(dir.path());
    let id = ContentHash::of_buffer(b"aborted");
    let mut txn = cache.start_txn(&id, SIZE_UNKNOWN)?;
    txn.write(b"aborted")?;
    txn.abort()?;

    assert!(matches!(cache.open(&id), Err(CacheError::NotFound)));
    let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("txn"))?.collect();
    assert!(leftovers.is_empty());
    Ok(())
}

#[test]
fn readonly_layer_rejects_transactions() -> casfs::Result<()> {
    let dir = tempdir()?;
    // Lay out the directory first with a writable manager.
    let writable = manager(dir.path());
    let id = store(&writable, b"existing");

    let readonly =
        PosixCacheManager::new(dir.path(), Arc::new(UnmanagedQuota), true, false)?;
    assert!(readonly.readonly());
    assert!(readonly.open(&id).is_ok());
    match readonly.start_txn(&ContentHash::of_buffer(b"new"), 3) {
        Err(CacheError::ReadOnly) => {}
        other => panic!("expected ReadOnly, got {other:?}"),
    }
    Ok(())
}

#[test]
fn rebuild_wipes_leftover_transactions() -> casfs::Result<()> {
    let dir = tempdir()?;
    {
        let cache = manager(dir.path());
        let id = ContentHash::of_buffer(b"in flight");
        let mut txn = cache.start_txn(&id, SIZE_UNKNOWN)?;
        txn.write(b"in flight")?;
        // Simulate a crash: leak the transaction file.
        std::mem::forget(txn);
    }
    assert!(std::fs::read_dir(dir.path().join("txn"))?.next().is_some());

    let _rebuilt = PosixCacheManager::new(dir.path(), Arc::new(UnmanagedQuota), false, true)?;
    assert!(std::fs::read_dir(dir.path().join("txn"))?.next().is_none());
    Ok(())
}
