//! Local disk cache layer.
//!
//! Objects live at their two-level sharded path (`ab/cdef...`); in-flight
//! insertions write into `txn/` and move into place with an atomic rename on
//! commit. After an unclean shutdown the `txn/` scratch is wiped and the
//! object shards are rescanned for accounting.

use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::{
    CacheError, CacheManager, CacheResult, CacheTransaction, ObjectHandle, ObjectInfo,
    SIZE_UNKNOWN,
};
use crate::hash::ContentHash;

pub const TXN_DIR: &str = "txn";

pub struct PosixCacheManager {
    dir: PathBuf,
    readonly: bool,
    quota: Arc<dyn super::QuotaManager>,
    next_txn: AtomicU64,
}

impl PosixCacheManager {
    /// Open (and lay out, if missing) a cache directory. With `rebuild` set,
    /// leftover transaction scratch from a crashed process is wiped and the
    /// shards are rescanned.
    pub fn new(
        dir: &Path,
        quota: Arc<dyn super::QuotaManager>,
        readonly: bool,
        rebuild: bool,
    ) -> CacheResult<Self> {
        if !readonly {
            for shard in 0u32..256 {
                fs::create_dir_all(dir.join(format!("{shard:02x}")))?;
            }
            fs::create_dir_all(dir.join(TXN_DIR))?;
        }
        let manager = Self {
            dir: dir.to_path_buf(),
            readonly,
            quota,
            next_txn: AtomicU64::new(0),
        };
        if rebuild && !readonly {
            manager.rebuild()?;
        }
        Ok(manager)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Absolute path an object is stored at once committed.
    pub fn object_path(&self, id: &ContentHash) -> PathBuf {
        self.dir.join(id.cache_path())
    }

    fn rebuild(&self) -> CacheResult<()> {
        let txn_dir = self.dir.join(TXN_DIR);
        let mut removed = 0usize;
        for entry in fs::read_dir(&txn_dir)? {
            let entry = entry?;
            if fs::remove_file(entry.path()).is_ok() {
                removed += 1;
            }
        }

        let mut objects = 0u64;
        let mut bytes = 0u64;
        for entry in WalkDir::new(&self.dir)
            .min_depth(2)
            .max_depth(2)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if entry.file_type().is_file() {
                objects += 1;
                bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
            }
        }
        info!(
            removed_txns = removed,
            objects,
            bytes,
            dir = %self.dir.display(),
            "rebuilt cache directory after unclean shutdown"
        );
        Ok(())
    }
}

impl CacheManager for PosixCacheManager {
    fn open(&self, id: &ContentHash) -> CacheResult<ObjectHandle> {
        let path = self.object_path(id);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(CacheError::NotFound)
            }
            Err(err) => return Err(err.into()),
        };
        let size = file.metadata()?.len();
        Ok(ObjectHandle::new(file, size))
    }

    fn start_txn(&self, id: &ContentHash, size: u64) -> CacheResult<Box<dyn CacheTransaction>> {
        if self.readonly {
            return Err(CacheError::ReadOnly);
        }
        let serial = self.next_txn.fetch_add(1, Ordering::Relaxed);
        let txn_path = self
            .dir
            .join(TXN_DIR)
            .join(format!("fetch.{}.{serial}", std::process::id()));
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&txn_path)?;
        debug!(id = %id, txn = %txn_path.display(), "started cache transaction");
        Ok(Box::new(PosixTransaction {
            id: *id,
            expected_size: size,
            written: 0,
            file: Some(file),
            txn_path,
            final_path: self.object_path(id),
            info: ObjectInfo::default(),
            quota: Arc::clone(&self.quota),
            finished: false,
        }))
    }

    fn describe(&self) -> String {
        format!(
            "posix cache at {} ({})",
            self.dir.display(),
            if self.readonly { "ro" } else { "rw" }
        )
    }

    fn readonly(&self) -> bool {
        self.readonly
    }

    fn quota(&self) -> Option<Arc<dyn super::QuotaManager>> {
        Some(Arc::clone(&self.quota))
    }
}

struct PosixTransaction {
    id: ContentHash,
    expected_size: u64,
    written: u64,
    file: Option<File>,
    txn_path: PathBuf,
    final_path: PathBuf,
    info: ObjectInfo,
    quota: Arc<dyn super::QuotaManager>,
    finished: bool,
}

impl PosixTransaction {
    fn file(&mut self) -> &mut File {
        self.file.as_mut().expect("transaction file open")
    }
}

impl CacheTransaction for PosixTransaction {
    fn ctrl(&mut self, info: &ObjectInfo) {
        self.info = info.clone();
    }

    fn write(&mut self, buf: &[u8]) -> CacheResult<usize> {
        self.file().write_all(buf)?;
        self.written += buf.len() as u64;
        Ok(buf.len())
    }

    fn reset(&mut self) -> CacheResult<()> {
        let file = self.file();
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        self.written = 0;
        Ok(())
    }

    fn open_from_txn(&mut self) -> CacheResult<ObjectHandle> {
        let file = File::open(&self.txn_path)?;
        Ok(ObjectHandle::new(file, self.written))
    }

    fn commit(mut self: Box<Self>) -> CacheResult<()> {
        if self.expected_size != SIZE_UNKNOWN && self.written != self.expected_size {
            let _ = fs::remove_file(&self.txn_path);
            self.finished = true;
            return Err(CacheError::Corrupted(format!(
                "transaction for {} wrote {} of {} bytes",
                self.id, self.written, self.expected_size
            )));
        }
        self.file().flush()?;
        self.file.take();
        fs::rename(&self.txn_path, &self.final_path)?;
        self.quota
            .insert(&self.id, self.written, &self.info.description);
        self.finished = true;
        Ok(())
    }

    fn abort(mut self: Box<Self>) -> CacheResult<()> {
        self.file.take();
        self.finished = true;
        fs::remove_file(&self.txn_path)?;
        Ok(())
    }
}

impl Drop for PosixTransaction {
    fn drop(&mut self) {
        if !self.finished {
            self.file.take();
            if let Err(err) = fs::remove_file(&self.txn_path) {
                warn!(txn = %self.txn_path.display(), %err, "leaked cache transaction");
            }
        }
    }
}
