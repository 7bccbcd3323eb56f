//! Content-addressed blob caches.
//!
//! Every layer implements the same object contract: open by content hash,
//! populate through a transaction, read through positioned reads on an owned
//! handle. Transactions are owned values; dropping an uncommitted transaction
//! aborts it.

use std::any::Any;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::sync::Arc;

use thiserror::Error;

use crate::hash::ContentHash;

pub mod fetch;
pub mod meta;
pub mod posix;
pub mod quota;
pub mod tiered;

pub use fetch::ObjectFetcher;
pub use meta::{InodeCache, Md5PathCache, MetaCacheStatistics, PathCache};
pub use posix::PosixCacheManager;
pub use quota::{QuotaManager, UnmanagedQuota};
pub use tiered::TieredCacheManager;

/// Passed to `start_txn` when the object size is only known at commit time.
pub const SIZE_UNKNOWN: u64 = u64::MAX;

#[derive(Error, Debug)]
pub enum CacheError {
    /// The object is not in this cache layer. Distinguished from true errors:
    /// callers fall through to the next layer or to the network.
    #[error("object not in cache")]
    NotFound,
    #[error("cache is read-only")]
    ReadOnly,
    #[error("no space left in cache")]
    NoSpace,
    #[error("transferred object is corrupt: {0}")]
    Corrupted(String),
    #[error("transfer failed: {0}")]
    Transfer(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// Open file to a cached object; dropping the handle closes it.
#[derive(Debug)]
pub struct ObjectHandle {
    file: File,
    size: u64,
}

impl ObjectHandle {
    pub fn new(file: File, size: u64) -> Self {
        Self { file, size }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn pread(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.file.read_at(buf, offset)
    }

    /// Duplicate the underlying descriptor (shared offset-free reads).
    pub fn try_clone(&self) -> io::Result<ObjectHandle> {
        Ok(ObjectHandle {
            file: self.file.try_clone()?,
            size: self.size,
        })
    }

    /// Read exactly `buf.len()` bytes or report how many were available.
    pub fn pread_full(&self, buf: &mut [u8], mut offset: u64) -> io::Result<usize> {
        let mut done = 0;
        while done < buf.len() {
            let n = self.file.read_at(&mut buf[done..], offset)?;
            if n == 0 {
                break;
            }
            done += n;
            offset += n as u64;
        }
        Ok(done)
    }
}

/// Quota bookkeeping metadata attached to a transaction.
#[derive(Debug, Clone, Default)]
pub struct ObjectInfo {
    pub description: String,
}

impl ObjectInfo {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
        }
    }
}

/// In-flight object insertion. `commit` and `abort` consume the transaction;
/// a dropped transaction cleans up after itself.
pub trait CacheTransaction: Send {
    fn ctrl(&mut self, info: &ObjectInfo);
    fn write(&mut self, buf: &[u8]) -> CacheResult<usize>;
    /// Rewind to an empty transaction.
    fn reset(&mut self) -> CacheResult<()>;
    /// Hand out a read handle on the transaction content before commit.
    fn open_from_txn(&mut self) -> CacheResult<ObjectHandle>;
    fn commit(self: Box<Self>) -> CacheResult<()>;
    fn abort(self: Box<Self>) -> CacheResult<()>;
}

impl std::fmt::Debug for dyn CacheTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<dyn CacheTransaction>")
    }
}

/// Opaque layer state for hot reload; composed pairwise by the tiered cache.
pub type CacheState = Box<dyn Any + Send>;

pub trait CacheManager: Send + Sync {
    fn open(&self, id: &ContentHash) -> CacheResult<ObjectHandle>;
    fn start_txn(&self, id: &ContentHash, size: u64) -> CacheResult<Box<dyn CacheTransaction>>;
    fn describe(&self) -> String;

    fn readonly(&self) -> bool {
        false
    }

    /// The quota manager eviction is delegated to, if any.
    fn quota(&self) -> Option<Arc<dyn QuotaManager>> {
        None
    }

    fn save_state(&self) -> CacheState {
        Box::new(())
    }

    fn restore_state(&self, _state: CacheState) {}
}
