//! Quota seam.
//!
//! Eviction policy and on-disk accounting live outside this crate; the cache
//! reports insertions and removals and asks for capacity when `statfs` needs
//! it. A capacity of 0 means the cache is unmanaged; `u64::MAX` means
//! unrestricted (free space probed from the host filesystem).

use crate::hash::ContentHash;

pub trait QuotaManager: Send + Sync {
    fn capacity(&self) -> u64;
    fn used(&self) -> u64;
    fn insert(&self, id: &ContentHash, size: u64, description: &str);
    fn remove(&self, id: &ContentHash);

    /// Shrink the cache below `leave_size` bytes; true on success.
    fn cleanup(&self, _leave_size: u64) -> bool {
        true
    }
}

/// No accounting at all; `statfs` reports an ignored filesystem.
#[derive(Debug, Default)]
pub struct UnmanagedQuota;

impl QuotaManager for UnmanagedQuota {
    fn capacity(&self) -> u64 {
        0
    }

    fn used(&self) -> u64 {
        0
    }

    fn insert(&self, _id: &ContentHash, _size: u64, _description: &str) {}

    fn remove(&self, _id: &ContentHash) {}
}
