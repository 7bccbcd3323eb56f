//! Bounded in-memory metadata caches.
//!
//! Three LRU layers in front of the catalogs: inode → entry, inode → path,
//! path-hash → entry. The path-hash cache memoizes misses with a negative
//! sentinel entry. During a remount drainout the caches are paused (inserts
//! rejected) and dropped before the catalog swap.

use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

use crate::catalog::DirectoryEntry;
use crate::hash::PathHash;

/// Capacities are rounded down to a multiple of 64 entries.
pub fn round_capacity(requested: usize) -> usize {
    std::cmp::max(64, requested & !63)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetaCacheStatistics {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub inserts_negative: u64,
    pub drops: u64,
}

struct MetaCacheInner<K: std::hash::Hash + Eq, V> {
    entries: LruCache<K, V>,
    paused: bool,
    statistics: MetaCacheStatistics,
}

/// One bounded LRU layer. `pause` rejects inserts until `resume`; lookups
/// keep working so readers that entered before the pause stay coherent.
pub struct MetaCache<K: std::hash::Hash + Eq, V: Clone> {
    inner: Mutex<MetaCacheInner<K, V>>,
}

impl<K: std::hash::Hash + Eq, V: Clone> MetaCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(round_capacity(capacity)).expect("non-zero capacity");
        Self {
            inner: Mutex::new(MetaCacheInner {
                entries: LruCache::new(capacity),
                paused: false,
                statistics: MetaCacheStatistics::default(),
            }),
        }
    }

    pub fn lookup(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();
        match inner.entries.get(key).cloned() {
            Some(value) => {
                inner.statistics.hits += 1;
                Some(value)
            }
            None => {
                inner.statistics.misses += 1;
                None
            }
        }
    }

    pub fn insert(&self, key: K, value: V) {
        let mut inner = self.inner.lock();
        if inner.paused {
            return;
        }
        inner.statistics.inserts += 1;
        inner.entries.put(key, value);
    }

    /// Empty the cache.
    pub fn drop_all(&self) {
        let mut inner = self.inner.lock();
        inner.statistics.drops += 1;
        inner.entries.clear();
    }

    pub fn pause(&self) {
        self.inner.lock().paused = true;
    }

    pub fn resume(&self) {
        self.inner.lock().paused = false;
    }

    pub fn statistics(&self) -> MetaCacheStatistics {
        self.inner.lock().statistics
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().entries.cap().get()
    }
}

/// inode → DirectoryEntry
pub struct InodeCache {
    cache: MetaCache<u64, DirectoryEntry>,
}

impl InodeCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: MetaCache::new(capacity),
        }
    }

    /// Approximate per-entry footprint, used to size caches from a byte budget.
    pub fn entry_size() -> usize {
        std::mem::size_of::<DirectoryEntry>() + 2 * std::mem::size_of::<u64>() + 32
    }

    pub fn lookup(&self, inode: u64) -> Option<DirectoryEntry> {
        self.cache.lookup(&inode)
    }

    pub fn insert(&self, inode: u64, entry: DirectoryEntry) {
        self.cache.insert(inode, entry);
    }

    pub fn drop_all(&self) {
        self.cache.drop_all()
    }

    pub fn pause(&self) {
        self.cache.pause()
    }

    pub fn resume(&self) {
        self.cache.resume()
    }

    pub fn statistics(&self) -> MetaCacheStatistics {
        self.cache.statistics()
    }
}

/// inode → path
pub struct PathCache {
    cache: MetaCache<u64, String>,
}

impl PathCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: MetaCache::new(capacity),
        }
    }

    pub fn entry_size() -> usize {
        2 * std::mem::size_of::<u64>() + 64
    }

    pub fn lookup(&self, inode: u64) -> Option<String> {
        self.cache.lookup(&inode)
    }

    pub fn insert(&self, inode: u64, path: &str) {
        self.cache.insert(inode, path.to_string());
    }

    pub fn drop_all(&self) {
        self.cache.drop_all()
    }

    pub fn pause(&self) {
        self.cache.pause()
    }

    pub fn resume(&self) {
        self.cache.resume()
    }

    pub fn statistics(&self) -> MetaCacheStatistics {
        self.cache.statistics()
    }
}

/// Result of a path-hash cache probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Md5PathLookup {
    Hit(DirectoryEntry),
    /// The path is memoized as nonexistent.
    Negative,
    Miss,
}

/// path-hash → DirectoryEntry with negative-entry memoization.
pub struct Md5PathCache {
    cache: MetaCache<PathHash, DirectoryEntry>,
}

impl Md5PathCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: MetaCache::new(capacity),
        }
    }

    pub fn entry_size() -> usize {
        std::mem::size_of::<DirectoryEntry>() + std::mem::size_of::<PathHash>() + 32
    }

    pub fn lookup(&self, hash: &PathHash) -> Md5PathLookup {
        match self.cache.lookup(hash) {
            Some(entry) if entry.is_negative() => Md5PathLookup::Negative,
            Some(entry) => Md5PathLookup::Hit(entry),
            None => Md5PathLookup::Miss,
        }
    }

    pub fn insert(&self, hash: PathHash, entry: DirectoryEntry) {
        self.cache.insert(hash, entry);
    }

    /// Memoize a miss.
    pub fn insert_negative(&self, hash: PathHash) {
        let mut inner = self.cache.inner.lock();
        if inner.paused {
            return;
        }
        inner.statistics.inserts_negative += 1;
        inner.entries.put(hash, DirectoryEntry::negative());
    }

    pub fn drop_all(&self) {
        self.cache.drop_all()
    }

    pub fn pause(&self) {
        self.cache.pause()
    }

    pub fn resume(&self) {
        self.cache.resume()
    }

    pub fn statistics(&self) -> MetaCacheStatistics {
        self.cache.statistics()
    }
}
