//! Inode ↔ path glue.
//!
//! The kernel keeps referencing inodes across catalog reloads; the tracker
//! remembers the path of every inode the kernel holds a lookup count on,
//! independent of which catalogs are currently attached. Entries live from
//! the first positive lookup reply until the kernel forgets them.

use std::collections::HashMap;

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackerStatistics {
    pub num_inserts: u64,
    pub num_removes: u64,
    pub num_references: u64,
    pub num_hits_inode: u64,
    pub num_hits_path: u64,
    pub num_misses_inode: u64,
    pub num_misses_path: u64,
    /// `vfs_put` on inodes the tracker does not know; tolerated.
    pub num_dangling_puts: u64,
}

#[derive(Debug, Clone)]
struct TrackedEntry {
    path: String,
    nlookup: u32,
}

#[derive(Debug, Clone, Default)]
struct TrackerInner {
    inode2entry: HashMap<u64, TrackedEntry>,
    path2inode: HashMap<String, u64>,
    statistics: TrackerStatistics,
}

/// Bidirectional inode ↔ path map with VFS reference counting. All
/// operations serialize on one internal lock; both directions stay
/// consistent while `nlookup > 0`.
#[derive(Debug, Default)]
pub struct InodeTracker {
    inner: Mutex<TrackerInner>,
}

impl InodeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called on every positive reply to the kernel. Idempotent on identical
    /// pairs (the reference count still grows, mirroring the kernel's own).
    pub fn vfs_get(&self, inode: u64, path: &str) {
        let mut inner = self.inner.lock();
        inner.statistics.num_references += 1;
        match inner.inode2entry.get_mut(&inode) {
            Some(entry) => {
                entry.nlookup += 1;
            }
            None => {
                inner.statistics.num_inserts += 1;
                inner.inode2entry.insert(
                    inode,
                    TrackedEntry {
                        path: path.to_string(),
                        nlookup: 1,
                    },
                );
                inner.path2inode.insert(path.to_string(), inode);
            }
        }
    }

    /// Kernel forgets `by` references; the entry dies at zero. Unknown
    /// inodes are tolerated.
    pub fn vfs_put(&self, inode: u64, by: u32) {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.inode2entry.get_mut(&inode) else {
            inner.statistics.num_dangling_puts += 1;
            return;
        };
        entry.nlookup = entry.nlookup.saturating_sub(by);
        if entry.nlookup == 0 {
            let path = entry.path.clone();
            inner.inode2entry.remove(&inode);
            if inner.path2inode.get(&path) == Some(&inode) {
                inner.path2inode.remove(&path);
            }
            inner.statistics.num_removes += 1;
        }
    }

    pub fn find_path(&self, inode: u64) -> Option<String> {
        let mut inner = self.inner.lock();
        match inner.inode2entry.get(&inode) {
            Some(entry) => {
                let path = entry.path.clone();
                inner.statistics.num_hits_inode += 1;
                Some(path)
            }
            None => {
                inner.statistics.num_misses_inode += 1;
                None
            }
        }
    }

    pub fn find_inode(&self, path: &str) -> Option<u64> {
        let mut inner = self.inner.lock();
        match inner.path2inode.get(path).copied() {
            Some(inode) => {
                inner.statistics.num_hits_path += 1;
                Some(inode)
            }
            None => {
                inner.statistics.num_misses_path += 1;
                None
            }
        }
    }

    pub fn num_entries(&self) -> usize {
        self.inner.lock().inode2entry.len()
    }

    pub fn get_statistics(&self) -> TrackerStatistics {
        self.inner.lock().statistics
    }

    /// Deep copy for hot-reload state saving.
    pub fn snapshot(&self) -> InodeTracker {
        InodeTracker {
            inner: Mutex::new(self.inner.lock().clone()),
        }
    }
}

pub mod compat {
    //! Older releases saved the tracker as (inode → parent inode, name)
    //! containers; paths were reconstructed by walking parent links. Restores
    //! from such snapshots migrate into the current representation.

    use super::InodeTracker;
    use std::collections::HashMap;

    /// Serialized entry of a v1/v2 tracker snapshot.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct LegacyDirent {
        pub inode: u64,
        pub parent_inode: u64,
        pub name: String,
        pub references: u32,
    }

    /// v1 and v2 share the container shape; v2 only added statistics, which
    /// are not migrated.
    #[derive(Debug, Clone, Default)]
    pub struct LegacyTracker {
        pub entries: Vec<LegacyDirent>,
    }

    impl LegacyTracker {
        fn construct_path(
            &self,
            by_inode: &HashMap<u64, &LegacyDirent>,
            inode: u64,
        ) -> Option<String> {
            let entry = by_inode.get(&inode)?;
            if entry.name.is_empty() {
                // root entry
                return Some(String::new());
            }
            let parent = self.construct_path(by_inode, entry.parent_inode)?;
            Some(format!("{parent}/{}", entry.name))
        }

        /// Rebuild paths from parent links and feed them into a current
        /// tracker. Entries whose parent chain is broken are dropped (the
        /// kernel will re-lookup them and get fresh inodes).
        pub fn migrate(&self, target: &InodeTracker) -> usize {
            let by_inode: HashMap<u64, &LegacyDirent> =
                self.entries.iter().map(|e| (e.inode, e)).collect();
            let mut migrated = 0;
            for entry in &self.entries {
                let Some(path) = self.construct_path(&by_inode, entry.inode) else {
                    continue;
                };
                for _ in 0..entry.references.max(1) {
                    target.vfs_get(entry.inode, &path);
                }
                migrated += 1;
            }
            migrated
        }
    }
}
