//! Directory entries as read from catalog rows.

use crate::config::OwnerMap;
use crate::hash::{ContentHash, PathHash};

/// Row flags; stored verbatim in the catalog table.
pub mod flags {
    pub const DIRECTORY: u32 = 1;
    /// Directory that is the mountpoint of a nested catalog (set in the parent).
    pub const NESTED_MOUNTPOINT: u32 = 2;
    /// Directory that is the root of a nested catalog (set in the nested one).
    pub const NESTED_ROOT: u32 = 4;
    pub const FILE: u32 = 8;
    pub const SYMLINK: u32 = 16;
    /// Regular file stored as a list of content-addressed chunks.
    pub const CHUNKED: u32 = 32;
}

/// Marker for memoized lookup misses in the path-hash cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Special {
    #[default]
    Regular,
    Negative,
}

/// Immutable metadata record for one directory entry. The inode is assigned
/// by the owning catalog at read time, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DirectoryEntry {
    pub inode: u64,
    pub parent_hash: PathHash,
    pub name: String,
    pub flags: u32,
    /// Permission bits; the file-type bits are derived from `flags`.
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    pub size: u64,
    pub mtime: i64,
    pub symlink: Option<String>,
    pub checksum: ContentHash,
    pub hardlink_group: u64,
    pub linkcount: u32,
    pub special: Special,
}

impl DirectoryEntry {
    /// The sentinel cached for paths known not to exist.
    pub fn negative() -> Self {
        Self {
            special: Special::Negative,
            ..Default::default()
        }
    }

    pub fn is_negative(&self) -> bool {
        self.special == Special::Negative
    }

    pub fn is_directory(&self) -> bool {
        self.flags & flags::DIRECTORY != 0
    }

    pub fn is_regular(&self) -> bool {
        self.flags & flags::FILE != 0
    }

    pub fn is_link(&self) -> bool {
        self.flags & flags::SYMLINK != 0
    }

    pub fn is_chunked(&self) -> bool {
        self.flags & flags::CHUNKED != 0
    }

    pub fn is_nested_root(&self) -> bool {
        self.flags & flags::NESTED_ROOT != 0
    }

    pub fn is_nested_mountpoint(&self) -> bool {
        self.flags & flags::NESTED_MOUNTPOINT != 0
    }

    pub fn has_checksum(&self) -> bool {
        !self.checksum.is_null()
    }

    /// Full st_mode including the file-type bits.
    pub fn full_mode(&self) -> u32 {
        let kind = if self.is_directory() {
            libc::S_IFDIR
        } else if self.is_link() {
            libc::S_IFLNK
        } else {
            libc::S_IFREG
        };
        kind | (self.mode & 0o7777)
    }

    /// Translate uid/gid through the mount's owner maps.
    pub fn apply_owner_maps(&mut self, uid_map: &OwnerMap, gid_map: &OwnerMap) {
        if let Some(mapped) = uid_map.get(&self.uid) {
            self.uid = *mapped;
        }
        if let Some(mapped) = gid_map.get(&self.gid) {
            self.gid = *mapped;
        }
    }

    pub fn stat_info(&self) -> StatInfo {
        StatInfo {
            ino: self.inode,
            mode: self.full_mode(),
            nlink: if self.linkcount == 0 { 1 } else { self.linkcount },
            uid: self.uid,
            gid: self.gid,
            size: self.size,
            mtime: self.mtime,
        }
    }
}

/// Plain attribute view handed across the kernel bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatInfo {
    pub ino: u64,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u64,
    pub gid: u64,
    pub size: u64,
    pub mtime: i64,
}

/// Listing element carrying only the name and the stat view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatEntry {
    pub name: String,
    pub info: StatInfo,
}

/// One piece of a chunked file. Offsets are strictly increasing and
/// contiguous; the sizes sum to the file size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileChunk {
    pub content_hash: ContentHash,
    pub offset: u64,
    pub size: u64,
}
