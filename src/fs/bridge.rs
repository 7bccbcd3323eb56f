//! Types crossing the kernel bridge.
//!
//! The kernel transport itself (mount protocol, request decoding, reply
//! encoding) lives outside this crate. The operations in `fs::ops` return
//! these typed replies; the bridge glues them onto its wire format.

use std::fmt;

use crate::catalog::StatInfo;

/// errno-style error carried back over the bridge.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Errno(pub i32);

impl Errno {
    pub const NOENT: Errno = Errno(libc::ENOENT);
    pub const NOTDIR: Errno = Errno(libc::ENOTDIR);
    pub const INVAL: Errno = Errno(libc::EINVAL);
    pub const IO: Errno = Errno(libc::EIO);
    pub const MFILE: Errno = Errno(libc::EMFILE);
    pub const OPNOTSUPP: Errno = Errno(libc::EOPNOTSUPP);
    pub const EXIST: Errno = Errno(libc::EEXIST);
    pub const NODATA: Errno = Errno(libc::ENODATA);
    pub const RANGE: Errno = Errno(libc::ERANGE);
}

impl fmt::Debug for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Errno({})", self.0)
    }
}

pub type FsResult<T> = std::result::Result<T, Errno>;

/// Reply to `lookup`: a found entry or a cacheable negative (inode 0).
#[derive(Debug, Clone, PartialEq)]
pub struct EntryReply {
    pub ino: u64,
    pub attr: StatInfo,
    /// Seconds the kernel may cache this entry and its attributes.
    pub timeout: f64,
}

impl EntryReply {
    pub fn negative(timeout: f64) -> Self {
        Self {
            ino: 0,
            attr: StatInfo::default(),
            timeout,
        }
    }

    pub fn is_negative(&self) -> bool {
        self.ino == 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttrReply {
    pub attr: StatInfo,
    pub timeout: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatFsReply {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
}

/// Reply to `getxattr`/`listxattr` with the size-probing protocol: a zero
/// `probe_size` asks for the value length only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XattrReply {
    Size(usize),
    Data(Vec<u8>),
}

/// File handle crossing the bridge. Transports that force a single integer
/// field use the raw encoding where a negative value marks a chunked handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileHandle {
    /// Plain open file backed by one cache object.
    Plain(u64),
    /// Synthetic handle into the chunk tables.
    Chunked(u64),
}

impl FileHandle {
    pub fn to_raw(self) -> i64 {
        match self {
            FileHandle::Plain(id) => id as i64,
            FileHandle::Chunked(id) => -(id as i64),
        }
    }

    pub fn from_raw(raw: i64) -> Self {
        if raw < 0 {
            FileHandle::Chunked((-raw) as u64)
        } else {
            FileHandle::Plain(raw as u64)
        }
    }
}

/// Size of a serialized direntry record: fixed header plus the name, padded
/// to an 8-byte boundary.
fn direntry_size(name_len: usize) -> usize {
    (DIRENTRY_HEADER_SIZE + name_len + 7) & !7
}

const DIRENTRY_HEADER_SIZE: usize = 8 + 8 + 4 + 4; // ino, next offset, mode, name length

/// Eagerly built directory listing, replied in slices. The buffer grows by
/// doubling; very large listings stay in one allocation.
#[derive(Debug, Clone, Default)]
pub struct DirectoryListing {
    buffer: Vec<u8>,
}

impl DirectoryListing {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    /// Append one entry the way the transport's `add_direntry` helper would:
    /// the record carries the offset of the next record for seekable readdir.
    pub fn add_direntry(&mut self, name: &str, attr: &StatInfo) {
        let record_size = direntry_size(name.len());
        let needed = self.buffer.len() + record_size;
        if needed > self.buffer.capacity() {
            let mut target = std::cmp::max(self.buffer.capacity(), 512);
            while target < needed {
                target *= 2;
            }
            self.buffer.reserve(target - self.buffer.len());
        }

        let next_offset = (self.buffer.len() + record_size) as u64;
        self.buffer.extend_from_slice(&attr.ino.to_ne_bytes());
        self.buffer.extend_from_slice(&next_offset.to_ne_bytes());
        self.buffer.extend_from_slice(&attr.mode.to_ne_bytes());
        self.buffer
            .extend_from_slice(&(name.len() as u32).to_ne_bytes());
        self.buffer.extend_from_slice(name.as_bytes());
        while self.buffer.len() < next_offset as usize {
            self.buffer.push(0);
        }
    }

    /// Slice for one `readdir` reply; empty past the end.
    pub fn slice(&self, offset: u64, max_size: usize) -> &[u8] {
        let len = self.buffer.len() as u64;
        if offset >= len {
            return &[];
        }
        let start = offset as usize;
        let end = std::cmp::min(start + max_size, self.buffer.len());
        &self.buffer[start..end]
    }

    pub fn size(&self) -> usize {
        self.buffer.len()
    }

    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }
}
