//! Read path for chunked files.
//!
//! A chunked file is assembled from independently content-addressed blobs.
//! The chunk list is loaded from the catalog on first open and reference
//! counted by open handles; every handle keeps at most one hot chunk
//! descriptor. A pool of per-handle locks keeps independent handles from
//! contending; the global table lock is never held across a chunk fetch.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::bridge::{Errno, FsResult};
use crate::cache::{ObjectFetcher, ObjectHandle};
use crate::catalog::FileChunk;
use crate::hash::ObjectSuffix;

pub const NUM_HANDLE_LOCKS: usize = 128;

/// Refcounted chunk list shared by all open handles of one inode.
#[derive(Debug, Clone)]
pub struct ChunkListRef {
    pub chunks: Arc<Vec<FileChunk>>,
    pub path: String,
}

/// Hot chunk descriptor of one open handle.
#[derive(Debug, Default)]
pub struct ChunkFd {
    pub handle: Option<ObjectHandle>,
    pub chunk_idx: usize,
}

impl ChunkFd {
    fn try_clone(&self) -> ChunkFd {
        ChunkFd {
            handle: self.handle.as_ref().and_then(|h| h.try_clone().ok()),
            chunk_idx: self.chunk_idx,
        }
    }
}

#[derive(Debug, Default)]
pub struct ChunkTables {
    pub inode2chunks: HashMap<u64, ChunkListRef>,
    pub inode2references: HashMap<u64, u32>,
    pub handle2fd: HashMap<u64, ChunkFd>,
    pub next_handle: u64,
}

impl ChunkTables {
    fn snapshot(&self) -> ChunkTables {
        ChunkTables {
            inode2chunks: self.inode2chunks.clone(),
            inode2references: self.inode2references.clone(),
            handle2fd: self
                .handle2fd
                .iter()
                .map(|(handle, fd)| (*handle, fd.try_clone()))
                .collect(),
            next_handle: self.next_handle,
        }
    }
}

pub struct ChunkedReader {
    fetcher: Arc<ObjectFetcher>,
    tables: Mutex<ChunkTables>,
    handle_locks: Vec<Mutex<()>>,
}

impl ChunkedReader {
    pub fn new(fetcher: Arc<ObjectFetcher>) -> Self {
        Self {
            fetcher,
            tables: Mutex::new(ChunkTables {
                next_handle: 1,
                ..Default::default()
            }),
            handle_locks: (0..NUM_HANDLE_LOCKS).map(|_| Mutex::new(())).collect(),
        }
    }

    fn handle_lock(&self, handle: u64) -> &Mutex<()> {
        &self.handle_locks[(handle as usize) % NUM_HANDLE_LOCKS]
    }

    /// Install (or re-reference) the chunk list for `inode` and allocate a
    /// synthetic handle. `load_chunks` hits the catalog and runs without the
    /// table lock held; a concurrent open of the same inode is resolved by
    /// re-checking afterwards.
    pub fn open<F>(&self, inode: u64, path: &str, load_chunks: F) -> FsResult<u64>
    where
        F: FnOnce() -> FsResult<Vec<FileChunk>>,
    {
        let mut loader = Some(load_chunks);
        let mut loaded: Option<Vec<FileChunk>> = None;
        loop {
            {
                let mut tables = self.tables.lock();
                if tables.inode2chunks.contains_key(&inode) {
                    *tables.inode2references.entry(inode).or_insert(0) += 1;
                    return Ok(Self::new_handle(&mut tables, inode));
                }
                if let Some(chunks) = loaded.take() {
                    if chunks.is_empty() {
                        warn!(inode, path, "file is marked chunked but has no chunks");
                        return Err(Errno::IO);
                    }
                    tables.inode2chunks.insert(
                        inode,
                        ChunkListRef {
                            chunks: Arc::new(chunks),
                            path: path.to_string(),
                        },
                    );
                    tables.inode2references.insert(inode, 1);
                    return Ok(Self::new_handle(&mut tables, inode));
                }
            }
            // First open of this inode: hit the catalog without the table
            // lock held, then re-check for a racing open.
            let load = loader.take().expect("chunk list loaded at most once");
            loaded = Some(load()?);
        }
    }

    fn new_handle(tables: &mut ChunkTables, inode: u64) -> u64 {
        let handle = tables.next_handle;
        tables.next_handle += 1;
        tables.handle2fd.insert(handle, ChunkFd::default());
        debug!(inode, handle, "linked chunk handle to inode");
        handle
    }

    /// Smallest chunk containing `offset` (or the last chunk for reads at the
    /// end of the file).
    fn chunk_index_for(chunks: &[FileChunk], offset: u64) -> usize {
        let after = chunks.partition_point(|chunk| chunk.offset <= offset);
        after.saturating_sub(1)
    }

    /// Read `size` bytes at `offset`, crossing chunk boundaries as needed.
    /// Returns short data at end of file.
    pub fn read(&self, inode: u64, handle: u64, size: usize, offset: u64) -> FsResult<Vec<u8>> {
        let chunk_list = {
            let tables = self.tables.lock();
            tables.inode2chunks.get(&inode).cloned()
        };
        let Some(chunk_list) = chunk_list else {
            return Err(Errno::INVAL);
        };
        let chunks = &chunk_list.chunks;
        let mut chunk_idx = Self::chunk_index_for(chunks, offset);

        let _handle_guard = self.handle_lock(handle).lock();
        let mut chunk_fd = {
            let mut tables = self.tables.lock();
            match tables.handle2fd.remove(&handle) {
                Some(fd) => fd,
                None => return Err(Errno::INVAL),
            }
        };

        let mut data = Vec::with_capacity(size);
        let mut offset_in_chunk = offset.saturating_sub(chunks[chunk_idx].offset);
        let result = loop {
            if data.len() >= size || chunk_idx >= chunks.len() {
                break Ok(());
            }
            let chunk = &chunks[chunk_idx];

            if chunk_fd.handle.is_none() || chunk_fd.chunk_idx != chunk_idx {
                chunk_fd.handle.take();
                let description = format!("chunk of {}", chunk_list.path);
                match self.fetcher.fetch_object(
                    &chunk.content_hash,
                    &description,
                    ObjectSuffix::Partial,
                ) {
                    Ok(object) => {
                        chunk_fd.handle = Some(object);
                        chunk_fd.chunk_idx = chunk_idx;
                    }
                    Err(err) => {
                        warn!(inode, chunk_idx, %err, "chunk fetch failed");
                        break Err(Errno::IO);
                    }
                }
            }

            let object = chunk_fd.handle.as_ref().expect("hot chunk open");
            let remaining_in_chunk = chunk.size.saturating_sub(offset_in_chunk) as usize;
            if remaining_in_chunk == 0 {
                // Read starts at or past end of file.
                break Ok(());
            }
            let want = std::cmp::min(size - data.len(), remaining_in_chunk);
            let mut buf = vec![0u8; want];
            match object.pread_full(&mut buf, offset_in_chunk) {
                Ok(got) => {
                    buf.truncate(got);
                    data.extend_from_slice(&buf);
                    if got < want {
                        warn!(inode, chunk_idx, got, want, "short read from chunk");
                        break Err(Errno::IO);
                    }
                }
                Err(err) => {
                    warn!(inode, chunk_idx, %err, "pread from chunk failed");
                    break Err(Errno::IO);
                }
            }

            chunk_idx += 1;
            offset_in_chunk = 0;
        };

        self.tables.lock().handle2fd.insert(handle, chunk_fd);
        result.map(|_| data)
    }

    /// Drop one handle; the last reference tears down the chunk list.
    pub fn release(&self, inode: u64, handle: u64) {
        let mut tables = self.tables.lock();
        if tables.handle2fd.remove(&handle).is_none() {
            debug!(inode, handle, "release of unknown chunk handle");
        }
        let remaining = match tables.inode2references.get_mut(&inode) {
            Some(refs) => {
                *refs = refs.saturating_sub(1);
                *refs
            }
            None => return,
        };
        if remaining == 0 {
            debug!(inode, "releasing chunk list");
            tables.inode2references.remove(&inode);
            tables.inode2chunks.remove(&inode);
        }
    }

    pub fn num_open_chunk_lists(&self) -> usize {
        self.tables.lock().inode2chunks.len()
    }

    /// Copy of the tables for hot-reload state saving; hot descriptors are
    /// duplicated where possible.
    pub fn save_state(&self) -> ChunkTables {
        self.tables.lock().snapshot()
    }

    pub fn restore_state(&self, state: ChunkTables) {
        let mut tables = self.tables.lock();
        let next_handle = state
            .handle2fd
            .keys()
            .max()
            .map(|max| max + 1)
            .unwrap_or(1)
            .max(state.next_handle);
        *tables = state;
        tables.next_handle = next_handle;
    }
}
