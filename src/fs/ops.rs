//! Filesystem operations.
//!
//! Translation of the kernel upcalls into catalog, cache and tracker calls.
//! The layer itself is stateless; everything lives on [`MountState`]. Every
//! operation that touches catalog state brackets it with the remount fence.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, warn};

use super::bridge::{
    AttrReply, DirectoryListing, EntryReply, Errno, FileHandle, FsResult, StatFsReply, XattrReply,
};
use super::fence::FenceGuard;
use super::MountState;
use crate::catalog::{DirectoryEntry, LookupMode};
use crate::hash::{parent_path, ContentHash, ContentHasher, ObjectSuffix, PathHash};

/// Clear the backoff memory this long after the last error.
const FORGET_DOS: Duration = Duration::from_secs(10);
/// Upper bound for the exponential error delay.
const MAX_IO_DELAY: Duration = Duration::from_millis(2000);
/// Initial delay is random in [2, 32) milliseconds.
const MAX_INIT_IO_DELAY_MS: u64 = 32;

#[derive(Debug, Default)]
struct BackoffState {
    last_error: Option<Instant>,
    delay: Duration,
}

/// Process-wide request damper: failure storms against the upstream proxies
/// are spaced out with an exponential delay. Deliberately a single shared
/// state for all requests.
#[derive(Debug, Default)]
pub struct IoBackoff {
    state: Mutex<BackoffState>,
}

impl IoBackoff {
    /// Record an I/O error; returns how long the caller must sleep.
    pub fn on_io_error(&self) -> Duration {
        let mut state = self.state.lock();
        let now = Instant::now();
        let sleep = match state.last_error {
            Some(last) if now.duration_since(last) < FORGET_DOS => {
                let sleep = state.delay;
                state.delay = std::cmp::min(state.delay * 2, MAX_IO_DELAY);
                sleep
            }
            _ => {
                let initial = rand::thread_rng().gen_range(2..MAX_INIT_IO_DELAY_MS);
                state.delay = Duration::from_millis(initial);
                Duration::ZERO
            }
        };
        state.last_error = Some(now);
        sleep
    }
}

impl MountState {
    // Resolution helpers ----------------------------------------------------

    /// Inode to entry, through the inode cache, the tracker and the catalogs.
    /// Failing here is normal after a catalog reload.
    fn get_dirent_for_inode(&self, ino: u64) -> FsResult<Option<DirectoryEntry>> {
        if let Some(entry) = self.inode_cache.lookup(ino) {
            return Ok(Some(entry));
        }

        if ino == self.catalog_mgr.get_root_inode() {
            if let Some(mut entry) = self
                .catalog_mgr
                .lookup_path("", LookupMode::Sole)
                .map_err(|_| Errno::IO)?
            {
                entry.inode = ino;
                self.inode_cache.insert(ino, entry.clone());
                return Ok(Some(entry));
            }
            return Ok(None);
        }

        let Some(path) = self.tracker().find_path(ino) else {
            debug!(ino, "inode not held by the kernel; lookup failure");
            return Ok(None);
        };
        match self
            .catalog_mgr
            .lookup_path(&path, LookupMode::Sole)
            .map_err(|_| Errno::IO)?
        {
            Some(mut entry) => {
                // The inode the kernel holds stays authoritative.
                entry.inode = ino;
                self.inode_cache.insert(ino, entry.clone());
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    /// Path to entry through the path-hash cache, with negative memoization.
    fn get_dirent_for_path(&self, path: &str) -> FsResult<Option<DirectoryEntry>> {
        let live_inode = self.tracker().find_inode(path);
        let hash = PathHash::of_path(path);

        match self.md5path_cache.lookup(&hash) {
            crate::cache::meta::Md5PathLookup::Negative => return Ok(None),
            crate::cache::meta::Md5PathLookup::Hit(mut entry) => {
                if let Some(inode) = live_inode {
                    entry.inode = inode;
                }
                return Ok(Some(entry));
            }
            crate::cache::meta::Md5PathLookup::Miss => {}
        }

        match self
            .catalog_mgr
            .lookup_path(path, LookupMode::Sole)
            .map_err(|_| Errno::IO)?
        {
            Some(mut entry) => {
                if let Some(inode) = live_inode {
                    entry.inode = inode;
                }
                self.md5path_cache.insert(hash, entry.clone());
                Ok(Some(entry))
            }
            None => {
                self.md5path_cache.insert_negative(hash);
                Ok(None)
            }
        }
    }

    fn get_path_for_inode(&self, ino: u64) -> Option<String> {
        if let Some(path) = self.path_cache.lookup(ino) {
            return Some(path);
        }
        if ino == self.catalog_mgr.get_root_inode() {
            return Some(String::new());
        }
        let path = self.tracker().find_path(ino)?;
        self.path_cache.insert(ino, &path);
        Some(path)
    }

    // Metadata operations ---------------------------------------------------

    /// Find the entry for a name in a directory. Negative replies carry
    /// inode 0 and are kernel-cacheable. This (or getattr) runs before every
    /// other operation, so the catalog TTL is checked here.
    pub fn lookup(&self, parent: u64, name: &str) -> FsResult<EntryReply> {
        self.counters.num_lookup.fetch_add(1, Ordering::Relaxed);
        self.remount_check();

        let _fence = FenceGuard::new(&self.fence);
        let parent = self.catalog_mgr.mangle_inode(parent);
        let timeout = self.kcache_timeout();
        debug!(parent, name, "lookup");

        let replied = self.lookup_locked(parent, name)?;
        match replied {
            Some((entry, path)) => {
                if let Some(path) = path {
                    self.tracker().vfs_get(entry.inode, &path);
                }
                Ok(EntryReply {
                    ino: entry.inode,
                    attr: entry.stat_info(),
                    timeout,
                })
            }
            None => {
                self.counters
                    .num_lookup_negative
                    .fetch_add(1, Ordering::Relaxed);
                Ok(EntryReply::negative(timeout))
            }
        }
    }

    /// Resolution part of `lookup`; returns the entry plus the path to
    /// register in the tracker (None for `.`/`..`, which the kernel never
    /// forgets individually).
    #[allow(clippy::type_complexity)]
    fn lookup_locked(
        &self,
        parent: u64,
        name: &str,
    ) -> FsResult<Option<(DirectoryEntry, Option<String>)>> {
        if name == "." {
            return Ok(self
                .get_dirent_for_inode(parent)?
                .map(|entry| (entry, None)));
        }
        if name == ".." {
            let Some(parent_entry) = self.get_dirent_for_inode(parent)? else {
                return Ok(None);
            };
            if parent_entry.inode == self.catalog_mgr.get_root_inode() {
                let mut entry = parent_entry;
                entry.inode = 1;
                return Ok(Some((entry, None)));
            }
            let Some(parent_path_str) = self.get_path_for_inode(parent) else {
                return Ok(None);
            };
            return Ok(self
                .get_dirent_for_path(parent_path(&parent_path_str))?
                .map(|entry| (entry, None)));
        }

        let Some(parent_path_str) = self.get_path_for_inode(parent) else {
            debug!(parent, "no path for parent inode found");
            return Ok(None);
        };
        let path = format!("{parent_path_str}/{name}");
        Ok(self
            .get_dirent_for_path(&path)?
            .map(|entry| (entry, Some(path))))
    }

    /// Kernel dropped `nlookup` references on the inode.
    pub fn forget(&self, ino: u64, nlookup: u32) {
        self.counters.num_forget.fetch_add(1, Ordering::Relaxed);
        // The kernel never really forgets the root.
        if ino == 1 {
            return;
        }
        let _fence = FenceGuard::new(&self.fence);
        let ino = self.catalog_mgr.mangle_inode(ino);
        debug!(ino, nlookup, "forget");
        if !self.settings().nfs_source {
            self.tracker().vfs_put(ino, nlookup);
        }
    }

    pub fn getattr(&self, ino: u64) -> FsResult<AttrReply> {
        self.counters.num_stat.fetch_add(1, Ordering::Relaxed);
        self.remount_check();

        let _fence = FenceGuard::new(&self.fence);
        let ino = self.catalog_mgr.mangle_inode(ino);
        let entry = self.get_dirent_for_inode(ino)?.ok_or(Errno::NOENT)?;
        Ok(AttrReply {
            attr: entry.stat_info(),
            timeout: self.kcache_timeout(),
        })
    }

    pub fn readlink(&self, ino: u64) -> FsResult<String> {
        self.counters.num_readlink.fetch_add(1, Ordering::Relaxed);

        let _fence = FenceGuard::new(&self.fence);
        let ino = self.catalog_mgr.mangle_inode(ino);
        let entry = self.get_dirent_for_inode(ino)?.ok_or(Errno::NOENT)?;
        if !entry.is_link() {
            return Err(Errno::INVAL);
        }
        entry.symlink.ok_or(Errno::INVAL)
    }

    // Directory operations --------------------------------------------------

    /// Build the full listing eagerly and hand out a handle into it.
    pub fn opendir(&self, ino: u64) -> FsResult<u64> {
        self.remount_check();

        let fence = FenceGuard::new(&self.fence);
        let ino = self.catalog_mgr.mangle_inode(ino);
        debug!(ino, "opendir");

        let path = self.get_path_for_inode(ino).ok_or(Errno::NOENT)?;
        let entry = self.get_dirent_for_inode(ino)?.ok_or(Errno::NOENT)?;
        if !entry.is_directory() {
            return Err(Errno::NOTDIR);
        }

        let mut listing = DirectoryListing::with_capacity(512);
        listing.add_direntry(".", &entry.stat_info());
        if entry.inode != self.catalog_mgr.get_root_inode() {
            if let Some(parent_entry) = self.get_dirent_for_path(parent_path(&path))? {
                listing.add_direntry("..", &parent_entry.stat_info());
            }
        }

        let children = self
            .catalog_mgr
            .listing_stat(&path)
            .map_err(|_| Errno::IO)?;
        for child in &children {
            let child_path = format!("{path}/{}", child.name);
            // Fix the inode through the live resolution path; entries can
            // vanish when a reload happened between listing and lookup.
            let Some(child_entry) = self.get_dirent_for_path(&child_path)? else {
                debug!(child = %child_path, "listing entry vanished, skipping");
                continue;
            };
            let mut info = child.info;
            info.ino = child_entry.inode;
            listing.add_direntry(&child.name, &info);
        }
        drop(fence);

        let handle = self
            .next_dir_handle
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.dir_handles.insert(handle, listing);
        self.counters.num_dir_open.fetch_add(1, Ordering::Relaxed);
        self.open_dirs.fetch_add(1, Ordering::Relaxed);
        Ok(handle)
    }

    /// Slice the stored listing buffer; large listings go out in pieces.
    pub fn readdir(&self, handle: u64, size: usize, offset: u64) -> FsResult<Vec<u8>> {
        let listing = self.dir_handles.get(&handle).ok_or(Errno::INVAL)?;
        Ok(listing.slice(offset, size).to_vec())
    }

    pub fn releasedir(&self, handle: u64) -> FsResult<()> {
        match self.dir_handles.remove(&handle) {
            Some(_) => {
                self.open_dirs.fetch_sub(1, Ordering::Relaxed);
                Ok(())
            }
            None => Err(Errno::INVAL),
        }
    }

    // File operations -------------------------------------------------------

    /// Open a file: fetch it into the cache, or install the chunk table for
    /// chunked files (their data is fetched per chunk at read time).
    pub fn open(&self, ino: u64, flags: i32) -> FsResult<FileHandle> {
        let fence = FenceGuard::new(&self.fence);
        let ino = self.catalog_mgr.mangle_inode(ino);
        debug!(ino, "open");

        let entry = self.get_dirent_for_inode(ino)?.ok_or(Errno::NOENT)?;
        let path = self.get_path_for_inode(ino).ok_or(Errno::NOENT)?;
        drop(fence);

        if flags & libc::O_EXCL != 0 {
            // Read-only filesystem; matches the original's reply.
            return Err(Errno::EXIST);
        }

        self.counters.num_open.fetch_add(1, Ordering::Relaxed);

        if entry.is_chunked() {
            debug!(path = %path, "chunked file opened, download delayed to read");
            if self.open_files.fetch_add(1, Ordering::Relaxed) >= self.max_usable_fds() {
                self.open_files.fetch_sub(1, Ordering::Relaxed);
                warn!("open file descriptor limit exceeded");
                return Err(Errno::MFILE);
            }
            let opened = self.chunked.open(ino, &path, || {
                let _fence = FenceGuard::new(&self.fence);
                self.catalog_mgr.list_chunks(&path).map_err(|_| Errno::IO)
            });
            return match opened {
                Ok(handle) => Ok(FileHandle::Chunked(handle)),
                Err(err) => {
                    self.open_files.fetch_sub(1, Ordering::Relaxed);
                    Err(err)
                }
            };
        }

        match self
            .fetcher()
            .fetch_object(&entry.checksum, &path, ObjectSuffix::Plain)
        {
            Ok(object) => {
                if self.open_files.fetch_add(1, Ordering::Relaxed) >= self.max_usable_fds() {
                    self.open_files.fetch_sub(1, Ordering::Relaxed);
                    warn!("open file descriptor limit exceeded");
                    return Err(Errno::MFILE);
                }
                let fd = self.next_plain_fd.fetch_add(1, Ordering::Relaxed);
                self.open_plain_files.insert(fd, object);
                debug!(path = %path, fd, "file opened");
                Ok(FileHandle::Plain(fd))
            }
            Err(err) => {
                warn!(ino, checksum = %entry.checksum, %err, "failed to open object");
                // Squid DoS prevention: space out failure storms.
                let sleep = self.io_backoff().on_io_error();
                if !sleep.is_zero() {
                    std::thread::sleep(sleep);
                }
                self.counters.num_io_error.fetch_add(1, Ordering::Relaxed);
                Err(Errno::IO)
            }
        }
    }

    /// Positioned read, dispatched by handle kind.
    pub fn read(&self, ino: u64, fh: FileHandle, size: usize, offset: u64) -> FsResult<Vec<u8>> {
        self.counters.num_read.fetch_add(1, Ordering::Relaxed);
        let ino = self.catalog_mgr.mangle_inode(ino);

        match fh {
            FileHandle::Chunked(handle) => self.chunked.read(ino, handle, size, offset),
            FileHandle::Plain(fd) => {
                let object = self.open_plain_files.get(&fd).ok_or(Errno::INVAL)?;
                let mut buf = vec![0u8; size];
                let got = object.pread_full(&mut buf, offset).map_err(|err| {
                    warn!(ino, fd, %err, "pread failed");
                    Errno::IO
                })?;
                buf.truncate(got);
                Ok(buf)
            }
        }
    }

    pub fn release(&self, ino: u64, fh: FileHandle) -> FsResult<()> {
        let ino = self.catalog_mgr.mangle_inode(ino);
        match fh {
            FileHandle::Chunked(handle) => {
                debug!(ino, handle, "releasing chunk handle");
                self.chunked.release(ino, handle);
                self.open_files.fetch_sub(1, Ordering::Relaxed);
            }
            FileHandle::Plain(fd) => {
                if self.open_plain_files.remove(&fd).is_some() {
                    self.open_files.fetch_sub(1, Ordering::Relaxed);
                }
            }
        }
        Ok(())
    }

    // Statistics and attributes ---------------------------------------------

    pub fn statfs(&self, _ino: u64) -> FsResult<StatFsReply> {
        // Zero capacity makes the filesystem invisible to df.
        let capacity = self.quota().capacity();
        if capacity == 0 {
            return Ok(StatFsReply::default());
        }

        let used = self.quota().used();
        let mut reply = StatFsReply {
            bsize: 1,
            ..Default::default()
        };
        let available = if capacity == u64::MAX {
            // Unrestricted cache: free space of the cache directory's fs.
            let available = host_available_bytes(self.upper_cache().dir());
            reply.blocks = used + available;
            available
        } else {
            reply.blocks = capacity;
            capacity.saturating_sub(used)
        };
        reply.bfree = available;
        reply.bavail = available;

        let _fence = FenceGuard::new(&self.fence);
        reply.files = self.catalog_mgr.all_inodes();
        reply.ffree = self
            .catalog_mgr
            .all_inodes()
            .saturating_sub(self.catalog_mgr.loaded_inodes());
        Ok(reply)
    }

    pub fn getxattr(&self, ino: u64, name: &str, probe_size: usize) -> FsResult<XattrReply> {
        let fence = FenceGuard::new(&self.fence);
        let ino = self.catalog_mgr.mangle_inode(ino);
        let entry = self.get_dirent_for_inode(ino)?.ok_or(Errno::NOENT)?;
        drop(fence);

        let value = self.xattr_value(&entry, name)?;
        if probe_size == 0 {
            Ok(XattrReply::Size(value.len()))
        } else if probe_size >= value.len() {
            Ok(XattrReply::Data(value.into_bytes()))
        } else {
            Err(Errno::RANGE)
        }
    }

    fn xattr_value(&self, entry: &DirectoryEntry, name: &str) -> FsResult<String> {
        let settings = self.settings();
        let transfers = self.fetcher().counters();
        let value = match name {
            "user.pid" => self.pid().to_string(),
            "user.version" => env!("CARGO_PKG_VERSION").to_string(),
            "user.hash" => {
                if !entry.has_checksum() {
                    return Err(Errno::NODATA);
                }
                format!("{} ({})", entry.checksum, entry.checksum.algorithm.name())
            }
            "user.lhash" => {
                if !entry.has_checksum() {
                    return Err(Errno::NODATA);
                }
                match self.fetcher().cache().open(&entry.checksum) {
                    Err(_) => "Not in cache".to_string(),
                    Ok(object) => {
                        let hash = local_object_hash(&object).ok_or(Errno::IO)?;
                        format!("{hash} ({})", hash.algorithm.name())
                    }
                }
            }
            "user.revision" => self.catalog_mgr.get_revision().to_string(),
            "user.root_hash" => self
                .catalog_mgr
                .get_root_hash()
                .map(|hash| hash.to_hex())
                .unwrap_or_default(),
            "user.expires" => {
                let valid_until = self.catalogs_valid_until();
                if valid_until == super::DEADLINE_INDEFINITE {
                    "never (fixed root catalog)".to_string()
                } else {
                    let now = std::time::SystemTime::now()
                        .duration_since(std::time::UNIX_EPOCH)
                        .unwrap_or_default()
                        .as_secs() as i64;
                    ((valid_until - now) / 60).to_string()
                }
            }
            "user.maxfd" => self.max_usable_fds().to_string(),
            "user.usedfd" => self.num_open_files().to_string(),
            "user.useddirp" => self.num_open_dirs().to_string(),
            "user.nioerr" => self.counters.num_io_error.load(Ordering::Relaxed).to_string(),
            "user.proxy" => settings
                .http_proxy
                .clone()
                .unwrap_or_else(|| "DIRECT".to_string()),
            "user.host" => settings.server_url.clone(),
            "user.uptime" => {
                let now = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs();
                (now.saturating_sub(self.boot_time()) / 60).to_string()
            }
            "user.nclg" => self.catalog_mgr.num_catalogs().to_string(),
            "user.nopen" => self.counters.num_open.load(Ordering::Relaxed).to_string(),
            "user.ndiropen" => self.counters.num_dir_open.load(Ordering::Relaxed).to_string(),
            "user.ndownload" => transfers.num_downloads.load(Ordering::Relaxed).to_string(),
            "user.timeout" => settings.timeout.to_string(),
            "user.timeout_direct" => settings.timeout_direct.to_string(),
            "user.rx" => (transfers.bytes.load(Ordering::Relaxed) / 1024).to_string(),
            "user.speed" => {
                let rx = transfers.bytes.load(Ordering::Relaxed);
                let millis = transfers.millis.load(Ordering::Relaxed);
                if millis == 0 {
                    "n/a".to_string()
                } else {
                    ((rx / 1024) * 1000 / millis).to_string()
                }
            }
            "user.fqrn" => settings.fqrn.clone(),
            _ => return Err(Errno::NODATA),
        };
        Ok(value)
    }

    pub fn listxattr(&self, ino: u64, probe_size: usize) -> FsResult<XattrReply> {
        let fence = FenceGuard::new(&self.fence);
        let ino = self.catalog_mgr.mangle_inode(ino);
        let entry = self.get_dirent_for_inode(ino)?.ok_or(Errno::NOENT)?;
        drop(fence);

        let mut names: Vec<&str> = vec![
            "user.pid",
            "user.version",
            "user.revision",
            "user.root_hash",
            "user.expires",
            "user.maxfd",
            "user.usedfd",
            "user.useddirp",
            "user.nioerr",
            "user.proxy",
            "user.host",
            "user.uptime",
            "user.nclg",
            "user.nopen",
            "user.ndiropen",
            "user.ndownload",
            "user.timeout",
            "user.timeout_direct",
            "user.rx",
            "user.speed",
            "user.fqrn",
        ];
        if entry.has_checksum() {
            names.push("user.hash");
            names.push("user.lhash");
        }

        let mut list = Vec::new();
        for name in names {
            list.extend_from_slice(name.as_bytes());
            list.push(0);
        }
        if probe_size == 0 {
            Ok(XattrReply::Size(list.len()))
        } else if probe_size >= list.len() {
            Ok(XattrReply::Data(list))
        } else {
            Err(Errno::RANGE)
        }
    }

    fn io_backoff(&self) -> &IoBackoff {
        &self.backoff
    }
}

/// Hash of the local (re-deflated) replica of a cached object; lets clients
/// verify what the cache would serve.
fn local_object_hash(object: &crate::cache::ObjectHandle) -> Option<ContentHash> {
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::io::Write;

    struct HashingSink(ContentHasher);
    impl Write for HashingSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.update(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    let mut encoder = ZlibEncoder::new(HashingSink(ContentHasher::new()), Compression::default());
    let mut buf = vec![0u8; 64 * 1024];
    let mut offset = 0u64;
    loop {
        let got = object.pread(&mut buf, offset).ok()?;
        if got == 0 {
            break;
        }
        encoder.write_all(&buf[..got]).ok()?;
        offset += got as u64;
    }
    let sink = encoder.finish().ok()?;
    Some(sink.0.finalize())
}

/// Free bytes on the filesystem backing the cache directory.
fn host_available_bytes(dir: &std::path::Path) -> u64 {
    use std::os::unix::ffi::OsStrExt;
    let Ok(path) = std::ffi::CString::new(dir.as_os_str().as_bytes()) else {
        return 0;
    };
    let mut stats: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(path.as_ptr(), &mut stats) };
    if rc != 0 {
        return 0;
    }
    stats.f_bavail as u64 * stats.f_frsize as u64
}
