//! Mount state and remount orchestration.
//!
//! One `MountState` value is the single construction site for everything a
//! mounted repository needs: catalog tree, caches, tracker, chunk tables and
//! counters. The kernel transport drives the operations in [`ops`]; a
//! supervisor thread drives the TTL via [`MountState::tick`].

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::binding;
use crate::cache::{
    InodeCache, Md5PathCache, ObjectFetcher, PathCache, PosixCacheManager, QuotaManager,
    TieredCacheManager,
};
use crate::catalog::{
    CatalogManager, InodeAnnotation, InodeGenerationAnnotation, LoadOutcome,
};
use crate::config::Settings;
use crate::download::{Downloader, SignatureVerifier};
use crate::glue::InodeTracker;
use crate::hash::ContentHash;
use crate::{Error, Result};

pub mod bridge;
pub mod chunked;
pub mod fence;
pub mod ops;
pub mod state;

use bridge::DirectoryListing;
use chunked::ChunkedReader;
use fence::RemountFence;
use state::{InodeGenerationInfo, SavedState};

/// Grace added to the kernel cache timeout before the catalog swap.
pub const RELOAD_SAFETY_MARGIN_MS: u64 = 500;
/// Retry interval after a failed or offline reload.
pub const SHORT_TERM_TTL: u64 = 180;
/// File descriptors kept back for internal use (sqlite, transactions).
pub const NUM_RESERVED_FD: i32 = 512;
/// `catalogs_valid_until` value for pinned catalogs.
pub const DEADLINE_INDEFINITE: i64 = -1;

#[derive(Debug, Default)]
pub struct FsCounters {
    pub num_lookup: AtomicU64,
    pub num_lookup_negative: AtomicU64,
    pub num_stat: AtomicU64,
    pub num_open: AtomicU64,
    pub num_dir_open: AtomicU64,
    pub num_read: AtomicU64,
    pub num_readlink: AtomicU64,
    pub num_forget: AtomicU64,
    pub num_io_error: AtomicU32,
}

#[derive(Debug, Default)]
struct RemountFlags {
    maintenance_mode: AtomicBool,
    drainout_mode: AtomicBool,
    catalogs_expired: AtomicBool,
    /// Only one thread may finish a reload.
    reload_critical_section: AtomicBool,
    /// Unix seconds; meaningful while `drainout_mode` is set.
    drainout_deadline: AtomicI64,
    catalogs_valid_until: AtomicI64,
}

pub struct MountState {
    settings: Settings,
    pub catalog_mgr: CatalogManager,
    fetcher: Arc<ObjectFetcher>,
    upper_cache: Arc<PosixCacheManager>,
    quota: Arc<dyn QuotaManager>,

    pub inode_cache: InodeCache,
    pub path_cache: PathCache,
    pub md5path_cache: Md5PathCache,
    inode_tracker: RwLock<Arc<InodeTracker>>,
    pub chunked: ChunkedReader,
    pub fence: RemountFence,

    dir_handles: DashMap<u64, DirectoryListing>,
    next_dir_handle: AtomicU64,
    open_plain_files: DashMap<u64, crate::cache::ObjectHandle>,
    next_plain_fd: AtomicU64,

    open_files: AtomicI32,
    open_dirs: AtomicI32,
    max_open_files: i32,

    pub counters: FsCounters,
    backoff: ops::IoBackoff,
    annotation: Arc<InodeGenerationAnnotation>,
    inode_generation: Mutex<InodeGenerationInfo>,
    remount: RemountFlags,

    boot_time: u64,
    pid: u32,

    // Held for the lifetime of the mount; dropped on teardown.
    _lock: binding::LockGuard,
    _crash_sentinel: binding::CrashSentinel,
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

impl MountState {
    /// Bring up a mount: cache directory, sentinels, cache layers, catalog
    /// tree. This is the only construction site; teardown is the drop.
    pub fn create(
        settings: Settings,
        downloader: Arc<dyn Downloader>,
        verifier: Arc<dyn SignatureVerifier>,
        quota: Arc<dyn QuotaManager>,
    ) -> Result<MountState> {
        let upper_dir = settings.upper_cache_dir();
        std::fs::create_dir_all(&upper_dir)?;
        binding::ensure_cache_marker(&upper_dir)?;
        let lock = binding::acquire_lock(&upper_dir, &settings.fqrn)?;
        let (crash_sentinel, rebuild) = binding::CrashSentinel::engage(&upper_dir, &settings.fqrn)?;
        binding::check_nfs_maps_marker(&upper_dir, &settings.fqrn, settings.nfs_source)?;

        let upper_cache = Arc::new(PosixCacheManager::new(
            &upper_dir,
            Arc::clone(&quota),
            false,
            rebuild,
        )?);
        let cache: Arc<dyn crate::cache::CacheManager> = match settings.lower_cache_dir() {
            Some(lower_dir) => {
                std::fs::create_dir_all(&lower_dir)?;
                let lower = Arc::new(PosixCacheManager::new(
                    &lower_dir,
                    Arc::new(crate::cache::UnmanagedQuota),
                    false,
                    false,
                )?);
                Arc::new(TieredCacheManager::new(
                    Arc::clone(&upper_cache) as Arc<dyn crate::cache::CacheManager>,
                    lower,
                ))
            }
            None => Arc::clone(&upper_cache) as Arc<dyn crate::cache::CacheManager>,
        };
        let fetcher = Arc::new(ObjectFetcher::new(
            cache,
            Arc::clone(&upper_cache),
            downloader,
            verifier,
            &settings.fqrn,
        ));

        let annotation = Arc::new(InodeGenerationAnnotation::default());
        let mut catalog_mgr = CatalogManager::new(
            &settings.fqrn,
            Arc::clone(&fetcher) as Arc<dyn crate::catalog::CatalogSource>,
        );
        catalog_mgr.set_inode_annotation(
            Arc::clone(&annotation) as Arc<dyn InodeAnnotation>,
            !settings.nfs_source,
        );
        catalog_mgr.set_owner_maps(settings.uid_map.clone(), settings.gid_map.clone());

        match settings.root_hash.as_deref() {
            Some(raw) => {
                let pinned = ContentHash::from_hex(raw)
                    .ok_or_else(|| Error::Config(format!("CVMFS_ROOT_HASH: {raw}")))?;
                catalog_mgr.init_fixed(pinned)?;
            }
            None => catalog_mgr.init()?,
        }

        // Size the meta caches from the memory budget; the path-hash cache
        // gets seven units for every one of the other two.
        let unit_size = 7 * Md5PathCache::entry_size()
            + InodeCache::entry_size()
            + PathCache::entry_size();
        let num_units = (settings.mem_cache_size / unit_size as u64) as usize;

        let inode_generation = InodeGenerationInfo {
            initial_revision: catalog_mgr.get_revision(),
            ..Default::default()
        };

        let state = MountState {
            fence: RemountFence::new(),
            inode_cache: InodeCache::new(num_units),
            path_cache: PathCache::new(num_units),
            md5path_cache: Md5PathCache::new(num_units * 7),
            inode_tracker: RwLock::new(Arc::new(InodeTracker::new())),
            chunked: ChunkedReader::new(Arc::clone(&fetcher)),
            dir_handles: DashMap::new(),
            next_dir_handle: AtomicU64::new(1),
            open_plain_files: DashMap::new(),
            next_plain_fd: AtomicU64::new(1),
            open_files: AtomicI32::new(0),
            open_dirs: AtomicI32::new(0),
            max_open_files: max_open_files(),
            counters: FsCounters::default(),
            backoff: ops::IoBackoff::default(),
            annotation,
            inode_generation: Mutex::new(inode_generation),
            remount: RemountFlags::default(),
            boot_time: now_secs() as u64,
            pid: std::process::id(),
            catalog_mgr,
            fetcher,
            upper_cache,
            quota,
            settings,
            _lock: lock,
            _crash_sentinel: crash_sentinel,
        };

        let initial_ttl = if state.settings.fixed_catalog() {
            state
                .remount
                .catalogs_valid_until
                .store(DEADLINE_INDEFINITE, Ordering::Relaxed);
            None
        } else {
            let ttl = if state.catalog_mgr.offline_mode() {
                SHORT_TERM_TTL
            } else {
                state.effective_ttl()
            };
            state
                .remount
                .catalogs_valid_until
                .store(now_secs() + ttl as i64, Ordering::Relaxed);
            Some(ttl)
        };
        info!(
            fqrn = %state.settings.fqrn,
            revision = state.catalog_mgr.get_revision(),
            root_inode = state.catalog_mgr.get_root_inode(),
            ttl = ?initial_ttl,
            "mount state initialized"
        );
        Ok(state)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn fetcher(&self) -> &Arc<ObjectFetcher> {
        &self.fetcher
    }

    pub fn upper_cache(&self) -> &Arc<PosixCacheManager> {
        &self.upper_cache
    }

    pub fn quota(&self) -> &Arc<dyn QuotaManager> {
        &self.quota
    }

    pub fn tracker(&self) -> Arc<InodeTracker> {
        Arc::clone(&self.inode_tracker.read())
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn boot_time(&self) -> u64 {
        self.boot_time
    }

    pub fn max_usable_fds(&self) -> i32 {
        self.max_open_files - NUM_RESERVED_FD
    }

    /// Override the file-descriptor budget (supervisors running with tight
    /// rlimits size this down).
    pub fn set_max_open_files(&mut self, max: i32) {
        self.max_open_files = max;
    }

    pub fn num_open_files(&self) -> i32 {
        self.open_files.load(Ordering::Relaxed)
    }

    pub fn num_open_dirs(&self) -> i32 {
        self.open_dirs.load(Ordering::Relaxed)
    }

    /// Kernel cache lifetime for entries and attributes; zero while the
    /// metadata caches drain or in maintenance mode, so stale kernel entries
    /// die before the swap.
    pub fn kcache_timeout(&self) -> f64 {
        if self.remount.drainout_mode.load(Ordering::Relaxed)
            || self.remount.maintenance_mode.load(Ordering::Relaxed)
        {
            return 0.0;
        }
        self.settings.kcache_timeout
    }

    /// Catalog TTL clamped by `CVMFS_MAX_TTL`.
    pub fn effective_ttl(&self) -> u64 {
        let catalog_ttl = self.catalog_mgr.get_ttl();
        let max_ttl = self.settings.max_ttl;
        if max_ttl > 0 {
            std::cmp::min(max_ttl, catalog_ttl)
        } else {
            catalog_ttl
        }
    }

    pub fn catalogs_valid_until(&self) -> i64 {
        self.remount.catalogs_valid_until.load(Ordering::Relaxed)
    }

    /// Supervisor hook: fire the TTL alarm when due. Returns the remaining
    /// seconds until the next check.
    pub fn tick(&self) -> i64 {
        let valid_until = self.catalogs_valid_until();
        if valid_until == DEADLINE_INDEFINITE {
            return i64::MAX;
        }
        let remaining = valid_until - now_secs();
        if remaining <= 0 {
            self.mark_catalogs_expired();
            SHORT_TERM_TTL as i64
        } else {
            remaining
        }
    }

    /// TTL alarm: the next filesystem call checks for a new revision.
    pub fn mark_catalogs_expired(&self) {
        self.remount.catalogs_expired.store(true, Ordering::Release);
    }

    fn rearm_ttl(&self, seconds: u64) {
        self.remount
            .catalogs_valid_until
            .store(now_secs() + seconds as i64, Ordering::Relaxed);
    }

    /// Runs at the beginning of metadata operations: finishes a drainout
    /// whose deadline passed and starts a reload when the TTL fired.
    pub fn remount_check(&self) {
        if self.remount.maintenance_mode.load(Ordering::Relaxed) {
            return;
        }
        self.remount_finish();

        if self
            .remount
            .catalogs_expired
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            debug!("catalog TTL expired, reload");
            match self.remount_start() {
                LoadOutcome::Fail | LoadOutcome::NoSpace => {
                    debug!("reload failed, applying short term TTL");
                    self.rearm_ttl(SHORT_TERM_TTL);
                }
                LoadOutcome::Up2Date => {
                    self.rearm_ttl(self.effective_ttl());
                }
                LoadOutcome::New => {
                    // Swap happens after the drainout deadline.
                }
            }
        }
    }

    /// Phase one: if a new revision is published, enter drainout mode. The
    /// caches stop admitting entries and the kernel cache timeout drops to
    /// zero; the swap happens once everything cached before has expired.
    pub fn remount_start(&self) -> LoadOutcome {
        let outcome = self.catalog_mgr.remount(true);
        if outcome == LoadOutcome::New {
            debug!("new catalog revision available, draining out meta-data caches");
            let safety_margin = std::cmp::max(1, RELOAD_SAFETY_MARGIN_MS / 1000);
            let deadline =
                now_secs() + self.settings.kcache_timeout as i64 + safety_margin as i64;
            self.remount
                .drainout_deadline
                .store(deadline, Ordering::Relaxed);
            self.remount.drainout_mode.store(true, Ordering::Release);
        }
        outcome
    }

    /// Phase two: after the drainout deadline, drop the meta caches, block
    /// the fence and swap the catalog forest.
    pub fn remount_finish(&self) {
        if self
            .remount
            .reload_critical_section
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        if !self.remount.drainout_mode.load(Ordering::Acquire) {
            self.remount
                .reload_critical_section
                .store(false, Ordering::Release);
            return;
        }

        if now_secs() > self.remount.drainout_deadline.load(Ordering::Relaxed) {
            debug!("caches drained out, applying new catalog");
            self.inode_cache.pause();
            self.path_cache.pause();
            self.md5path_cache.pause();
            self.inode_cache.drop_all();
            self.path_cache.drop_all();
            self.md5path_cache.drop_all();

            // All callbacks must have left the catalog query code.
            self.fence.block();
            let outcome = self.catalog_mgr.remount(false);
            self.inode_generation.lock().inode_generation = self.annotation.generation();
            self.fence.unblock();

            self.inode_cache.resume();
            self.path_cache.resume();
            self.md5path_cache.resume();

            self.remount.drainout_mode.store(false, Ordering::Release);
            if matches!(outcome, LoadOutcome::Fail | LoadOutcome::NoSpace)
                || self.catalog_mgr.offline_mode()
            {
                warn!("reload failed, applying short term TTL");
                self.rearm_ttl(SHORT_TERM_TTL);
            } else {
                info!(
                    revision = self.catalog_mgr.get_revision(),
                    "switched to new catalog revision"
                );
                self.rearm_ttl(self.effective_ttl());
            }
        }

        self.remount
            .reload_critical_section
            .store(false, Ordering::Release);
    }

    /// Stop reloading; used while saving state for a hot swap.
    pub fn enter_maintenance_mode(&self) {
        self.remount.maintenance_mode.store(true, Ordering::Release);
    }

    pub fn in_maintenance_mode(&self) -> bool {
        self.remount.maintenance_mode.load(Ordering::Relaxed)
    }

    pub fn in_drainout_mode(&self) -> bool {
        self.remount.drainout_mode.load(Ordering::Relaxed)
    }

    /// Collect the state a new incarnation needs to take over live kernel
    /// references.
    pub fn save_state(&self) -> Vec<SavedState> {
        let mut saved = Vec::new();

        let open_dirs: Vec<(u64, DirectoryListing)> = self
            .dir_handles
            .iter()
            .map(|item| (*item.key(), item.value().clone()))
            .collect();
        if !open_dirs.is_empty() {
            saved.push(SavedState::OpenDirs(open_dirs));
        }

        if !self.settings.nfs_source {
            saved.push(SavedState::InodeTrackerV3(self.tracker().snapshot()));
        }

        saved.push(SavedState::OpenFiles(self.chunked.save_state()));

        let mut generation = *self.inode_generation.lock();
        generation.inode_generation += self.catalog_mgr.inode_gauge();
        saved.push(SavedState::InodeGeneration(generation));

        saved.push(SavedState::OpenFilesCounter(
            self.open_files.load(Ordering::Relaxed) as u32,
        ));
        saved
    }

    /// Restore a previous incarnation's state. Legacy tracker snapshots are
    /// migrated; the inode generation is advanced so new inodes cannot
    /// collide with ones the kernel still holds.
    pub fn restore_state(&self, saved: Vec<SavedState>) {
        for item in saved {
            match item {
                SavedState::OpenDirs(handles) => {
                    let mut max_handle = 0;
                    for (handle, listing) in handles {
                        max_handle = std::cmp::max(max_handle, handle);
                        self.dir_handles.insert(handle, listing);
                    }
                    self.open_dirs
                        .store(self.dir_handles.len() as i32, Ordering::Relaxed);
                    self.next_dir_handle
                        .store(max_handle + 1, Ordering::Relaxed);
                    info!(handles = self.dir_handles.len(), "restored open directory handles");
                }
                SavedState::InodeTrackerV3(tracker) => {
                    *self.inode_tracker.write() = Arc::new(tracker);
                    info!("restored inode tracker");
                }
                SavedState::InodeTrackerV1(legacy) | SavedState::InodeTrackerV2(legacy) => {
                    let migrated = legacy.migrate(&self.tracker());
                    info!(migrated, "migrated legacy inode tracker snapshot");
                }
                SavedState::OpenFiles(tables) => {
                    self.chunked.restore_state(tables);
                    info!("restored chunk tables");
                }
                SavedState::InodeGeneration(old) => {
                    let mut generation = self.inode_generation.lock();
                    if old.version == 1 {
                        generation.initial_revision = old.initial_revision;
                        generation.incarnation = old.incarnation;
                    } else {
                        *generation = old;
                    }
                    generation.incarnation += 1;
                    info!(incarnation = generation.incarnation, "restored inode generation");
                }
                SavedState::OpenFilesCounter(count) => {
                    self.open_files.store(count as i32, Ordering::Relaxed);
                }
            }
        }

        let saved_generation = self.inode_generation.lock().inode_generation;
        if saved_generation > 0 {
            self.annotation.inc_generation(saved_generation);
        }
    }

    pub fn inode_generation_info(&self) -> InodeGenerationInfo {
        *self.inode_generation.lock()
    }

    /// One-line counter dump, matching the `stat` subcommand output.
    pub fn fs_stats(&self) -> String {
        format!(
            "lookup(all): {}  lookup(negative): {}  stat(): {}  open(): {}  diropen(): {}  read(): {}  readlink(): {}  forget(): {}\n",
            self.counters.num_lookup.load(Ordering::Relaxed),
            self.counters.num_lookup_negative.load(Ordering::Relaxed),
            self.counters.num_stat.load(Ordering::Relaxed),
            self.counters.num_open.load(Ordering::Relaxed),
            self.counters.num_dir_open.load(Ordering::Relaxed),
            self.counters.num_read.load(Ordering::Relaxed),
            self.counters.num_readlink.load(Ordering::Relaxed),
            self.counters.num_forget.load(Ordering::Relaxed),
        )
    }
}

/// Soft process limit on file descriptors.
fn max_open_files() -> i32 {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) };
    if rc != 0 || limit.rlim_cur == libc::RLIM_INFINITY {
        return 1024 * 1024;
    }
    std::cmp::min(limit.rlim_cur, 1 << 20) as i32
}
