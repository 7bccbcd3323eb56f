//! The tree of attached catalogs.
//!
//! The manager owns the root and every nested catalog that was attached so
//! far, resolves paths across nested boundaries (fetching and attaching
//! nested catalogs lazily), assigns process-wide unique inode ranges and
//! orchestrates the two-phase remount.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::catalog::{Catalog, InodeRange};
use super::entry::DirectoryEntry;
use super::{CatalogError, CatalogResult, FileChunk, LoadOutcome, StatEntry};
use crate::cache::CacheError;
use crate::config::OwnerMap;
use crate::hash::{parent_path, ContentHash, PathHash};
use crate::manifest::Manifest;

/// Inodes below this offset are reserved; the kernel's root inode (1) is
/// translated to the mounted root catalog's inode.
pub const ROOT_INODE_OFFSET: u64 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupMode {
    /// Resolve only the named entry.
    Sole,
    /// Additionally resolve the parent entry (consistency checking callers).
    Full,
}

/// Maps catalog-assigned inodes into the process-wide inode space and back.
/// `annotate` and `strip` are inverses for any fixed generation.
pub trait InodeAnnotation: Send + Sync {
    fn annotate(&self, inode: u64) -> u64;
    fn strip(&self, inode: u64) -> u64;
    fn generation(&self) -> u64;
    fn inc_generation(&self, by: u64);
}

/// Generation-counter annotation: each catalog swap advances the generation
/// by the number of inodes handed out, so inodes the kernel still references
/// can never be re-issued within one process lifetime.
#[derive(Debug, Default)]
pub struct InodeGenerationAnnotation {
    generation: AtomicU64,
}

impl InodeAnnotation for InodeGenerationAnnotation {
    fn annotate(&self, inode: u64) -> u64 {
        inode + self.generation.load(Ordering::Relaxed)
    }

    fn strip(&self, inode: u64) -> u64 {
        inode.saturating_sub(self.generation.load(Ordering::Relaxed))
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }

    fn inc_generation(&self, by: u64) {
        self.generation.fetch_add(by, Ordering::Relaxed);
    }
}

/// Where catalog files and manifests come from. The production implementation
/// downloads by content hash through the tiered cache.
pub trait CatalogSource: Send + Sync {
    /// Make the catalog object available locally, returning its file path.
    fn fetch_catalog(&self, hash: &ContentHash) -> crate::Result<PathBuf>;
    fn fetch_manifest(&self) -> crate::Result<Manifest>;
}

#[derive(Debug, Default)]
pub struct ManagerStatistics {
    pub num_lookups: AtomicU64,
    pub num_listings: AtomicU64,
    pub num_nested_attached: AtomicU64,
    pub num_detached: AtomicU64,
}

struct ManagerInner {
    root: Option<Arc<Catalog>>,
    /// Allocator cursor; never reused within one incarnation.
    inode_gauge: u64,
    revision: u64,
    num_catalogs: usize,
    loaded_inodes: u64,
}

pub struct CatalogManager {
    fqrn: String,
    source: Arc<dyn CatalogSource>,
    annotation: Arc<dyn InodeAnnotation>,
    /// NFS-mode mounts carry stable inodes externally and run unannotated.
    annotation_enabled: bool,
    uid_map: OwnerMap,
    gid_map: OwnerMap,
    inner: RwLock<ManagerInner>,
    /// Serializes attach/detach; lookups run concurrently against the tree.
    attach_lock: Mutex<()>,
    statistics: ManagerStatistics,
    offline: AtomicBool,
    pending_manifest: Mutex<Option<Manifest>>,
}

impl CatalogManager {
    pub fn new(fqrn: &str, source: Arc<dyn CatalogSource>) -> Self {
        Self {
            fqrn: fqrn.to_string(),
            source,
            annotation: Arc::new(InodeGenerationAnnotation::default()),
            annotation_enabled: true,
            uid_map: OwnerMap::new(),
            gid_map: OwnerMap::new(),
            inner: RwLock::new(ManagerInner {
                root: None,
                inode_gauge: ROOT_INODE_OFFSET,
                revision: 0,
                num_catalogs: 0,
                loaded_inodes: 0,
            }),
            attach_lock: Mutex::new(()),
            statistics: ManagerStatistics::default(),
            offline: AtomicBool::new(false),
            pending_manifest: Mutex::new(None),
        }
    }

    /// Must be called before `init`; inodes are handed to the kernel as soon
    /// as the root catalog is attached.
    pub fn set_inode_annotation(&mut self, annotation: Arc<dyn InodeAnnotation>, enabled: bool) {
        self.annotation = annotation;
        self.annotation_enabled = enabled;
    }

    pub fn set_owner_maps(&mut self, uid_map: OwnerMap, gid_map: OwnerMap) {
        self.uid_map = uid_map;
        self.gid_map = gid_map;
    }

    pub fn fqrn(&self) -> &str {
        &self.fqrn
    }

    pub fn statistics(&self) -> &ManagerStatistics {
        &self.statistics
    }

    /// Load the newest published root catalog.
    pub fn init(&self) -> crate::Result<()> {
        let manifest = self.source.fetch_manifest()?;
        self.load_root(&manifest.root_catalog)?;
        Ok(())
    }

    /// Mount a pinned root catalog; no reloads will ever happen.
    pub fn init_fixed(&self, root_hash: ContentHash) -> crate::Result<()> {
        self.load_root(&root_hash)?;
        Ok(())
    }

    fn load_root(&self, root_hash: &ContentHash) -> CatalogResult<()> {
        let file = self
            .source
            .fetch_catalog(root_hash)
            .map_err(|err| CatalogError::Load(err.to_string()))?;

        let catalog = Arc::new(Catalog::new("", *root_hash, std::sync::Weak::new()));
        catalog.open_database(&file)?;

        let _guard = self.attach_lock.lock();
        let mut inner = self.inner.write();
        debug_assert!(inner.root.is_none(), "root catalog attached twice");
        self.assign_inode_range(&mut inner, &catalog);
        inner.revision = catalog.revision();
        inner.root = Some(Arc::clone(&catalog));
        info!(
            root_hash = %root_hash,
            revision = inner.revision,
            "mounted root catalog"
        );
        Ok(())
    }

    fn assign_inode_range(&self, inner: &mut ManagerInner, catalog: &Arc<Catalog>) {
        let size = catalog.max_rowid();
        catalog.set_inode_range(InodeRange {
            offset: inner.inode_gauge,
            size,
        });
        inner.inode_gauge += size;
        inner.num_catalogs += 1;
        inner.loaded_inodes += size;
        if self.annotation_enabled {
            catalog.set_inode_annotation(Arc::clone(&self.annotation));
        }
        catalog.set_owner_maps(Some(&self.uid_map), Some(&self.gid_map));
    }

    fn root(&self) -> CatalogResult<Arc<Catalog>> {
        self.inner
            .read()
            .root
            .clone()
            .ok_or_else(|| CatalogError::Load("no root catalog mounted".into()))
    }

    /// Deepest attached catalog owning `path`.
    fn find_owning_catalog(&self, path: &str) -> CatalogResult<Arc<Catalog>> {
        let mut current = self.root()?;
        while let Some(child) = current.find_subtree(path) {
            current = child;
        }
        Ok(current)
    }

    /// Attach the shallowest nested catalog registered between
    /// `catalog.root_path` and `path` (inclusive), if any. Returns true when
    /// the attached forest changed (or a racing thread changed it for us).
    fn try_attach_nested_for(&self, catalog: &Arc<Catalog>, path: &str) -> CatalogResult<bool> {
        let remaining = &path[catalog.root_path().len()..];
        let mut prefix = catalog.root_path().to_string();
        for segment in remaining.split('/').filter(|s| !s.is_empty()) {
            prefix.push('/');
            prefix.push_str(segment);
            if catalog.find_child(&prefix).is_some() {
                return Ok(true);
            }
            if let Some(hash) = catalog.find_nested(&prefix)? {
                self.attach_nested(catalog, &prefix, &hash)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Idempotent under concurrent lookups: the mountpoint is re-checked
    /// under the attach lock.
    fn attach_nested(
        &self,
        parent: &Arc<Catalog>,
        mountpoint: &str,
        hash: &ContentHash,
    ) -> CatalogResult<()> {
        let _guard = self.attach_lock.lock();
        if parent.find_child(mountpoint).is_some() {
            return Ok(());
        }

        let file = self
            .source
            .fetch_catalog(hash)
            .map_err(|err| CatalogError::Load(err.to_string()))?;
        let catalog = Arc::new(Catalog::new(mountpoint, *hash, Arc::downgrade(parent)));
        catalog.open_database(&file)?;
        {
            let mut inner = self.inner.write();
            self.assign_inode_range(&mut inner, &catalog);
        }
        catalog.attach_to_parent();
        self.statistics
            .num_nested_attached
            .fetch_add(1, Ordering::Relaxed);
        debug!(mountpoint, hash = %hash, "attached nested catalog");
        Ok(())
    }

    /// Resolve the catalog that owns `path`, attaching nested catalogs on the
    /// way down until the forest covers the path.
    fn ensure_catalog_for(&self, path: &str) -> CatalogResult<Arc<Catalog>> {
        loop {
            let catalog = self.find_owning_catalog(path)?;
            if !self.try_attach_nested_for(&catalog, path)? {
                return Ok(catalog);
            }
        }
    }

    /// Path lookup across nested boundaries. Missing paths are `None`; only
    /// infrastructure failures (database, transfer) surface as errors.
    pub fn lookup_path(
        &self,
        path: &str,
        mode: LookupMode,
    ) -> CatalogResult<Option<DirectoryEntry>> {
        self.statistics.num_lookups.fetch_add(1, Ordering::Relaxed);
        let catalog = self.ensure_catalog_for(path)?;
        let hash = PathHash::of_path(path);
        let Some(entry) = catalog.lookup_path(&hash)? else {
            return Ok(None);
        };
        if mode == LookupMode::Full && !path.is_empty() {
            let parent = parent_path(path);
            if self.lookup_path(parent, LookupMode::Sole)?.is_none() {
                warn!(path, "entry found but parent is missing");
                return Ok(None);
            }
        }
        Ok(Some(entry))
    }

    /// Inode lookup; serves diagnostics and the standalone tools. The live
    /// filesystem resolves inodes through the tracker instead.
    pub fn lookup_inode(&self, inode: u64) -> CatalogResult<Option<DirectoryEntry>> {
        let stripped = if self.annotation_enabled {
            self.annotation.strip(inode)
        } else {
            inode
        };
        let Some(catalog) = self.find_catalog_by_inode(stripped)? else {
            return Ok(None);
        };
        Ok(catalog.lookup_inode(inode)?.map(|(entry, _)| entry))
    }

    fn find_catalog_by_inode(&self, stripped_inode: u64) -> CatalogResult<Option<Arc<Catalog>>> {
        let root = self.root()?;
        let mut stack = vec![root];
        while let Some(catalog) = stack.pop() {
            if catalog.inode_range().contains(stripped_inode) {
                return Ok(Some(catalog));
            }
            stack.extend(catalog.get_children());
        }
        Ok(None)
    }

    pub fn listing(&self, path: &str) -> CatalogResult<Vec<DirectoryEntry>> {
        self.statistics.num_listings.fetch_add(1, Ordering::Relaxed);
        let catalog = self.ensure_catalog_for(path)?;
        catalog.list(&PathHash::of_path(path))
    }

    pub fn listing_stat(&self, path: &str) -> CatalogResult<Vec<StatEntry>> {
        self.statistics.num_listings.fetch_add(1, Ordering::Relaxed);
        let catalog = self.ensure_catalog_for(path)?;
        catalog.list_stat(&PathHash::of_path(path))
    }

    pub fn list_chunks(&self, path: &str) -> CatalogResult<Vec<FileChunk>> {
        let catalog = self.ensure_catalog_for(path)?;
        catalog.list_chunks(&PathHash::of_path(path))
    }

    /// Inode of the mounted root directory.
    pub fn get_root_inode(&self) -> u64 {
        let base = ROOT_INODE_OFFSET + 1;
        if self.annotation_enabled {
            self.annotation.annotate(base)
        } else {
            base
        }
    }

    /// The kernel addresses the root as inode 1; anything below the reserved
    /// offset maps to the root catalog's own inode.
    pub fn mangle_inode(&self, inode: u64) -> u64 {
        if inode <= ROOT_INODE_OFFSET {
            self.get_root_inode()
        } else {
            inode
        }
    }

    pub fn get_revision(&self) -> u64 {
        self.inner.read().revision
    }

    pub fn get_root_hash(&self) -> Option<ContentHash> {
        self.inner.read().root.as_ref().map(|root| *root.hash())
    }

    pub fn get_ttl(&self) -> u64 {
        self.inner
            .read()
            .root
            .as_ref()
            .map(|root| root.ttl())
            .unwrap_or(super::catalog::DEFAULT_TTL)
    }

    pub fn num_catalogs(&self) -> usize {
        self.inner.read().num_catalogs
    }

    pub fn offline_mode(&self) -> bool {
        self.offline.load(Ordering::Relaxed)
    }

    /// Inodes allocated in this incarnation.
    pub fn inode_gauge(&self) -> u64 {
        self.inner.read().inode_gauge - ROOT_INODE_OFFSET
    }

    pub fn loaded_inodes(&self) -> u64 {
        self.inner.read().loaded_inodes
    }

    /// All entries the repository holds, attached or not.
    pub fn all_inodes(&self) -> u64 {
        self.inner
            .read()
            .root
            .as_ref()
            .map(|root| root.counters().all_entries())
            .unwrap_or(0)
    }

    /// Two-phase remount. The dry run only checks for a new revision; the
    /// real run swaps the attached forest and must be bracketed by the
    /// remount fence by the caller.
    pub fn remount(&self, dry_run: bool) -> LoadOutcome {
        if dry_run {
            return self.check_for_new_revision();
        }

        let manifest = match self.pending_manifest.lock().take() {
            Some(manifest) => manifest,
            None => match self.source.fetch_manifest() {
                Ok(manifest) => manifest,
                Err(err) => {
                    warn!(%err, "manifest fetch failed during remount");
                    self.offline.store(true, Ordering::Relaxed);
                    return LoadOutcome::Fail;
                }
            },
        };
        if Some(manifest.root_catalog) == self.get_root_hash() {
            return LoadOutcome::Up2Date;
        }

        // Fetch before swapping: a failed transfer leaves the old tree live.
        let file = match self.source.fetch_catalog(&manifest.root_catalog) {
            Ok(file) => file,
            Err(err) => {
                warn!(%err, "root catalog fetch failed during remount");
                return match err.downcast_ref::<CacheError>() {
                    Some(CacheError::NoSpace) => LoadOutcome::NoSpace,
                    _ => LoadOutcome::Fail,
                };
            }
        };

        let catalog = Arc::new(Catalog::new(
            "",
            manifest.root_catalog,
            std::sync::Weak::new(),
        ));
        if let Err(err) = catalog.open_database(&file) {
            warn!(%err, "new root catalog unusable");
            return LoadOutcome::Fail;
        }

        let _guard = self.attach_lock.lock();
        let mut inner = self.inner.write();
        if let Some(old_root) = inner.root.take() {
            let detached = detach_subtree(&old_root);
            self.statistics
                .num_detached
                .fetch_add(detached as u64, Ordering::Relaxed);
        }
        // New inodes must not collide with anything handed out before.
        if self.annotation_enabled {
            self.annotation
                .inc_generation(inner.inode_gauge - ROOT_INODE_OFFSET);
        }
        inner.inode_gauge = ROOT_INODE_OFFSET;
        inner.num_catalogs = 0;
        inner.loaded_inodes = 0;
        self.assign_inode_range(&mut inner, &catalog);
        inner.revision = catalog.revision();
        inner.root = Some(catalog);
        info!(revision = inner.revision, "switched to new catalog revision");
        LoadOutcome::New
    }

    fn check_for_new_revision(&self) -> LoadOutcome {
        match self.source.fetch_manifest() {
            Ok(manifest) => {
                self.offline.store(false, Ordering::Relaxed);
                if Some(manifest.root_catalog) == self.get_root_hash() {
                    LoadOutcome::Up2Date
                } else {
                    *self.pending_manifest.lock() = Some(manifest);
                    LoadOutcome::New
                }
            }
            Err(err) => {
                warn!(%err, "manifest fetch failed; staying on mounted revision");
                self.offline.store(true, Ordering::Relaxed);
                LoadOutcome::Fail
            }
        }
    }

    /// Indented textual dump of the attached forest.
    pub fn print_hierarchy(&self) -> String {
        fn walk(catalog: &Arc<Catalog>, depth: usize, out: &mut String) {
            let name = if catalog.root_path().is_empty() {
                "/"
            } else {
                catalog.root_path()
            };
            out.push_str(&format!(
                "{}{} (revision {}, {} entries)\n",
                "  ".repeat(depth),
                name,
                catalog.revision(),
                catalog.num_entries()
            ));
            for child in catalog.get_children() {
                walk(&child, depth + 1, out);
            }
        }
        let mut out = String::new();
        if let Ok(root) = self.root() {
            walk(&root, 0, &mut out);
        }
        out
    }
}

/// Deregister an entire subtree, children first. Returns the number of
/// catalogs detached.
fn detach_subtree(catalog: &Arc<Catalog>) -> usize {
    let mut detached = 1;
    for child in catalog.get_children() {
        detached += detach_subtree(&child);
        catalog.remove_child(child.root_path());
    }
    detached
}
