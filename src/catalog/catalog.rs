//! One attached catalog: a database handle plus its place in the mount tree.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Weak};

use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use super::database::{CatalogDb, CatalogRow, Counters};
use super::entry::DirectoryEntry;
use super::manager::InodeAnnotation;
use super::{CatalogResult, FileChunk, StatEntry};
use crate::config::OwnerMap;
use crate::hash::{ContentHash, PathHash};

pub const DEFAULT_TTL: u64 = 3600;
pub const INVALID_INODE: u64 = 0;

/// Half-open inode block `(offset, offset + size]` assigned at attach time;
/// row N maps to inode `offset + N`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InodeRange {
    pub offset: u64,
    pub size: u64,
}

impl InodeRange {
    /// Marker range for catalogs opened outside a manager (diagnostics);
    /// no inode mangling happens in that mode.
    pub fn dummy() -> Self {
        Self { offset: 0, size: 0 }
    }

    pub fn is_dummy(&self) -> bool {
        self.size == 0
    }

    pub fn contains(&self, inode: u64) -> bool {
        inode > self.offset && inode <= self.offset + self.size
    }
}

/// Reference to a nested catalog as registered in its parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NestedRef {
    pub mountpoint: String,
    pub hash: ContentHash,
}

#[derive(Default)]
struct CatalogState {
    /// First inode observed per hardlink group pins the whole group.
    hardlink_groups: std::collections::HashMap<u64, u64>,
    children: BTreeMap<String, Arc<Catalog>>,
    /// Memoized nested-catalog list; catalogs are read-only so it never changes.
    nested_cache: Option<Arc<Vec<NestedRef>>>,
}

#[derive(Default)]
struct OwnerMaps {
    uid: Option<OwnerMap>,
    gid: Option<OwnerMap>,
}

pub struct Catalog {
    root_path: String,
    hash: ContentHash,
    has_parent: bool,
    parent: Weak<Catalog>,
    db: OnceCell<CatalogDb>,
    inode_range: RwLock<InodeRange>,
    annotation: OnceCell<Arc<dyn InodeAnnotation>>,
    owner_maps: RwLock<OwnerMaps>,
    state: Mutex<CatalogState>,
    initialized: std::sync::atomic::AtomicBool,
}

impl Catalog {
    /// An uninitialized catalog; becomes usable after [`Catalog::open_database`].
    pub fn new(root_path: &str, hash: ContentHash, parent: Weak<Catalog>) -> Self {
        Self {
            root_path: root_path.to_string(),
            hash,
            has_parent: parent.strong_count() > 0,
            parent,
            db: OnceCell::new(),
            inode_range: RwLock::new(InodeRange::default()),
            annotation: OnceCell::new(),
            owner_maps: RwLock::new(OwnerMaps::default()),
            state: Mutex::new(CatalogState::default()),
            initialized: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Open the database file and read its invariants. Leaves no state behind
    /// on failure. The catalog becomes visible to readers only with
    /// [`Catalog::attach_to_parent`], after the manager assigned its inode
    /// range.
    pub fn open_database(self: &Arc<Self>, file_path: &Path) -> CatalogResult<()> {
        let db = CatalogDb::open(file_path)?;
        if self.is_root() {
            if let Some(prefix) = db.property("root_prefix")? {
                debug!(root_prefix = %prefix, "found root prefix in root catalog");
            }
        }
        self.db
            .set(db)
            .map_err(|_| super::CatalogError::Load("catalog opened twice".into()))?;
        self.initialized
            .store(true, std::sync::atomic::Ordering::Release);
        Ok(())
    }

    /// Register with the parent catalog, making this catalog reachable.
    pub fn attach_to_parent(self: &Arc<Self>) {
        if let Some(parent) = self.parent.upgrade() {
            parent.add_child(Arc::clone(self));
        }
    }

    /// Open a catalog outside the framework of a catalog manager. Inodes stay
    /// unmangled; used for diagnostics (`inspect`).
    pub fn init_standalone(self: &Arc<Self>, file_path: &Path) -> CatalogResult<()> {
        *self.inode_range.write() = InodeRange::dummy();
        self.open_database(file_path)
    }

    fn db(&self) -> CatalogResult<&CatalogDb> {
        self.db
            .get()
            .ok_or_else(|| super::CatalogError::Load("catalog not initialized".into()))
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(std::sync::atomic::Ordering::Acquire)
    }

    pub fn is_root(&self) -> bool {
        !self.has_parent
    }

    pub fn root_path(&self) -> &str {
        &self.root_path
    }

    pub fn hash(&self) -> &ContentHash {
        &self.hash
    }

    pub fn parent(&self) -> Option<Arc<Catalog>> {
        self.parent.upgrade()
    }

    pub fn inode_range(&self) -> InodeRange {
        *self.inode_range.read()
    }

    pub fn set_inode_range(&self, range: InodeRange) {
        *self.inode_range.write() = range;
    }

    pub fn max_rowid(&self) -> u64 {
        self.db.get().map(|db| db.max_rowid()).unwrap_or(0)
    }

    pub fn counters(&self) -> Counters {
        self.db.get().map(|db| db.counters()).unwrap_or_default()
    }

    pub fn schema_version(&self) -> f64 {
        self.db.get().map(|db| db.schema_version()).unwrap_or(0.0)
    }

    /// Annotations cannot be exchanged once set: annotated inodes come back
    /// to the catalog for stripping.
    pub fn set_inode_annotation(&self, annotation: Arc<dyn InodeAnnotation>) {
        if let Err(rejected) = self.annotation.set(Arc::clone(&annotation)) {
            let current = self.annotation.get().expect("annotation set");
            assert!(
                Arc::ptr_eq(current, &rejected),
                "inode annotation exchanged on live catalog"
            );
        }
    }

    /// Empty maps are treated as absent.
    pub fn set_owner_maps(&self, uid_map: Option<&OwnerMap>, gid_map: Option<&OwnerMap>) {
        let mut maps = self.owner_maps.write();
        maps.uid = uid_map.filter(|m| !m.is_empty()).cloned();
        maps.gid = gid_map.filter(|m| !m.is_empty()).cloned();
    }

    /// Determine the inode of a row. The first used entry of a hardlink group
    /// determines the inode of the whole group.
    pub fn mangle_inode(&self, row_id: u64, hardlink_group: u64) -> u64 {
        let range = self.inode_range();
        if range.is_dummy() {
            return INVALID_INODE;
        }

        let mut inode = row_id + range.offset;
        if hardlink_group > 0 {
            let mut state = self.state.lock();
            inode = *state.hardlink_groups.entry(hardlink_group).or_insert(inode);
        }
        if let Some(annotation) = self.annotation.get() {
            inode = annotation.annotate(inode);
        }
        inode
    }

    /// Revert the inode mangling; required to look up by inode.
    pub fn row_id_from_inode(&self, inode: u64) -> u64 {
        let mut stripped = inode;
        if let Some(annotation) = self.annotation.get() {
            stripped = annotation.strip(stripped);
        }
        stripped.wrapping_sub(self.inode_range().offset)
    }

    fn entry_from_row(&self, row: CatalogRow) -> DirectoryEntry {
        let inode = self.mangle_inode(row.row_id, row.hardlink_group);
        let mut entry = DirectoryEntry {
            inode,
            parent_hash: row.parent_hash,
            name: row.name,
            flags: row.flags,
            mode: row.mode,
            uid: row.uid,
            gid: row.gid,
            size: row.size,
            mtime: row.mtime,
            symlink: row.symlink,
            checksum: row.checksum.unwrap_or_default(),
            hardlink_group: row.hardlink_group,
            linkcount: row.linkcount,
            ..Default::default()
        };
        let maps = self.owner_maps.read();
        if let Some(map) = maps.uid.as_ref() {
            if let Some(mapped) = map.get(&entry.uid) {
                entry.uid = *mapped;
            }
        }
        if let Some(map) = maps.gid.as_ref() {
            if let Some(mapped) = map.get(&entry.gid) {
                entry.gid = *mapped;
            }
        }
        entry
    }

    /// At the transition point of a nested catalog the inode is ambiguous; it
    /// has to be the parent's inode because nested catalogs load lazily.
    fn fix_transition_point(
        &self,
        path_hash: &PathHash,
        entry: &mut DirectoryEntry,
    ) -> CatalogResult<()> {
        if entry.is_nested_root() && !self.is_root() {
            if let Some(parent) = self.parent.upgrade() {
                if let Some(parent_entry) = parent.lookup_path(path_hash)? {
                    entry.inode = parent_entry.inode;
                }
            }
        }
        Ok(())
    }

    pub fn lookup_path(&self, path_hash: &PathHash) -> CatalogResult<Option<DirectoryEntry>> {
        let Some(row) = self.db()?.lookup_by_pathhash(path_hash)? else {
            return Ok(None);
        };
        let mut entry = self.entry_from_row(row);
        self.fix_transition_point(path_hash, &mut entry)?;
        Ok(Some(entry))
    }

    /// Look up by inode; also yields the path hash of the parent directory.
    pub fn lookup_inode(&self, inode: u64) -> CatalogResult<Option<(DirectoryEntry, PathHash)>> {
        let row_id = self.row_id_from_inode(inode);
        let Some(row) = self.db()?.lookup_by_rowid(row_id)? else {
            return Ok(None);
        };
        let parent_hash = row.parent_hash;
        Ok(Some((self.entry_from_row(row), parent_hash)))
    }

    /// List the directory with the given path hash. A listing never yields a
    /// nested-catalog root row (the row above this catalog's root is not in
    /// its table), so no transition fix is needed here.
    pub fn list(&self, path_hash: &PathHash) -> CatalogResult<Vec<DirectoryEntry>> {
        let rows = self.db()?.list_children(path_hash)?;
        Ok(rows
            .into_iter()
            .map(|row| self.entry_from_row(row))
            .collect())
    }

    pub fn list_stat(&self, path_hash: &PathHash) -> CatalogResult<Vec<StatEntry>> {
        let entries = self.list(path_hash)?;
        Ok(entries
            .into_iter()
            .map(|entry| StatEntry {
                name: entry.name.clone(),
                info: entry.stat_info(),
            })
            .collect())
    }

    pub fn list_chunks(&self, path_hash: &PathHash) -> CatalogResult<Vec<FileChunk>> {
        self.db()?.list_chunks(path_hash)
    }

    pub fn list_nested(&self) -> CatalogResult<Arc<Vec<NestedRef>>> {
        {
            let state = self.state.lock();
            if let Some(cached) = state.nested_cache.as_ref() {
                return Ok(Arc::clone(cached));
            }
        }
        let listed = self.db()?.list_nested()?;
        let refs: Vec<NestedRef> = listed
            .into_iter()
            .map(|(mountpoint, hash)| NestedRef { mountpoint, hash })
            .collect();
        let refs = Arc::new(refs);
        let mut state = self.state.lock();
        Ok(Arc::clone(
            state.nested_cache.get_or_insert_with(|| Arc::clone(&refs)),
        ))
    }

    pub fn find_nested(&self, mountpoint: &str) -> CatalogResult<Option<ContentHash>> {
        self.db()?.find_nested(mountpoint)
    }

    pub fn ttl(&self) -> u64 {
        self.db()
            .ok()
            .and_then(|db| db.property("TTL").ok().flatten())
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(DEFAULT_TTL)
    }

    pub fn revision(&self) -> u64 {
        self.db()
            .ok()
            .and_then(|db| db.property("revision").ok().flatten())
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0)
    }

    pub fn previous_revision(&self) -> Option<ContentHash> {
        self.db()
            .ok()
            .and_then(|db| db.property("previous_revision").ok().flatten())
            .and_then(|raw| ContentHash::from_hex(&raw))
    }

    pub fn num_entries(&self) -> u64 {
        self.db().ok().and_then(|db| db.num_entries().ok()).unwrap_or(0)
    }

    pub fn add_child(&self, child: Arc<Catalog>) {
        let mut state = self.state.lock();
        let previous = state
            .children
            .insert(child.root_path.clone(), Arc::clone(&child));
        debug_assert!(previous.is_none(), "child catalog attached twice");
    }

    pub fn remove_child(&self, mountpoint: &str) -> Option<Arc<Catalog>> {
        self.state.lock().children.remove(mountpoint)
    }

    pub fn find_child(&self, mountpoint: &str) -> Option<Arc<Catalog>> {
        self.state.lock().children.get(mountpoint).cloned()
    }

    pub fn get_children(&self) -> Vec<Arc<Catalog>> {
        self.state.lock().children.values().cloned().collect()
    }

    /// Find the immediate child serving `path`: extend the prefix one
    /// "/"-delimited segment at a time and return the first child whose root
    /// equals the accumulated prefix. The path may in fact be served by a
    /// grandchild; the caller recurses.
    pub fn find_subtree(&self, path: &str) -> Option<Arc<Catalog>> {
        if !path_in_subtree(&self.root_path, path) {
            return None;
        }
        let remaining = &path[self.root_path.len()..];
        let mut prefix = self.root_path.clone();
        for segment in remaining.split('/').filter(|s| !s.is_empty()) {
            prefix.push('/');
            prefix.push_str(segment);
            if let Some(child) = self.find_child(&prefix) {
                return Some(child);
            }
        }
        None
    }
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog")
            .field("root_path", &self.root_path)
            .field("hash", &self.hash.to_hex())
            .field("inode_range", &self.inode_range())
            .finish()
    }
}

/// Component-boundary prefix test: "" owns everything, "/a" owns "/a" and
/// "/a/...", but not "/ab".
pub fn path_in_subtree(root: &str, path: &str) -> bool {
    if root.is_empty() {
        return true;
    }
    path == root || (path.starts_with(root) && path.as_bytes().get(root.len()) == Some(&b'/'))
}
