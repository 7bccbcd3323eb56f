//! Read-only access to a single catalog file.
//!
//! A catalog is an SQLite database with an entry table keyed by path hash, a
//! `properties` key/value table, the nested-catalog table, the chunk table
//! and statistics counters. All reads serialize on the connection lock; each
//! listing drains its cursor before the lock is released, so listings never
//! interleave with lookups on the statement level.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};

use super::entry::{flags, FileChunk};
use super::{CatalogError, CatalogResult};
use crate::hash::{ContentHash, PathHash};

/// Newest schema written by current server tools.
pub const LATEST_SCHEMA: f64 = 2.5;
/// Oldest schema this client still reads.
pub const OLDEST_SCHEMA: f64 = 2.0;
/// Tolerance when comparing floating-point schema revisions.
pub const SCHEMA_EPSILON: f64 = 0.001;

const SQL_LOOKUP_PATHHASH: &str = "SELECT rowid, parent_1, parent_2, hardlinks, size, mode, \
     mtime, flags, name, symlink, uid, gid, hash FROM catalog \
     WHERE md5path_1 = ?1 AND md5path_2 = ?2";
const SQL_LOOKUP_ROWID: &str = "SELECT rowid, parent_1, parent_2, hardlinks, size, mode, \
     mtime, flags, name, symlink, uid, gid, hash FROM catalog WHERE rowid = ?1";
const SQL_LISTING: &str = "SELECT rowid, parent_1, parent_2, hardlinks, size, mode, \
     mtime, flags, name, symlink, uid, gid, hash FROM catalog \
     WHERE parent_1 = ?1 AND parent_2 = ?2";
const SQL_LIST_NESTED: &str = "SELECT path, sha1 FROM nested_catalogs";
const SQL_FIND_NESTED: &str = "SELECT sha1 FROM nested_catalogs WHERE path = ?1";
const SQL_LIST_CHUNKS: &str = "SELECT offset, size, hash FROM chunks \
     WHERE md5path_1 = ?1 AND md5path_2 = ?2 ORDER BY offset ASC";
const SQL_PROPERTY: &str = "SELECT value FROM properties WHERE key = ?1";

/// Raw catalog row before inode assignment and owner mapping.
#[derive(Debug, Clone)]
pub struct CatalogRow {
    pub row_id: u64,
    pub parent_hash: PathHash,
    pub hardlink_group: u64,
    pub linkcount: u32,
    pub size: u64,
    pub mode: u32,
    pub mtime: i64,
    pub flags: u32,
    pub name: String,
    pub symlink: Option<String>,
    pub uid: u64,
    pub gid: u64,
    pub checksum: Option<ContentHash>,
}

/// Entry statistics read from the catalog's counter table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub regular: u64,
    pub symlink: u64,
    pub directory: u64,
    pub nested: u64,
    pub chunked: u64,
    /// Entries in all transitively nested catalogs, attached or not.
    pub subtree_entries: u64,
}

impl Counters {
    pub fn total_entries(&self) -> u64 {
        self.regular + self.symlink + self.directory
    }

    /// Entries of this catalog plus everything below it.
    pub fn all_entries(&self) -> u64 {
        self.total_entries() + self.subtree_entries
    }
}

pub struct CatalogDb {
    conn: Mutex<Connection>,
    schema: f64,
    max_rowid: u64,
    counters: Counters,
}

impl CatalogDb {
    /// Open and validate a catalog file. Nothing is kept on failure.
    pub fn open(path: &Path) -> CatalogResult<Self> {
        if !path.is_file() {
            return Err(CatalogError::Open(path.display().to_string()));
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|_| CatalogError::Open(path.display().to_string()))?;

        let schema: f64 = conn
            .query_row(SQL_PROPERTY, params!["schema"], |row| {
                row.get::<_, String>(0)
            })
            .optional()?
            .and_then(|raw| raw.parse().ok())
            .ok_or(CatalogError::Schema(0.0))?;
        if schema < OLDEST_SCHEMA - SCHEMA_EPSILON || schema > LATEST_SCHEMA + SCHEMA_EPSILON {
            return Err(CatalogError::Schema(schema));
        }

        let max_rowid: i64 =
            conn.query_row("SELECT COALESCE(MAX(rowid), 0) FROM catalog", [], |row| {
                row.get(0)
            })?;

        let counters = Self::read_counters(&conn, schema)?;

        Ok(Self {
            conn: Mutex::new(conn),
            schema,
            max_rowid: max_rowid as u64,
            counters,
        })
    }

    /// Counter rows were split by entry kind in schema 2.5; older catalogs
    /// only know their total, which we recover with a plain count.
    fn read_counters(conn: &Connection, schema: f64) -> CatalogResult<Counters> {
        if schema < LATEST_SCHEMA - SCHEMA_EPSILON {
            let total: i64 = conn.query_row("SELECT count(*) FROM catalog", [], |row| row.get(0))?;
            return Ok(Counters {
                regular: total as u64,
                ..Default::default()
            });
        }
        let fetch = |key: &str| -> CatalogResult<u64> {
            let value: Option<i64> = conn
                .query_row(
                    "SELECT value FROM statistics WHERE counter = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(value.unwrap_or(0) as u64)
        };
        Ok(Counters {
            regular: fetch("self_regular")?,
            symlink: fetch("self_symlink")?,
            directory: fetch("self_dir")?,
            nested: fetch("self_nested")?,
            chunked: fetch("self_chunked")?,
            subtree_entries: fetch("subtree_regular")?
                + fetch("subtree_symlink")?
                + fetch("subtree_dir")?,
        })
    }

    pub fn schema_version(&self) -> f64 {
        self.schema
    }

    pub fn max_rowid(&self) -> u64 {
        self.max_rowid
    }

    pub fn counters(&self) -> Counters {
        self.counters
    }

    pub fn lookup_by_pathhash(&self, hash: &PathHash) -> CatalogResult<Option<CatalogRow>> {
        let (hi, lo) = hash.halves();
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(SQL_LOOKUP_PATHHASH)?;
        let row = stmt
            .query_row(params![hi, lo], Self::row_from_sql)
            .optional()?;
        Ok(row)
    }

    pub fn lookup_by_rowid(&self, row_id: u64) -> CatalogResult<Option<CatalogRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(SQL_LOOKUP_ROWID)?;
        let row = stmt
            .query_row(params![row_id as i64], Self::row_from_sql)
            .optional()?;
        Ok(row)
    }

    pub fn list_children(&self, parent: &PathHash) -> CatalogResult<Vec<CatalogRow>> {
        let (hi, lo) = parent.halves();
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(SQL_LISTING)?;
        let rows = stmt
            .query_map(params![hi, lo], Self::row_from_sql)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn list_nested(&self) -> CatalogResult<Vec<(String, ContentHash)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(SQL_LIST_NESTED)?;
        let rows = stmt
            .query_map([], |row| {
                let path: String = row.get(0)?;
                let hex_hash: String = row.get(1)?;
                Ok((path, hex_hash))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(path, hex_hash)| {
                let hash = ContentHash::from_hex(&hex_hash)
                    .ok_or_else(|| CatalogError::Load(format!("bad nested hash for {path}")))?;
                Ok((path, hash))
            })
            .collect()
    }

    pub fn find_nested(&self, mountpoint: &str) -> CatalogResult<Option<ContentHash>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(SQL_FIND_NESTED)?;
        let hex_hash: Option<String> = stmt
            .query_row(params![mountpoint], |row| row.get(0))
            .optional()?;
        match hex_hash {
            None => Ok(None),
            Some(raw) => ContentHash::from_hex(&raw)
                .map(Some)
                .ok_or_else(|| CatalogError::Load(format!("bad nested hash for {mountpoint}"))),
        }
    }

    pub fn list_chunks(&self, hash: &PathHash) -> CatalogResult<Vec<FileChunk>> {
        let (hi, lo) = hash.halves();
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(SQL_LIST_CHUNKS)?;
        let chunks = stmt
            .query_map(params![hi, lo], |row| {
                let offset: i64 = row.get(0)?;
                let size: i64 = row.get(1)?;
                let blob: Vec<u8> = row.get(2)?;
                Ok((offset, size, blob))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        chunks
            .into_iter()
            .map(|(offset, size, blob)| {
                let content_hash = ContentHash::from_bytes(&blob)
                    .ok_or_else(|| CatalogError::Load("bad chunk hash length".into()))?;
                Ok(FileChunk {
                    content_hash,
                    offset: offset as u64,
                    size: size as u64,
                })
            })
            .collect()
    }

    pub fn property(&self, key: &str) -> CatalogResult<Option<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(SQL_PROPERTY)?;
        let value = stmt.query_row(params![key], |row| row.get(0)).optional()?;
        Ok(value)
    }

    pub fn num_entries(&self) -> CatalogResult<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT count(*) FROM catalog", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn row_from_sql(row: &rusqlite::Row<'_>) -> rusqlite::Result<CatalogRow> {
        let row_id: i64 = row.get(0)?;
        let parent_hi: i64 = row.get(1)?;
        let parent_lo: i64 = row.get(2)?;
        // Hardlinks pack the group id in the upper and the link count in the
        // lower 32 bits; 0 means "no hardlinks".
        let hardlinks: i64 = row.get(3)?;
        let size: i64 = row.get(4)?;
        let mode: i64 = row.get(5)?;
        let mtime: i64 = row.get(6)?;
        let entry_flags: i64 = row.get(7)?;
        let name: String = row.get(8)?;
        let symlink: Option<String> = row.get(9)?;
        let uid: i64 = row.get(10)?;
        let gid: i64 = row.get(11)?;
        let blob: Option<Vec<u8>> = row.get(12)?;

        let checksum = blob.as_deref().and_then(ContentHash::from_bytes);
        let hardlinks = hardlinks as u64;
        Ok(CatalogRow {
            row_id: row_id as u64,
            parent_hash: PathHash::from_halves(parent_hi, parent_lo),
            hardlink_group: hardlinks >> 32,
            linkcount: (hardlinks & 0xFFFF_FFFF) as u32,
            size: size as u64,
            mode: mode as u32,
            mtime,
            flags: entry_flags as u32,
            name,
            symlink: symlink.filter(|s| !s.is_empty()),
            uid: uid as u64,
            gid: gid as u64,
            checksum,
        })
    }
}

impl CatalogRow {
    pub fn is_directory(&self) -> bool {
        self.flags & flags::DIRECTORY != 0
    }
}

impl std::fmt::Debug for CatalogDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogDb")
            .field("schema", &self.schema)
            .field("max_rowid", &self.max_rowid)
            .finish()
    }
}
