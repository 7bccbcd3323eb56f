//! Catalog subsystem: relational snapshots of directory trees, attached into
//! a lazily loaded forest.

use thiserror::Error;

pub mod catalog;
pub mod database;
pub mod entry;
pub mod manager;

pub use catalog::{Catalog, InodeRange, NestedRef};
pub use database::{CatalogDb, CatalogRow, Counters};
pub use entry::{DirectoryEntry, FileChunk, StatEntry, StatInfo};
pub use manager::{
    CatalogManager, CatalogSource, InodeAnnotation, InodeGenerationAnnotation, LookupMode,
    ROOT_INODE_OFFSET,
};

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("catalog database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("unsupported catalog schema {0}")]
    Schema(f64),
    #[error("cannot open catalog file {0}")]
    Open(String),
    #[error("catalog hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },
    #[error("failed to load catalog: {0}")]
    Load(String),
}

pub type CatalogResult<T> = std::result::Result<T, CatalogError>;

/// Outcome of a (re)load attempt of the mounted root catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Up2Date,
    New,
    Fail,
    NoSpace,
}
