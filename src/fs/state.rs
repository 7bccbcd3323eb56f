//! Hot-reload state passed between module incarnations.
//!
//! On a library hot-swap the supervisor collects the state items from the old
//! incarnation and hands them to the new one. Items are tagged; unknown tags
//! are skipped. Inode tracker snapshots from older releases are migrated on
//! restore.

use serde::{Deserialize, Serialize};

use super::bridge::DirectoryListing;
use super::chunked::ChunkTables;
use crate::glue::{compat::LegacyTracker, InodeTracker};

/// Versioned inode-generation record: the initial catalog revision, the
/// number of module reloads and the generation offset all live inodes are
/// based on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct InodeGenerationInfo {
    pub version: u32,
    pub initial_revision: u64,
    pub incarnation: u32,
    /// Kept for wire compatibility with version 1 records.
    pub overflow_counter_unused: u32,
    pub inode_generation: u64,
}

impl Default for InodeGenerationInfo {
    fn default() -> Self {
        Self {
            version: 2,
            initial_revision: 0,
            incarnation: 0,
            overflow_counter_unused: 0,
            inode_generation: 0,
        }
    }
}

/// One saved state item. The enum tag is the state identifier.
pub enum SavedState {
    /// Open directory handles with their listing buffers.
    OpenDirs(Vec<(u64, DirectoryListing)>),
    /// Current inode tracker representation.
    InodeTrackerV3(InodeTracker),
    /// Tracker snapshot from a v1 incarnation; migrated on restore.
    InodeTrackerV1(LegacyTracker),
    /// Tracker snapshot from a v2 incarnation; migrated on restore.
    InodeTrackerV2(LegacyTracker),
    /// Chunked-file tables.
    OpenFiles(ChunkTables),
    InodeGeneration(InodeGenerationInfo),
    OpenFilesCounter(u32),
}

impl SavedState {
    pub fn tag(&self) -> &'static str {
        match self {
            SavedState::OpenDirs(_) => "OpenDirs",
            SavedState::InodeTrackerV3(_) => "InodeTrackerV3",
            SavedState::InodeTrackerV1(_) => "InodeTrackerV1",
            SavedState::InodeTrackerV2(_) => "InodeTrackerV2",
            SavedState::OpenFiles(_) => "OpenFiles",
            SavedState::InodeGeneration(_) => "InodeGeneration",
            SavedState::OpenFilesCounter(_) => "OpenFilesCounter",
        }
    }
}
