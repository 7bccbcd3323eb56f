//! Save/restore of hot-reload state between module incarnations.

use tempfile::tempdir;

use casfs::fs::state::SavedState;
use casfs::glue::compat::{LegacyDirent, LegacyTracker};
use casfs::hash::ObjectSuffix;

use crate::common::{CatalogBuilder, RepoFixture};

fn simple_repo() -> RepoFixture {
    let fixture = RepoFixture::new("demo.example.org");
    let file = fixture.publish_object(b"payload", ObjectSuffix::Plain);
    let mut root = CatalogBuilder::new(fixture.scratch.path(), "", 1, 900);
    root.add_dir("/d");
    root.add_file("/d/f", 7, &file);
    let root_hash = fixture.publish_catalog(root);
    fixture.publish_manifest(root_hash, 1, 900);
    fixture
}

#[test]
fn save_restore_round_trips_the_runtime_state() -> casfs::Result<()> {
    let fixture = simple_repo();
    let cache_old = tempdir()?;
    let old = fixture.mount(cache_old.path());

    // Produce live state: a referenced inode and an open directory handle.
    let dir_reply = old.lookup(1, "d").expect("lookup /d");
    let dir_ino = dir_reply.ino;
    let dir_handle = old.opendir(dir_ino).expect("opendir");

    old.enter_maintenance_mode();
    let saved = old.save_state();
    let tags: Vec<&str> = saved.iter().map(|item| item.tag()).collect();
    assert!(tags.contains(&"OpenDirs"));
    assert!(tags.contains(&"InodeTrackerV3"));
    assert!(tags.contains(&"OpenFiles"));
    assert!(tags.contains(&"InodeGeneration"));
    assert!(tags.contains(&"OpenFilesCounter"));

    // New incarnation against the same repository, separate cache.
    let cache_new = tempdir()?;
    let new = fixture.mount(cache_new.path());
    let generation_before = new.catalog_mgr.get_root_inode();
    new.restore_state(saved);

    // The directory handle keeps serving its listing buffer.
    let slice = new.readdir(dir_handle, 4096, 0).expect("restored readdir");
    assert!(!slice.is_empty());

    // The tracker still resolves the kernel-held inode.
    assert_eq!(new.tracker().find_path(dir_ino).as_deref(), Some("/d"));

    // Incarnation advanced, and the inode generation pushed new inodes past
    // everything the kernel may still hold.
    let info = new.inode_generation_info();
    assert_eq!(info.incarnation, 1);
    assert!(info.inode_generation > 0);
    assert!(new.catalog_mgr.get_root_inode() > generation_before);
    Ok(())
}

#[test]
fn legacy_tracker_snapshots_migrate_on_restore() -> casfs::Result<()> {
    let fixture = simple_repo();
    let cache = tempdir()?;
    let state = fixture.mount(cache.path());

    let legacy = LegacyTracker {
        entries: vec![
            LegacyDirent {
                inode: 600,
                parent_inode: 0,
                name: String::new(),
                references: 1,
            },
            LegacyDirent {
                inode: 601,
                parent_inode: 600,
                name: "old-dir".into(),
                references: 3,
            },
        ],
    };
    state.restore_state(vec![SavedState::InodeTrackerV2(legacy)]);

    assert_eq!(state.tracker().find_path(601).as_deref(), Some("/old-dir"));
    // References survived the migration: two puts keep the entry alive.
    state.tracker().vfs_put(601, 2);
    assert_eq!(state.tracker().find_path(601).as_deref(), Some("/old-dir"));
    state.tracker().vfs_put(601, 1);
    assert_eq!(state.tracker().find_path(601), None);
    Ok(())
}
