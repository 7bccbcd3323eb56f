//! Filesystem-operation behavior through `MountState`.

use std::sync::Arc;

use tempfile::tempdir;

use casfs::cache::{QuotaManager, UnmanagedQuota};
use casfs::download::PermissiveVerifier;
use casfs::fs::bridge::{Errno, FileHandle, XattrReply};
use casfs::fs::{MountState, NUM_RESERVED_FD};
use casfs::hash::{ContentHash, ObjectSuffix};

use crate::common::{CatalogBuilder, RepoFixture};

const KERNEL_ROOT_INO: u64 = 1;

fn demo_repo() -> RepoFixture {
    let fixture = RepoFixture::new("demo.example.org");
    let readme = fixture.publish_object(b"hello repository\n", ObjectSuffix::Plain);

    // Chunked file: four chunks of 2560 bytes with distinct fill patterns.
    let chunk_specs: Vec<(ContentHash, u64, u64)> = (0..4u64)
        .map(|idx| {
            let content = vec![b'a' + idx as u8; 2560];
            let hash = fixture.publish_object(&content, ObjectSuffix::Partial);
            (hash, idx * 2560, 2560)
        })
        .collect();

    let mut root = CatalogBuilder::new(fixture.scratch.path(), "", 1, 900);
    root.add_dir("/docs");
    root.add_file("/docs/readme", 17, &readme);
    root.add_symlink("/docs/current", "readme");
    root.add_chunked_file("/big.bin", &chunk_specs);
    let root_hash = fixture.publish_catalog(root);
    fixture.publish_manifest(root_hash, 1, 900);
    fixture
}

fn lookup_ino(state: &MountState, parent: u64, name: &str) -> u64 {
    let reply = state.lookup(parent, name).expect("lookup reply");
    assert!(!reply.is_negative(), "expected {name} to exist");
    reply.ino
}

#[test]
fn lookup_getattr_and_readlink() -> casfs::Result<()> {
    let fixture = demo_repo();
    let cache = tempdir()?;
    let state = fixture.mount(cache.path());

    let docs_ino = lookup_ino(&state, KERNEL_ROOT_INO, "docs");
    let readme_ino = lookup_ino(&state, docs_ino, "readme");

    let attr = state.getattr(readme_ino).expect("getattr");
    assert_eq!(attr.attr.size, 17);
    assert_eq!(attr.attr.mode & libc::S_IFMT, libc::S_IFREG);

    let link_ino = lookup_ino(&state, docs_ino, "current");
    assert_eq!(state.readlink(link_ino).expect("readlink"), "readme");

    // readlink on a regular file is EINVAL.
    assert_eq!(state.readlink(readme_ino), Err(Errno::INVAL));

    // Dot lookups resolve without extra catalog walks.
    let dot = state.lookup(docs_ino, ".").expect("dot lookup");
    assert_eq!(dot.ino, docs_ino);
    let dotdot = state.lookup(docs_ino, "..").expect("dotdot lookup");
    assert_eq!(dotdot.ino, state.catalog_mgr.get_root_inode());
    let root_dotdot = state.lookup(KERNEL_ROOT_INO, "..").expect("root dotdot");
    assert_eq!(root_dotdot.ino, 1, "the root's parent is the kernel root id");
    Ok(())
}

#[test]
fn negative_lookups_are_memoized() -> casfs::Result<()> {
    let fixture = demo_repo();
    let cache = tempdir()?;
    let state = fixture.mount(cache.path());

    let first = state.lookup(KERNEL_ROOT_INO, "does-not-exist").expect("reply");
    assert!(first.is_negative());

    let catalog_lookups = state
        .catalog_mgr
        .statistics()
        .num_lookups
        .load(std::sync::atomic::Ordering::Relaxed);
    let second = state.lookup(KERNEL_ROOT_INO, "does-not-exist").expect("reply");
    assert!(second.is_negative());
    assert_eq!(
        state
            .catalog_mgr
            .statistics()
            .num_lookups
            .load(std::sync::atomic::Ordering::Relaxed),
        catalog_lookups,
        "second miss served from the negative entry, no catalog consulted"
    );
    Ok(())
}

#[test]
fn forget_drops_tracker_entries() -> casfs::Result<()> {
    let fixture = demo_repo();
    let cache = tempdir()?;
    let state = fixture.mount(cache.path());

    let docs_ino = lookup_ino(&state, KERNEL_ROOT_INO, "docs");
    assert_eq!(state.tracker().find_path(docs_ino).as_deref(), Some("/docs"));
    state.forget(docs_ino, 1);
    assert_eq!(state.tracker().find_path(docs_ino), None);
    Ok(())
}

#[test]
fn opendir_readdir_releasedir_cycle() -> casfs::Result<()> {
    let fixture = demo_repo();
    let cache = tempdir()?;
    let state = fixture.mount(cache.path());

    let docs_ino = lookup_ino(&state, KERNEL_ROOT_INO, "docs");
    let handle = state.opendir(docs_ino).expect("opendir");
    assert_eq!(state.num_open_dirs(), 1);

    // The whole buffer drains through bounded readdir slices.
    let mut total = 0usize;
    let mut offset = 0u64;
    loop {
        let slice = state.readdir(handle, 64, offset).expect("readdir");
        if slice.is_empty() {
            break;
        }
        total += slice.len();
        offset += slice.len() as u64;
    }
    assert!(total > 0);

    state.releasedir(handle).expect("releasedir");
    assert_eq!(state.num_open_dirs(), 0);
    assert_eq!(state.releasedir(handle), Err(Errno::INVAL));

    // opendir on a file is ENOTDIR.
    let readme_ino = lookup_ino(&state, docs_ino, "readme");
    assert_eq!(state.opendir(readme_ino).err(), Some(Errno::NOTDIR));
    Ok(())
}

#[test]
fn open_and_read_a_plain_file() -> casfs::Result<()> {
    let fixture = demo_repo();
    let cache = tempdir()?;
    let state = fixture.mount(cache.path());

    let docs_ino = lookup_ino(&state, KERNEL_ROOT_INO, "docs");
    let readme_ino = lookup_ino(&state, docs_ino, "readme");

    let handle = state.open(readme_ino, libc::O_RDONLY).expect("open");
    assert!(matches!(handle, FileHandle::Plain(_)));
    assert_eq!(state.num_open_files(), 1);

    let data = state.read(readme_ino, handle, 4096, 0).expect("read");
    assert_eq!(&data, b"hello repository\n");
    let tail = state.read(readme_ino, handle, 4096, 6).expect("offset read");
    assert_eq!(&tail, b"repository\n");

    state.release(readme_ino, handle).expect("release");
    assert_eq!(state.num_open_files(), 0);

    // O_EXCL on the read-only filesystem replies EEXIST.
    assert_eq!(state.open(readme_ino, libc::O_EXCL).err(), Some(Errno::EXIST));
    Ok(())
}

#[test]
fn chunked_read_crosses_chunk_boundaries() -> casfs::Result<()> {
    let fixture = demo_repo();
    let cache = tempdir()?;
    let state = fixture.mount(cache.path());

    let big_ino = lookup_ino(&state, KERNEL_ROOT_INO, "big.bin");
    let handle = state.open(big_ino, libc::O_RDONLY).expect("open chunked");
    let FileHandle::Chunked(_) = handle else {
        panic!("chunked file must get a synthetic handle");
    };
    assert!(handle.to_raw() < 0, "wire encoding marks chunked handles");

    // 3072 bytes starting at 1024: 1536 from chunk 0, 1536 from chunk 1.
    let data = state.read(big_ino, handle, 3072, 1024).expect("read");
    assert_eq!(data.len(), 3072);
    assert!(data[..1536].iter().all(|b| *b == b'a'));
    assert!(data[1536..].iter().all(|b| *b == b'b'));

    // Spanning three chunks.
    let wide = state.read(big_ino, handle, 2560 * 2 + 10, 2555).expect("read");
    assert_eq!(wide.len(), 2560 * 2 + 10);
    assert!(wide[..5].iter().all(|b| *b == b'a'));
    assert!(wide[5..5 + 2560].iter().all(|b| *b == b'b'));

    // Reads at end of file come back short.
    let tail = state.read(big_ino, handle, 4096, 4 * 2560 - 100).expect("read");
    assert_eq!(tail.len(), 100);

    state.release(big_ino, handle).expect("release");
    assert_eq!(state.chunked.num_open_chunk_lists(), 0);
    Ok(())
}

#[test]
fn chunk_lists_are_refcounted_across_opens() -> casfs::Result<()> {
    let fixture = demo_repo();
    let cache = tempdir()?;
    let state = fixture.mount(cache.path());

    let big_ino = lookup_ino(&state, KERNEL_ROOT_INO, "big.bin");
    let first = state.open(big_ino, libc::O_RDONLY).expect("first open");
    let second = state.open(big_ino, libc::O_RDONLY).expect("second open");
    assert_eq!(state.chunked.num_open_chunk_lists(), 1);

    state.release(big_ino, first).expect("release first");
    assert_eq!(state.chunked.num_open_chunk_lists(), 1);
    state.release(big_ino, second).expect("release second");
    assert_eq!(state.chunked.num_open_chunk_lists(), 0);
    Ok(())
}

#[test]
fn open_fd_exhaustion_replies_emfile() -> casfs::Result<()> {
    let fixture = demo_repo();
    let cache = tempdir()?;
    let mut state = fixture.mount(cache.path());
    state.set_max_open_files(NUM_RESERVED_FD + 2);

    let docs_ino = lookup_ino(&state, KERNEL_ROOT_INO, "docs");
    let readme_ino = lookup_ino(&state, docs_ino, "readme");

    let first = state.open(readme_ino, libc::O_RDONLY).expect("open 1");
    let second = state.open(readme_ino, libc::O_RDONLY).expect("open 2");
    assert_eq!(state.open(readme_ino, libc::O_RDONLY).err(), Some(Errno::MFILE));

    // Releasing any prior handle frees a slot.
    state.release(readme_ino, first).expect("release");
    let third = state.open(readme_ino, libc::O_RDONLY).expect("open 3");
    state.release(readme_ino, second).expect("release");
    state.release(readme_ino, third).expect("release");
    Ok(())
}

#[test]
fn statfs_reports_quota_numbers() -> casfs::Result<()> {
    struct FixedQuota;
    impl QuotaManager for FixedQuota {
        fn capacity(&self) -> u64 {
            1000
        }
        fn used(&self) -> u64 {
            250
        }
        fn insert(&self, _id: &ContentHash, _size: u64, _description: &str) {}
        fn remove(&self, _id: &ContentHash) {}
    }

    let fixture = demo_repo();
    let cache = tempdir()?;
    let state = MountState::create(
        fixture.settings(cache.path()),
        fixture.downloader(),
        Arc::new(PermissiveVerifier),
        Arc::new(FixedQuota),
    )?;

    let reply = state.statfs(KERNEL_ROOT_INO).expect("statfs");
    assert_eq!(reply.blocks, 1000);
    assert_eq!(reply.bavail, 750);
    assert!(reply.files > 0);

    // Unmanaged cache: the filesystem hides from df.
    let cache2 = tempdir()?;
    let fixture2 = demo_repo();
    let unmanaged = MountState::create(
        fixture2.settings(cache2.path()),
        fixture2.downloader(),
        Arc::new(PermissiveVerifier),
        Arc::new(UnmanagedQuota),
    )?;
    assert_eq!(unmanaged.statfs(KERNEL_ROOT_INO).expect("statfs").blocks, 0);
    Ok(())
}

#[test]
fn virtual_xattrs_answer_and_probe() -> casfs::Result<()> {
    let fixture = demo_repo();
    let cache = tempdir()?;
    let state = fixture.mount(cache.path());

    let docs_ino = lookup_ino(&state, KERNEL_ROOT_INO, "docs");
    let readme_ino = lookup_ino(&state, docs_ino, "readme");

    match state.getxattr(KERNEL_ROOT_INO, "user.fqrn", 256).expect("fqrn") {
        XattrReply::Data(data) => assert_eq!(data, b"demo.example.org"),
        other => panic!("expected data, got {other:?}"),
    }

    // Size probe, then a too-small buffer.
    let XattrReply::Size(len) = state
        .getxattr(KERNEL_ROOT_INO, "user.fqrn", 0)
        .expect("probe")
    else {
        panic!("expected size reply");
    };
    assert_eq!(len, "demo.example.org".len());
    assert_eq!(
        state.getxattr(KERNEL_ROOT_INO, "user.fqrn", len - 1),
        Err(Errno::RANGE)
    );

    // user.hash exists for regular files only.
    assert!(state.getxattr(readme_ino, "user.hash", 256).is_ok());
    assert_eq!(
        state.getxattr(docs_ino, "user.hash", 256),
        Err(Errno::NODATA)
    );
    assert_eq!(
        state.getxattr(KERNEL_ROOT_INO, "user.bogus", 256),
        Err(Errno::NODATA)
    );

    // The list carries hash attributes only for entries with a checksum.
    let XattrReply::Data(listing) = state.listxattr(readme_ino, 4096).expect("list") else {
        panic!("expected data reply");
    };
    let listed: Vec<&str> = listing
        .split(|b| *b == 0)
        .filter(|part| !part.is_empty())
        .map(|part| std::str::from_utf8(part).unwrap())
        .collect();
    assert!(listed.contains(&"user.fqrn"));
    assert!(listed.contains(&"user.hash"));

    let XattrReply::Data(dir_listing) = state.listxattr(docs_ino, 4096).expect("list") else {
        panic!("expected data reply");
    };
    assert!(!dir_listing.windows(9).any(|w| w == b"user.hash"));
    Ok(())
}
