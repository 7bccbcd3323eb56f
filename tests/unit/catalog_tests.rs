use std::sync::Arc;

use tempfile::tempdir;

use casfs::catalog::{Catalog, InodeAnnotation, InodeGenerationAnnotation, InodeRange};
use casfs::hash::{ContentHash, PathHash};

use crate::common::CatalogBuilder;

fn attached_catalog(dir: &std::path::Path, offset: u64) -> casfs::Result<Arc<Catalog>> {
    let mut builder = CatalogBuilder::new(dir, "", 3, 900);
    builder.add_dir("/bin");
    builder.add_file("/bin/tool", 64, &ContentHash::of_buffer(b"tool"));
    let hardlink_target = ContentHash::of_buffer(b"shared");
    builder.add_hardlink_file("/bin/one", 10, &hardlink_target, 5, 2);
    builder.add_hardlink_file("/bin/two", 10, &hardlink_target, 5, 2);
    let file = builder.finish();

    let catalog = Arc::new(Catalog::new(
        "",
        ContentHash::of_buffer(b"catalog"),
        std::sync::Weak::new(),
    ));
    catalog.open_database(&file)?;
    catalog.set_inode_range(InodeRange {
        offset,
        size: catalog.max_rowid(),
    });
    Ok(catalog)
}

#[test]
fn standalone_catalogs_skip_inode_mangling() -> casfs::Result<()> {
    let dir = tempdir()?;
    let mut builder = CatalogBuilder::new(dir.path(), "", 1, 900);
    builder.add_dir("/d");
    let file = builder.finish();

    let catalog = Arc::new(Catalog::new(
        "",
        ContentHash::default(),
        std::sync::Weak::new(),
    ));
    catalog.init_standalone(&file)?;
    assert!(catalog.inode_range().is_dummy());
    assert_eq!(catalog.mangle_inode(1, 0), 0);
    assert_eq!(catalog.revision(), 1);
    assert_eq!(catalog.num_entries(), 2);
    Ok(())
}

#[test]
fn inode_mangling_offsets_row_ids() -> casfs::Result<()> {
    let dir = tempdir()?;
    let catalog = attached_catalog(dir.path(), 1000)?;

    let entry = catalog
        .lookup_path(&PathHash::of_path("/bin/tool"))?
        .expect("entry exists");
    let range = catalog.inode_range();
    assert!(range.contains(entry.inode));
    assert_eq!(catalog.row_id_from_inode(entry.inode) + 1000, entry.inode);
    Ok(())
}

#[test]
fn hardlink_group_members_share_one_inode() -> casfs::Result<()> {
    let dir = tempdir()?;
    let catalog = attached_catalog(dir.path(), 500)?;

    let one = catalog
        .lookup_path(&PathHash::of_path("/bin/one"))?
        .expect("hardlink one");
    let two = catalog
        .lookup_path(&PathHash::of_path("/bin/two"))?
        .expect("hardlink two");
    assert_eq!(one.inode, two.inode);
    assert_eq!(one.linkcount, 2);

    let plain = catalog
        .lookup_path(&PathHash::of_path("/bin/tool"))?
        .expect("plain file");
    assert_ne!(plain.inode, one.inode);
    Ok(())
}

#[test]
fn annotation_mangling_is_invertible() -> casfs::Result<()> {
    let dir = tempdir()?;
    let catalog = attached_catalog(dir.path(), 255)?;
    let annotation: Arc<dyn InodeAnnotation> = Arc::new(InodeGenerationAnnotation::default());
    annotation.inc_generation(10_000);
    catalog.set_inode_annotation(Arc::clone(&annotation));

    let entry = catalog
        .lookup_path(&PathHash::of_path("/bin/tool"))?
        .expect("entry exists");
    assert!(entry.inode > 10_000);
    let row_id = catalog.row_id_from_inode(entry.inode);
    assert_eq!(catalog.mangle_inode(row_id, 0), entry.inode);
    Ok(())
}

#[test]
fn lookup_inode_returns_parent_path_hash() -> casfs::Result<()> {
    let dir = tempdir()?;
    let catalog = attached_catalog(dir.path(), 100)?;

    let entry = catalog
        .lookup_path(&PathHash::of_path("/bin/tool"))?
        .expect("entry exists");
    let (by_inode, parent_hash) = catalog
        .lookup_inode(entry.inode)?
        .expect("inode resolvable");
    assert_eq!(by_inode.name, "tool");
    assert_eq!(parent_hash, PathHash::of_path("/bin"));
    Ok(())
}

#[test]
fn children_registry_and_find_subtree() -> casfs::Result<()> {
    let dir = tempdir()?;
    let parent = attached_catalog(dir.path(), 255)?;

    let mut nested_builder = CatalogBuilder::new(dir.path(), "/bin/nested", 3, 900);
    nested_builder.add_file("/bin/nested/file", 1, &ContentHash::of_buffer(b"x"));
    let nested_file = nested_builder.finish();
    let child = Arc::new(Catalog::new(
        "/bin/nested",
        ContentHash::of_buffer(b"child"),
        Arc::downgrade(&parent),
    ));
    child.open_database(&nested_file)?;
    child.set_inode_range(InodeRange {
        offset: 10_000,
        size: child.max_rowid(),
    });
    child.attach_to_parent();

    assert!(!child.is_root());
    assert!(parent.find_child("/bin/nested").is_some());
    assert_eq!(parent.get_children().len(), 1);

    // find_subtree walks segment prefixes and returns the first matching child.
    let owner = parent
        .find_subtree("/bin/nested/deep/file")
        .expect("child owns the subtree");
    assert_eq!(owner.root_path(), "/bin/nested");
    assert!(parent.find_subtree("/bin/other").is_none());
    assert!(parent.find_subtree("/binx/nested").is_none());

    parent.remove_child("/bin/nested");
    assert!(parent.find_child("/bin/nested").is_none());
    Ok(())
}

#[test]
fn transition_point_takes_the_parent_inode() -> casfs::Result<()> {
    let dir = tempdir()?;

    // Parent catalog: "/data" is a mountpoint directory.
    let mut parent_builder = CatalogBuilder::new(dir.path(), "", 4, 900);
    parent_builder.add_mountpoint("/data");
    let parent_file = parent_builder.finish();
    let parent = Arc::new(Catalog::new(
        "",
        ContentHash::of_buffer(b"parent"),
        std::sync::Weak::new(),
    ));
    parent.open_database(&parent_file)?;
    parent.set_inode_range(InodeRange {
        offset: 255,
        size: parent.max_rowid(),
    });

    // Nested catalog: its root row is the same path, flagged as nested root.
    let mut child_builder = CatalogBuilder::new(dir.path(), "/data", 4, 900);
    child_builder.add_file("/data/file", 1, &ContentHash::of_buffer(b"f"));
    let child_file = child_builder.finish();
    let child = Arc::new(Catalog::new(
        "/data",
        ContentHash::of_buffer(b"child"),
        Arc::downgrade(&parent),
    ));
    child.open_database(&child_file)?;
    child.set_inode_range(InodeRange {
        offset: 20_000,
        size: child.max_rowid(),
    });
    child.attach_to_parent();

    let hash = PathHash::of_path("/data");
    let through_parent = parent.lookup_path(&hash)?.expect("mountpoint entry");
    let through_child = child.lookup_path(&hash)?.expect("nested root entry");
    assert!(through_child.is_nested_root());
    assert_eq!(through_child.inode, through_parent.inode);
    Ok(())
}
