use casfs::cache::meta::{round_capacity, Md5PathLookup};
use casfs::cache::{InodeCache, Md5PathCache, PathCache};
use casfs::catalog::DirectoryEntry;
use casfs::hash::PathHash;

fn entry_named(name: &str) -> DirectoryEntry {
    DirectoryEntry {
        name: name.to_string(),
        size: 42,
        ..Default::default()
    }
}

#[test]
fn capacities_are_multiples_of_64() {
    assert_eq!(round_capacity(0), 64);
    assert_eq!(round_capacity(63), 64);
    assert_eq!(round_capacity(64), 64);
    assert_eq!(round_capacity(1000), 960);
}

#[test]
fn insert_then_drop_yields_empty_cache() {
    let cache = InodeCache::new(128);
    cache.insert(300, entry_named("a"));
    assert_eq!(cache.lookup(300).expect("hit").name, "a");
    cache.drop_all();
    assert!(cache.lookup(300).is_none());

    let stats = cache.statistics();
    assert_eq!(stats.inserts, 1);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.drops, 1);
}

#[test]
fn pause_rejects_inserts_until_resume() {
    let cache = PathCache::new(64);
    cache.pause();
    cache.insert(300, "/paused");
    assert!(cache.lookup(300).is_none());
    cache.resume();
    cache.insert(300, "/resumed");
    assert_eq!(cache.lookup(300).as_deref(), Some("/resumed"));
}

#[test]
fn lookups_keep_working_while_paused() {
    let cache = InodeCache::new(64);
    cache.insert(300, entry_named("kept"));
    cache.pause();
    assert_eq!(cache.lookup(300).expect("hit while paused").name, "kept");
    cache.resume();
}

#[test]
fn negative_entries_collapse_to_the_sentinel() {
    let cache = Md5PathCache::new(64);
    let hash = PathHash::of_path("/does/not/exist");

    assert_eq!(cache.lookup(&hash), Md5PathLookup::Miss);
    cache.insert_negative(hash);
    assert_eq!(cache.lookup(&hash), Md5PathLookup::Negative);
    assert_eq!(cache.statistics().inserts_negative, 1);

    // A real entry overwrites the memoized miss.
    cache.insert(hash, entry_named("appeared"));
    match cache.lookup(&hash) {
        Md5PathLookup::Hit(entry) => assert_eq!(entry.name, "appeared"),
        other => panic!("expected hit, got {other:?}"),
    }
}

#[test]
fn lru_evicts_oldest_entries() {
    let cache = InodeCache::new(64); // minimum capacity
    for ino in 0..65u64 {
        cache.insert(ino, entry_named(&format!("e{ino}")));
    }
    assert!(cache.lookup(0).is_none(), "oldest entry evicted");
    assert!(cache.lookup(64).is_some(), "newest entry kept");
}
