use std::collections::HashMap;
use std::path::PathBuf;

use casfs::config::{parse_owner_map, substitute_url, Settings};

fn base_options() -> HashMap<String, String> {
    let mut options = HashMap::new();
    options.insert(
        "CVMFS_SERVER_URL".to_string(),
        "http://mirror.example.org/@org@/@fqrn@".to_string(),
    );
    options
}

#[test]
fn defaults_match_the_documented_values() -> casfs::Result<()> {
    let settings = Settings::from_map("demo.example.org", &base_options())?;
    assert_eq!(settings.timeout, 2);
    assert_eq!(settings.timeout_direct, 2);
    assert_eq!(settings.max_retries, 1);
    assert_eq!(settings.mem_cache_size, 16 * 1024 * 1024);
    assert_eq!(settings.kcache_timeout, 60.0);
    assert_eq!(settings.quota_limit, 1024 * 1024 * 1024);
    assert_eq!(settings.max_ttl, 0);
    assert!(settings.auto_update);
    assert!(!settings.fixed_catalog());
    assert!(settings.uid_map.is_empty());
    Ok(())
}

#[test]
fn server_url_placeholders_are_substituted() -> casfs::Result<()> {
    let settings = Settings::from_map("demo.example.org", &base_options())?;
    assert_eq!(
        settings.server_url,
        "http://mirror.example.org/demo/demo.example.org"
    );
    assert_eq!(substitute_url("@org@-@fqrn@", "a.b.c"), "a-a.b.c");
    Ok(())
}

#[test]
fn server_url_is_required() {
    assert!(Settings::from_map("demo.example.org", &HashMap::new()).is_err());
}

#[test]
fn cache_layout_follows_the_shared_flag() -> casfs::Result<()> {
    let mut options = base_options();
    options.insert("CVMFS_CACHE_BASE".to_string(), "/cache".to_string());
    let settings = Settings::from_map("demo.example.org", &options)?;
    assert_eq!(
        settings.upper_cache_dir(),
        PathBuf::from("/cache/demo.example.org")
    );
    assert_eq!(settings.lower_cache_dir(), None);

    options.insert("CVMFS_SHARED_CACHE".to_string(), "yes".to_string());
    let shared = Settings::from_map("demo.example.org", &options)?;
    assert_eq!(shared.lower_cache_dir(), Some(PathBuf::from("/cache/shared")));
    Ok(())
}

#[test]
fn kcache_timeout_minus_one_disables_kernel_caching() -> casfs::Result<()> {
    let mut options = base_options();
    options.insert("CVMFS_KCACHE_TIMEOUT".to_string(), "-1".to_string());
    let settings = Settings::from_map("demo.example.org", &options)?;
    assert_eq!(settings.kcache_timeout, 0.0);
    Ok(())
}

#[test]
fn pinned_root_hash_fixes_the_catalog() -> casfs::Result<()> {
    let mut options = base_options();
    options.insert("CVMFS_ROOT_HASH".to_string(), "ab".repeat(20));
    let settings = Settings::from_map("demo.example.org", &options)?;
    assert!(settings.fixed_catalog());

    let mut options = base_options();
    options.insert("CVMFS_AUTO_UPDATE".to_string(), "no".to_string());
    let settings = Settings::from_map("demo.example.org", &options)?;
    assert!(settings.fixed_catalog());
    Ok(())
}

#[test]
fn owner_maps_parse_and_reject_garbage() -> casfs::Result<()> {
    let map = parse_owner_map(Some("0:1000, 500:1500"))?;
    assert_eq!(map.get(&0), Some(&1000));
    assert_eq!(map.get(&500), Some(&1500));
    assert_eq!(parse_owner_map(None)?.len(), 0);
    assert_eq!(parse_owner_map(Some(""))?.len(), 0);
    assert!(parse_owner_map(Some("nonsense")).is_err());
    assert!(parse_owner_map(Some("1:x")).is_err());
    Ok(())
}

#[test]
fn durations_scale_to_their_units() -> casfs::Result<()> {
    let mut options = base_options();
    options.insert("CVMFS_BACKOFF_INIT".to_string(), "3".to_string());
    options.insert("CVMFS_BACKOFF_MAX".to_string(), "20".to_string());
    options.insert("CVMFS_MAX_TTL".to_string(), "15".to_string());
    options.insert("CVMFS_MEMCACHE_SIZE".to_string(), "32".to_string());
    let settings = Settings::from_map("demo.example.org", &options)?;
    assert_eq!(settings.backoff_init_ms, 3000);
    assert_eq!(settings.backoff_max_ms, 20_000);
    assert_eq!(settings.max_ttl, 15 * 60);
    assert_eq!(settings.mem_cache_size, 32 * 1024 * 1024);
    Ok(())
}
