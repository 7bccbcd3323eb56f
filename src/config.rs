//! Mount configuration.
//!
//! Settings are consumed from `CVMFS_*` keys, either from the process
//! environment or from a parsed key/value map (the option files themselves are
//! parsed by the caller). Unknown keys are ignored.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::{Error, Result};

pub const DEFAULT_CACHE_BASE: &str = "/var/lib/casfs/default";
pub const DEFAULT_TIMEOUT: u32 = 2;
pub const DEFAULT_KCACHE_TIMEOUT: f64 = 60.0;
pub const DEFAULT_MEMCACHE_SIZE: u64 = 16 * 1024 * 1024;
pub const DEFAULT_QUOTA_LIMIT: i64 = 1024 * 1024 * 1024;

/// Owner translation map applied to catalog uids/gids.
pub type OwnerMap = HashMap<u64, u64>;

#[derive(Debug, Clone)]
pub struct Settings {
    /// Fully qualified repository name, e.g. `atlas.cern.ch`.
    pub fqrn: String,
    /// Server URL with `@org@` / `@fqrn@` already substituted.
    pub server_url: String,
    pub http_proxy: Option<String>,
    pub cache_base: PathBuf,
    pub shared_cache: bool,
    pub mem_cache_size: u64,
    pub timeout: u32,
    pub timeout_direct: u32,
    pub max_retries: u32,
    pub backoff_init_ms: u64,
    pub backoff_max_ms: u64,
    /// Upper clamp on the catalog TTL, in seconds; 0 means unclamped.
    pub max_ttl: u64,
    pub kcache_timeout: f64,
    pub quota_limit: i64,
    pub keys_dir: Option<PathBuf>,
    pub public_key: Option<PathBuf>,
    /// Pins the root catalog; disables reloads.
    pub root_hash: Option<String>,
    pub repository_tag: Option<String>,
    pub nfs_source: bool,
    pub nfs_shared: Option<PathBuf>,
    pub auto_update: bool,
    pub uid_map: OwnerMap,
    pub gid_map: OwnerMap,
}

impl Settings {
    /// Build settings for `fqrn` from an explicit key/value map.
    pub fn from_map(fqrn: &str, options: &HashMap<String, String>) -> Result<Self> {
        let get = |key: &str| options.get(key).map(|v| v.trim().to_string());

        let server_url = match get("CVMFS_SERVER_URL") {
            Some(raw) => substitute_url(&raw, fqrn),
            None => {
                return Err(Error::Config(format!(
                    "CVMFS_SERVER_URL is required for {fqrn}"
                ))
                .into())
            }
        };

        let cache_base = get("CVMFS_CACHE_BASE")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_BASE));
        let shared_cache = get("CVMFS_SHARED_CACHE").map(|v| is_on(&v)).unwrap_or(false);

        let parse_u64 = |key: &str, default: u64| -> Result<u64> {
            match get(key) {
                Some(v) => v
                    .parse::<u64>()
                    .map_err(|_| Error::Config(format!("{key}: not a number: {v}")).into()),
                None => Ok(default),
            }
        };

        let kcache_timeout = match get("CVMFS_KCACHE_TIMEOUT") {
            Some(v) => {
                let secs = v
                    .parse::<i64>()
                    .map_err(|_| Error::Config(format!("CVMFS_KCACHE_TIMEOUT: {v}")))?;
                if secs == -1 {
                    0.0
                } else {
                    secs as f64
                }
            }
            None => DEFAULT_KCACHE_TIMEOUT,
        };

        let quota_limit = match get("CVMFS_QUOTA_LIMIT") {
            Some(v) => {
                let mb = v
                    .parse::<i64>()
                    .map_err(|_| Error::Config(format!("CVMFS_QUOTA_LIMIT: {v}")))?;
                mb.max(0) * 1024 * 1024
            }
            None => DEFAULT_QUOTA_LIMIT,
        };

        Ok(Self {
            fqrn: fqrn.to_string(),
            server_url,
            http_proxy: get("CVMFS_HTTP_PROXY"),
            cache_base,
            shared_cache,
            mem_cache_size: parse_u64("CVMFS_MEMCACHE_SIZE", 0)?
                .checked_mul(1024 * 1024)
                .filter(|v| *v > 0)
                .unwrap_or(DEFAULT_MEMCACHE_SIZE),
            timeout: parse_u64("CVMFS_TIMEOUT", DEFAULT_TIMEOUT as u64)? as u32,
            timeout_direct: parse_u64("CVMFS_TIMEOUT_DIRECT", DEFAULT_TIMEOUT as u64)? as u32,
            max_retries: parse_u64("CVMFS_MAX_RETRIES", 1)? as u32,
            backoff_init_ms: parse_u64("CVMFS_BACKOFF_INIT", 2)? * 1000,
            backoff_max_ms: parse_u64("CVMFS_BACKOFF_MAX", 10)? * 1000,
            max_ttl: parse_u64("CVMFS_MAX_TTL", 0)? * 60,
            kcache_timeout,
            quota_limit,
            keys_dir: get("CVMFS_KEYS_DIR").map(PathBuf::from),
            public_key: get("CVMFS_PUBLIC_KEY").map(PathBuf::from),
            root_hash: get("CVMFS_ROOT_HASH"),
            repository_tag: get("CVMFS_REPOSITORY_TAG"),
            nfs_source: get("CVMFS_NFS_SOURCE").map(|v| is_on(&v)).unwrap_or(false),
            nfs_shared: get("CVMFS_NFS_SHARED").map(PathBuf::from),
            auto_update: get("CVMFS_AUTO_UPDATE").map(|v| is_on(&v)).unwrap_or(true),
            uid_map: parse_owner_map(get("CVMFS_UID_MAP").as_deref())?,
            gid_map: parse_owner_map(get("CVMFS_GID_MAP").as_deref())?,
        })
    }

    /// Build settings for `fqrn` from the process environment.
    pub fn from_env(fqrn: &str) -> Result<Self> {
        let mut options = HashMap::new();
        for (key, value) in std::env::vars() {
            if key.starts_with("CVMFS_") {
                options.insert(key, value);
            }
        }
        Self::from_map(fqrn, &options)
    }

    /// A catalog is fixed when pinned to a hash or when auto-update is off.
    pub fn fixed_catalog(&self) -> bool {
        self.root_hash.is_some() || !self.auto_update
    }

    /// Fast per-repository cache layer; also holds the mount sentinels.
    pub fn upper_cache_dir(&self) -> PathBuf {
        self.cache_base.join(&self.fqrn)
    }

    /// Large cache layer shared between repositories, present only with
    /// `CVMFS_SHARED_CACHE`; backs the upper layer on misses.
    pub fn lower_cache_dir(&self) -> Option<PathBuf> {
        self.shared_cache.then(|| self.cache_base.join("shared"))
    }
}

fn is_on(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "yes" | "on" | "1" | "true"
    )
}

/// Substitute `@org@` (first label of the fqrn) and `@fqrn@` in a server URL.
pub fn substitute_url(url: &str, fqrn: &str) -> String {
    let org = fqrn.split('.').next().unwrap_or(fqrn);
    url.replace("@org@", org).replace("@fqrn@", fqrn)
}

/// Parse `from:to[,from:to...]` owner maps; an empty string is an empty map.
pub fn parse_owner_map(raw: Option<&str>) -> Result<OwnerMap> {
    let mut map = OwnerMap::new();
    let Some(raw) = raw else {
        return Ok(map);
    };
    for pair in raw.split(',').filter(|p| !p.trim().is_empty()) {
        let (from, to) = pair
            .split_once(':')
            .ok_or_else(|| Error::Config(format!("owner map entry without ':': {pair}")))?;
        let from = from
            .trim()
            .parse::<u64>()
            .map_err(|_| Error::Config(format!("owner map id: {from}")))?;
        let to = to
            .trim()
            .parse::<u64>()
            .map_err(|_| Error::Config(format!("owner map id: {to}")))?;
        map.insert(from, to);
    }
    Ok(map)
}
