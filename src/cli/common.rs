//! Shared plumbing for the repository-facing subcommands.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;

use crate::cache::UnmanagedQuota;
use crate::config::Settings;
use crate::download::{DirectoryMirror, PermissiveVerifier};
use crate::fs::MountState;
use crate::{Error, Result};

#[derive(Debug, Clone, Args)]
pub struct RepoArgs {
    /// Fully qualified repository name, e.g. demo.example.org
    #[arg(long = "repo")]
    pub fqrn: String,

    /// Repository source; currently `file://` directory mirrors (overrides
    /// CVMFS_SERVER_URL)
    #[arg(long = "server")]
    pub server: Option<String>,

    /// Cache base directory (overrides CVMFS_CACHE_BASE)
    #[arg(long = "cache")]
    pub cache_base: Option<PathBuf>,

    /// Pin the mounted root catalog (overrides CVMFS_ROOT_HASH)
    #[arg(long = "root-hash")]
    pub root_hash: Option<String>,
}

/// Compose settings from the environment plus command-line overrides, then
/// bring up a full mount state (catalog tree, caches, sentinels) without a
/// kernel attached.
pub fn build_mount_state(args: &RepoArgs) -> Result<MountState> {
    let mut options: HashMap<String, String> = std::env::vars()
        .filter(|(key, _)| key.starts_with("CVMFS_"))
        .collect();
    if let Some(server) = &args.server {
        options.insert("CVMFS_SERVER_URL".into(), server.clone());
    }
    if let Some(cache) = &args.cache_base {
        options.insert("CVMFS_CACHE_BASE".into(), cache.display().to_string());
    }
    if let Some(root_hash) = &args.root_hash {
        options.insert("CVMFS_ROOT_HASH".into(), root_hash.clone());
    }
    let settings = Settings::from_map(&args.fqrn, &options)?;

    let mirror_root = settings
        .server_url
        .strip_prefix("file://")
        .map(str::to_string)
        .or_else(|| {
            (!settings.server_url.contains("://")).then(|| settings.server_url.clone())
        })
        .ok_or_else(|| {
            Error::Cli(format!(
                "unsupported server source {} (the command-line tools speak file:// only; \
                 HTTP transports plug in through the mount library)",
                settings.server_url
            ))
        })?;

    MountState::create(
        settings,
        Arc::new(DirectoryMirror::new(mirror_root)),
        Arc::new(PermissiveVerifier),
        Arc::new(UnmanagedQuota),
    )
}

/// Normalize a user-supplied in-repository path: absolute, no trailing slash,
/// "" is the root.
pub fn normalize_repo_path(raw: &str) -> String {
    let trimmed = raw.trim_end_matches('/');
    if trimmed.is_empty() || trimmed == "/" {
        return String::new();
    }
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}
