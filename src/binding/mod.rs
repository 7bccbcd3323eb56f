//! Cache-directory binding.
//!
//! Ties a cache directory to one mounted repository: an advisory lock file
//! guards against double mounts, a running sentinel detects unclean exits,
//! and a marker file protects against pointing the cache machinery at an
//! arbitrary directory.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{Error, Result};

pub const CACHE_MARKER: &str = "cvmfscache";

pub fn lock_file_name(fqrn: &str) -> String {
    format!("lock.{fqrn}")
}

pub fn running_sentinel_name(fqrn: &str) -> String {
    format!("running.{fqrn}")
}

pub fn no_nfs_maps_name(fqrn: &str) -> String {
    format!("no_nfs_maps.{fqrn}")
}

/// Identity of the process holding the mount lock, written into the lock
/// file for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MountRecord {
    pub mount_id: Uuid,
    pub fqrn: String,
    pub owner_pid: u32,
    pub owner_host: String,
    pub version: String,
    pub created_at: u64,
}

impl MountRecord {
    fn new(fqrn: &str) -> Self {
        Self {
            mount_id: Uuid::new_v4(),
            fqrn: fqrn.to_string(),
            owner_pid: std::process::id(),
            owner_host: hostname(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            created_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        }
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

/// Held for the lifetime of a mount; dropping releases the advisory lock.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    path: PathBuf,
    pub record: MountRecord,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

/// Single-mount guard: `lock.<fqrn>` under the cache directory, flocked
/// exclusively without blocking.
pub fn acquire_lock(cache_dir: &Path, fqrn: &str) -> Result<LockGuard> {
    let path = cache_dir.join(lock_file_name(fqrn));
    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&path)?;

    let locked = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if locked != 0 {
        let holder = fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str::<MountRecord>(&raw).ok())
            .map(|record| format!("pid {} on {}", record.owner_pid, record.owner_host))
            .unwrap_or_else(|| "unknown holder".to_string());
        return Err(Error::AlreadyMounted {
            fqrn: fqrn.to_string(),
            lock: holder,
        }
        .into());
    }

    let record = MountRecord::new(fqrn);
    file.set_len(0)?;
    file.write_all(serde_json::to_string_pretty(&record)?.as_bytes())?;
    file.flush()?;
    Ok(LockGuard { file, path, record })
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Presence sentinel; found at startup it means the previous exit was
/// unclean and the cache needs a rebuild scan.
#[derive(Debug)]
pub struct CrashSentinel {
    path: PathBuf,
}

impl CrashSentinel {
    /// Returns the sentinel plus whether an unclean previous exit was detected.
    pub fn engage(cache_dir: &Path, fqrn: &str) -> Result<(Self, bool)> {
        let path = cache_dir.join(running_sentinel_name(fqrn));
        let was_unclean = path.exists();
        if was_unclean {
            warn!(
                fqrn,
                "looks like the previous instance crashed, scheduling cache rebuild"
            );
        }
        File::create(&path)?;
        Ok((Self { path }, was_unclean))
    }
}

impl Drop for CrashSentinel {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), %err, "could not remove running sentinel");
        }
    }
}

/// Accept only empty directories or directories already marked as a cache;
/// anything else is refused before the shard layout touches it.
pub fn ensure_cache_marker(cache_dir: &Path) -> Result<()> {
    let marker = cache_dir.join(CACHE_MARKER);
    if marker.is_file() {
        return Ok(());
    }
    let occupied = fs::read_dir(cache_dir)?.next().is_some();
    if occupied {
        return Err(Error::InvalidCacheDir(format!(
            "{} is not empty and carries no {CACHE_MARKER} marker",
            cache_dir.display()
        ))
        .into());
    }
    File::create(&marker)?;
    info!(dir = %cache_dir.display(), "initialized cache directory");
    Ok(())
}

/// A cache once used without NFS maps must never silently switch: the maps
/// would miss all previously issued inodes.
pub fn check_nfs_maps_marker(cache_dir: &Path, fqrn: &str, nfs_source: bool) -> Result<()> {
    let marker = cache_dir.join(no_nfs_maps_name(fqrn));
    if nfs_source {
        if marker.exists() {
            return Err(Error::InvalidCacheDir(format!(
                "cache {} was used without NFS maps before; wipe it to enable CVMFS_NFS_SOURCE",
                cache_dir.display()
            ))
            .into());
        }
    } else if !marker.exists() {
        File::create(&marker)?;
    }
    Ok(())
}
