//! Transfer seams.
//!
//! The HTTP engine lives outside this crate; the runtime talks to it through
//! the [`Downloader`] trait. [`DirectoryMirror`] serves repositories from a
//! local directory tree laid out like the web server would be, which is what
//! the CLI uses for `file:` sources and what the tests mount.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("object not found on server: {0}")]
    NotFound(String),
    #[error("host unreachable: {0}")]
    HostUnreachable(String),
    #[error("transfer failed: {0}")]
    Transfer(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type DownloadResult<T> = std::result::Result<T, DownloadError>;

/// Fetches a repository-relative URL path into a local file.
pub trait Downloader: Send + Sync {
    /// `url_path` is relative to the repository root, e.g. `/.cvmfspublished`
    /// or `/data/ab/cdef...C`. The destination file is created or truncated.
    fn fetch(&self, url_path: &str, destination: &Path) -> DownloadResult<()>;

    /// Configured effective endpoint, for diagnostics.
    fn endpoint(&self) -> String;
}

/// Validates a signed manifest blob. Real cryptography lives outside this
/// crate; implementations get the manifest text and the repository name.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, fqrn: &str, manifest_text: &str) -> bool;
}

/// Accepts every manifest; the stand-in wired up when signature checking is
/// disabled or delegated.
#[derive(Debug, Default)]
pub struct PermissiveVerifier;

impl SignatureVerifier for PermissiveVerifier {
    fn verify(&self, _fqrn: &str, _manifest_text: &str) -> bool {
        true
    }
}

/// Transfer counters shared with the statistics surface.
#[derive(Debug, Default)]
pub struct TransferCounters {
    pub num_downloads: AtomicU64,
    pub bytes: AtomicU64,
    pub millis: AtomicU64,
}

impl TransferCounters {
    pub fn account(&self, bytes: u64, elapsed_ms: u64) {
        self.num_downloads.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
        self.millis.fetch_add(elapsed_ms, Ordering::Relaxed);
    }
}

/// Serves a repository from a local directory with the server layout
/// (`.cvmfspublished` at the root, objects under `data/`).
#[derive(Debug)]
pub struct DirectoryMirror {
    root: PathBuf,
}

impl DirectoryMirror {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }
}

impl Downloader for DirectoryMirror {
    fn fetch(&self, url_path: &str, destination: &Path) -> DownloadResult<()> {
        let relative = url_path.trim_start_matches('/');
        let source = self.root.join(relative);
        if !self.root.is_dir() {
            return Err(DownloadError::HostUnreachable(
                self.root.display().to_string(),
            ));
        }
        if !source.is_file() {
            return Err(DownloadError::NotFound(url_path.to_string()));
        }
        fs::copy(&source, destination)?;
        Ok(())
    }

    fn endpoint(&self) -> String {
        format!("file://{}", self.root.display())
    }
}
