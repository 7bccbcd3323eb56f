//! Download-into-cache path.
//!
//! Objects travel zlib-deflated; the fetcher inflates them into a cache
//! transaction while hashing, verifies the content hash and commits. Catalogs
//! go through the same path and are then opened from their location in the
//! upper cache directory.

use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use flate2::read::ZlibDecoder;
use tracing::{debug, warn};

use super::{CacheError, CacheManager, CacheResult, ObjectInfo, PosixCacheManager, SIZE_UNKNOWN};
use crate::catalog::manager::CatalogSource;
use crate::download::{Downloader, SignatureVerifier, TransferCounters};
use crate::hash::{ContentHash, ContentHasher, ObjectSuffix};
use crate::manifest::{self, Manifest};

const INFLATE_BUFFER_SIZE: usize = 64 * 1024;

pub struct ObjectFetcher {
    cache: Arc<dyn CacheManager>,
    /// The layer catalogs are opened from by path; also hosts download scratch.
    store: Arc<PosixCacheManager>,
    downloader: Arc<dyn Downloader>,
    verifier: Arc<dyn SignatureVerifier>,
    counters: Arc<TransferCounters>,
    fqrn: String,
}

impl ObjectFetcher {
    pub fn new(
        cache: Arc<dyn CacheManager>,
        store: Arc<PosixCacheManager>,
        downloader: Arc<dyn Downloader>,
        verifier: Arc<dyn SignatureVerifier>,
        fqrn: &str,
    ) -> Self {
        Self {
            cache,
            store,
            downloader,
            verifier,
            counters: Arc::new(TransferCounters::default()),
            fqrn: fqrn.to_string(),
        }
    }

    pub fn counters(&self) -> Arc<TransferCounters> {
        Arc::clone(&self.counters)
    }

    pub fn cache(&self) -> &Arc<dyn CacheManager> {
        &self.cache
    }

    /// Open from cache, downloading on a miss. The returned handle reads the
    /// decompressed, verified object.
    pub fn fetch_object(
        &self,
        id: &ContentHash,
        description: &str,
        suffix: ObjectSuffix,
    ) -> CacheResult<super::ObjectHandle> {
        match self.cache.open(id) {
            Ok(handle) => return Ok(handle),
            Err(CacheError::NotFound) => {}
            Err(err) => return Err(err),
        }

        let scratch = self
            .store
            .dir()
            .join(super::posix::TXN_DIR)
            .join(format!("download.{}.{}", std::process::id(), id.to_hex()));
        let started = Instant::now();
        self.downloader
            .fetch(&id.url_path(suffix), &scratch)
            .map_err(|err| CacheError::Transfer(err.to_string()))?;

        let result = self.inflate_into_cache(id, description, &scratch);
        let downloaded = std::fs::metadata(&scratch).map(|m| m.len()).unwrap_or(0);
        let _ = std::fs::remove_file(&scratch);
        self.counters
            .account(downloaded, started.elapsed().as_millis() as u64);
        result?;

        self.cache.open(id)
    }

    fn inflate_into_cache(
        &self,
        id: &ContentHash,
        description: &str,
        compressed: &PathBuf,
    ) -> CacheResult<()> {
        let mut txn = self.cache.start_txn(id, SIZE_UNKNOWN)?;
        txn.ctrl(&ObjectInfo::new(description));

        let mut decoder = ZlibDecoder::new(File::open(compressed)?);
        let mut hasher = ContentHasher::new();
        let mut buffer = vec![0u8; INFLATE_BUFFER_SIZE];
        loop {
            let n = decoder
                .read(&mut buffer)
                .map_err(|err| CacheError::Corrupted(format!("inflate {id}: {err}")))?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
            txn.write(&buffer[..n])?;
        }

        let actual = hasher.finalize();
        if actual != *id {
            warn!(expected = %id, got = %actual, "downloaded object fails hash verification");
            let _ = txn.abort();
            return Err(CacheError::Corrupted(format!(
                "hash mismatch: expected {id}, got {actual}"
            )));
        }
        txn.commit()?;
        debug!(id = %id, "object fetched and committed");
        Ok(())
    }
}

impl CatalogSource for ObjectFetcher {
    /// Catalogs are regular objects; once present in the upper layer they are
    /// opened directly from their sharded path.
    fn fetch_catalog(&self, hash: &ContentHash) -> crate::Result<PathBuf> {
        let handle = self.fetch_object(hash, &format!("file catalog {hash}"), ObjectSuffix::Catalog)?;
        drop(handle);
        Ok(self.store.object_path(hash))
    }

    fn fetch_manifest(&self) -> crate::Result<Manifest> {
        manifest::fetch_manifest(
            self.downloader.as_ref(),
            self.verifier.as_ref(),
            &self.counters,
            &self.fqrn,
            &self.store.dir().join(super::posix::TXN_DIR),
        )
    }
}
