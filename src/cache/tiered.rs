//! Two-layer cache: a fast upper layer backed by a large, possibly shared
//! lower layer.

use std::sync::Arc;

use tracing::warn;

use super::{
    CacheError, CacheManager, CacheResult, CacheState, CacheTransaction, ObjectHandle, ObjectInfo,
};
use crate::hash::ContentHash;

const COPY_BUFFER_SIZE: usize = 64 * 1024;

pub struct TieredCacheManager {
    upper: Arc<dyn CacheManager>,
    lower: Arc<dyn CacheManager>,
    lower_readonly: bool,
}

impl TieredCacheManager {
    /// The tiered cache borrows the upper layer's quota manager; it never
    /// owns one of its own.
    pub fn new(upper: Arc<dyn CacheManager>, lower: Arc<dyn CacheManager>) -> Self {
        let lower_readonly = lower.readonly();
        Self {
            upper,
            lower,
            lower_readonly,
        }
    }

    /// Lower cache hit on an upper miss: stream the object into an upper
    /// transaction. Any failure surfaces the original upper miss, never a
    /// half-populated handle.
    fn populate_upper(&self, id: &ContentHash, lower_handle: ObjectHandle) -> Option<ObjectHandle> {
        let size = lower_handle.size();
        let mut txn = self.upper.start_txn(id, size).ok()?;
        txn.ctrl(&ObjectInfo::new(format!("populated from lower: {id}")));

        let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
        let mut offset = 0u64;
        while offset < size {
            let want = std::cmp::min(COPY_BUFFER_SIZE as u64, size - offset) as usize;
            let got = lower_handle.pread_full(&mut buffer[..want], offset).ok()?;
            if got != want {
                let _ = txn.abort();
                return None;
            }
            if txn.write(&buffer[..want]).is_err() {
                let _ = txn.abort();
                return None;
            }
            offset += want as u64;
        }

        // The handle is acquired before commit; commit failure invalidates it.
        let handle = match txn.open_from_txn() {
            Ok(handle) => handle,
            Err(_) => {
                let _ = txn.abort();
                return None;
            }
        };
        txn.commit().ok()?;
        Some(handle)
    }
}

impl CacheManager for TieredCacheManager {
    fn open(&self, id: &ContentHash) -> CacheResult<ObjectHandle> {
        match self.upper.open(id) {
            Ok(handle) => Ok(handle),
            Err(CacheError::NotFound) => match self.lower.open(id) {
                Ok(lower_handle) => self
                    .populate_upper(id, lower_handle)
                    .ok_or(CacheError::NotFound),
                Err(_) => Err(CacheError::NotFound),
            },
            Err(err) => Err(err),
        }
    }

    fn start_txn(&self, id: &ContentHash, size: u64) -> CacheResult<Box<dyn CacheTransaction>> {
        let upper_txn = self.upper.start_txn(id, size)?;
        let lower_txn = if self.lower_readonly {
            None
        } else {
            match self.lower.start_txn(id, size) {
                Ok(txn) => Some(txn),
                Err(err) => {
                    let _ = upper_txn.abort();
                    return Err(err);
                }
            }
        };
        Ok(Box::new(TieredTransaction {
            upper: Some(upper_txn),
            lower: lower_txn,
        }))
    }

    fn describe(&self) -> String {
        format!(
            "tiered cache\n  - upper layer: {}\n  - lower layer: {}",
            self.upper.describe(),
            self.lower.describe()
        )
    }

    fn quota(&self) -> Option<Arc<dyn super::QuotaManager>> {
        self.upper.quota()
    }

    fn save_state(&self) -> CacheState {
        Box::new((self.upper.save_state(), self.lower.save_state()))
    }

    fn restore_state(&self, state: CacheState) {
        if let Ok(pair) = state.downcast::<(CacheState, CacheState)>() {
            let (upper_state, lower_state) = *pair;
            self.upper.restore_state(upper_state);
            self.lower.restore_state(lower_state);
        }
    }
}

/// Owned pair of layer transactions; the write path duplicates in place.
struct TieredTransaction {
    upper: Option<Box<dyn CacheTransaction>>,
    lower: Option<Box<dyn CacheTransaction>>,
}

impl TieredTransaction {
    fn upper(&mut self) -> &mut Box<dyn CacheTransaction> {
        self.upper.as_mut().expect("upper transaction live")
    }
}

impl CacheTransaction for TieredTransaction {
    fn ctrl(&mut self, info: &ObjectInfo) {
        self.upper().ctrl(info);
        if let Some(lower) = self.lower.as_mut() {
            lower.ctrl(info);
        }
    }

    fn write(&mut self, buf: &[u8]) -> CacheResult<usize> {
        let written = self.upper().write(buf)?;
        if let Some(lower) = self.lower.as_mut() {
            lower.write(buf)?;
        }
        Ok(written)
    }

    fn reset(&mut self) -> CacheResult<()> {
        let upper_result = self.upper().reset();
        let lower_result = match self.lower.as_mut() {
            Some(lower) => lower.reset(),
            None => Ok(()),
        };
        upper_result.and(lower_result)
    }

    fn open_from_txn(&mut self) -> CacheResult<ObjectHandle> {
        self.upper().open_from_txn()
    }

    /// Success tracks the upper layer: it may have already handed out a
    /// handle via `open_from_txn`, so a lower-layer failure only warns.
    fn commit(mut self: Box<Self>) -> CacheResult<()> {
        let upper_result = self.upper.take().expect("upper transaction live").commit();
        if let Some(lower) = self.lower.take() {
            let lower_result = lower.commit();
            if upper_result.is_ok() {
                if let Err(err) = lower_result {
                    warn!(%err, "commit failed in lower cache but succeeded in upper cache");
                }
            }
        }
        upper_result
    }

    fn abort(mut self: Box<Self>) -> CacheResult<()> {
        let upper_result = self.upper.take().expect("upper transaction live").abort();
        let lower_result = match self.lower.take() {
            Some(lower) => lower.abort(),
            None => Ok(()),
        };
        upper_result.and(lower_result)
    }
}
