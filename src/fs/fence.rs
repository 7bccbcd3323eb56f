//! Readers/writer barrier between filesystem callbacks and the catalog swap.
//!
//! Ensures that within one callback all catalog operations observe the same
//! catalog revision. Provides exclusion only, no ordering between readers and
//! no fairness.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

const BACKOFF_SLEEP: Duration = Duration::from_millis(10);

#[derive(Debug, Default)]
pub struct RemountFence {
    readers: AtomicI64,
    blocking: AtomicBool,
}

impl RemountFence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait out a swap in progress, then register as reader. The counter is
    /// re-checked after incrementing so a reader can never linger once
    /// `block` has been observed.
    pub fn enter(&self) {
        loop {
            while self.blocking.load(Ordering::Acquire) {
                std::thread::sleep(BACKOFF_SLEEP);
            }
            self.readers.fetch_add(1, Ordering::AcqRel);
            if !self.blocking.load(Ordering::Acquire) {
                return;
            }
            self.readers.fetch_sub(1, Ordering::AcqRel);
        }
    }

    pub fn leave(&self) {
        let previous = self.readers.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "fence leave without enter");
    }

    /// Stop new readers and wait until the active ones drained.
    pub fn block(&self) {
        let _ = self
            .blocking
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire);
        while self.readers.load(Ordering::Acquire) > 0 {
            std::thread::sleep(BACKOFF_SLEEP);
        }
    }

    pub fn unblock(&self) {
        let _ = self
            .blocking
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire);
    }

    pub fn readers(&self) -> i64 {
        self.readers.load(Ordering::Acquire)
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking.load(Ordering::Acquire)
    }
}

/// RAII reader registration.
pub struct FenceGuard<'a> {
    fence: &'a RemountFence,
}

impl<'a> FenceGuard<'a> {
    pub fn new(fence: &'a RemountFence) -> Self {
        fence.enter();
        Self { fence }
    }
}

impl Drop for FenceGuard<'_> {
    fn drop(&mut self) {
        self.fence.leave();
    }
}
