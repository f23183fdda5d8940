//! Process-wide admission control for merges: reserved disk space and the
//! cap on concurrently running merge workers.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, OnceLock};

use tracing::warn;

/// Bytes promised to file merges that are still running.
static RESERVED_DISK_SPACE: AtomicU64 = AtomicU64::new(0);

static MERGE_LIMITER: OnceLock<MergeLimiter> = OnceLock::new();

/// Free bytes on the filesystem holding `path`. A failed query counts as a
/// full disk.
pub(crate) fn free_space(path: &Path) -> u64 {
    match fs2::available_space(path) {
        Ok(n) => n,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot query free disk space");
            0
        }
    }
}

/// Free space minus what running merges reserved and the configured floor.
pub(crate) fn available_disk_space(path: &Path, min_free: u64) -> u64 {
    free_space(path)
        .saturating_sub(RESERVED_DISK_SPACE.load(Ordering::Acquire))
        .saturating_sub(min_free)
}

pub(crate) fn reserved_disk_space() -> u64 {
    RESERVED_DISK_SPACE.load(Ordering::Acquire)
}

/// Space held for one merge; returned on drop.
#[derive(Debug)]
pub(crate) struct DiskReservation {
    bytes: u64,
}

impl DiskReservation {
    /// Reserves `bytes` if they fit into the free space of `path` after all
    /// other reservations and `min_free`. Returns the available amount on
    /// failure.
    pub(crate) fn try_reserve(path: &Path, bytes: u64, min_free: u64) -> Result<Self, u64> {
        let free = free_space(path).saturating_sub(min_free);
        let mut reserved = RESERVED_DISK_SPACE.load(Ordering::Acquire);
        loop {
            let total = reserved.saturating_add(bytes);
            if total > free {
                return Err(free.saturating_sub(reserved));
            }
            match RESERVED_DISK_SPACE.compare_exchange_weak(
                reserved,
                total,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(Self { bytes }),
                Err(current) => reserved = current,
            }
        }
    }
}

impl Drop for DiskReservation {
    fn drop(&mut self) {
        RESERVED_DISK_SPACE.fetch_sub(self.bytes, Ordering::AcqRel);
    }
}

/// Counting semaphore shared by all partitions of the process.
#[derive(Debug)]
pub(crate) struct MergeLimiter {
    running: Mutex<usize>,
    freed: Condvar,
    limit: usize,
}

impl MergeLimiter {
    /// The process-wide limiter. Its size is fixed by the first caller.
    pub(crate) fn global(limit: usize) -> &'static MergeLimiter {
        MERGE_LIMITER.get_or_init(|| MergeLimiter::new(limit))
    }

    pub(crate) fn new(limit: usize) -> Self {
        Self {
            running: Mutex::new(0),
            freed: Condvar::new(),
            limit: limit.max(1),
        }
    }

    /// Merges holding a permit right now.
    pub(crate) fn running(&self) -> usize {
        *self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Blocks until a slot is free.
    pub(crate) fn acquire(&self) -> MergePermit<'_> {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        while *running >= self.limit {
            running = self.freed.wait(running).unwrap_or_else(|e| e.into_inner());
        }
        *running += 1;
        MergePermit { limiter: self }
    }
}

#[derive(Debug)]
pub(crate) struct MergePermit<'a> {
    limiter: &'a MergeLimiter,
}

impl Drop for MergePermit<'_> {
    fn drop(&mut self) {
        let mut running = self
            .limiter
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *running -= 1;
        self.limiter.freed.notify_one();
    }
}
