//! # Engine - partition data storage
//!
//! A [`Datadb`] owns the parts of one partition: in-memory parts created by
//! ingestion and file parts stored as subdirectories of the partition
//! directory. Background workers keep the number of parts low by merging
//! them, and a flusher moves in-memory data to disk once it gets old.
//!
//! ## Architecture
//!
//! ```text
//! must_add_rows(LogRows)
//!   |
//!   v
//! ┌──────────────────────────────────────────────────────┐
//! │                      DATADB                          │
//! │                                                      │
//! │  encode rows → new in-memory part                    │
//! │        |                                             │
//! │        |  (> 15 in-memory parts?)   → merge worker   │
//! │        |  (> 20 in-memory parts?)   → caller waits   │
//! │        v                                             │
//! │  inmemory_parts ──merge──> in-memory part            │
//! │        |                   or file part              │
//! │        |  (flush deadline passed?)                   │
//! │        v                                             │
//! │  flusher ──final merge──> file_parts + parts.json    │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Responsibilities
//!
//! | Module          | Purpose                                                |
//! |-----------------|--------------------------------------------------------|
//! | [`lib.rs`]      | `Datadb`, open, ingestion, stats, shutdown             |
//! | [`recovery`]    | tmp dir cleanup, reconciling `parts.json` with disk    |
//! | [`merge`]       | merge workers, `merge_parts`, swapping parts           |
//! | [`flusher`]     | flushing in-memory parts past their deadline           |
//! | [`selection`]   | choosing the parts of a merge                          |
//! | [`part_wrapper`]| reference counting and deferred part removal           |
//! | [`disk`]        | disk space reservations, process-wide merge limit      |
//! | [`manifest`]    | `parts.json` (atomic file ops)                         |
//!
//! ## Crash Safety
//!
//! File parts are written into `<name>.tmp`, fsynced and renamed into place.
//! A part only becomes live once `parts.json` lists it, and a replaced part
//! is only deleted after `parts.json` stopped listing it. On open, tmp
//! directories and directories missing from `parts.json` are removed.
mod disk;
mod error;
mod flusher;
mod manifest;
mod merge;
mod part_wrapper;
mod recovery;
mod selection;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use config::{DatadbConfig, MAX_INMEMORY_PARTS_PER_PARTITION};
use part::{InmemoryPart, LogRows, Part};
use tracing::{debug, info};

pub use error::MergeError;
pub use manifest::PARTS_FILENAME;
pub use part_wrapper::{PartRef, PartWrapper};
pub use selection::{append_parts_to_merge, MergeCandidate, MAX_PARTS_TO_MERGE};

use manifest::Manifest;

/// How long a caller held back by too many in-memory parts sleeps between
/// checks.
const BACKPRESSURE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Counters and totals of one partition, see [`Datadb::update_stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatadbStats {
    pub inmemory_merges_total: u64,
    pub inmemory_active_merges: u64,
    pub file_merges_total: u64,
    pub file_active_merges: u64,

    pub inmemory_rows_count: u64,
    pub file_rows_count: u64,
    pub inmemory_parts: u64,
    pub file_parts: u64,
    pub inmemory_blocks: u64,
    pub file_blocks: u64,
    pub compressed_inmemory_size: u64,
    pub compressed_file_size: u64,
    pub uncompressed_inmemory_size: u64,
    pub uncompressed_file_size: u64,

    /// Parts that are inputs of a running merge.
    pub parts_in_merge: u64,
}

impl DatadbStats {
    #[must_use]
    pub fn rows_count(&self) -> u64 {
        self.inmemory_rows_count + self.file_rows_count
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Part lists and worker bookkeeping, guarded by the partition lock.
pub(crate) struct PartsState {
    pub(crate) inmemory_parts: Vec<Arc<PartWrapper>>,
    pub(crate) file_parts: Vec<Arc<PartWrapper>>,
    pub(crate) manifest: Manifest,
    pub(crate) merge_workers_count: usize,
    pub(crate) flusher_running: bool,
    /// Handles of started workers and the flusher, joined on close.
    pub(crate) background: Vec<JoinHandle<()>>,
}

pub(crate) struct Inner {
    pub(crate) path: PathBuf,
    pub(crate) config: DatadbConfig,
    pub(crate) parts: Mutex<PartsState>,
    /// Notified when parts are swapped and when the partition stops.
    pub(crate) parts_changed: Condvar,
    pub(crate) stop: AtomicBool,
    /// Source of part directory names.
    pub(crate) merge_idx: AtomicU64,

    pub(crate) inmemory_merges_total: AtomicU64,
    pub(crate) inmemory_active_merges: AtomicU64,
    pub(crate) file_merges_total: AtomicU64,
    pub(crate) file_active_merges: AtomicU64,
}

impl Inner {
    pub(crate) fn lock_parts(&self) -> MutexGuard<'_, PartsState> {
        self.parts.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

/// Storage of one partition: in-memory and file parts plus the background
/// tasks that merge and flush them.
///
/// # Ingestion
///
/// [`must_add_rows`](Datadb::must_add_rows) encodes a batch into a new
/// in-memory part. Past 15 in-memory parts a merge worker is started; past
/// 20 the caller waits until merges bring the count back down.
///
/// # Durability
///
/// In-memory parts are flushed to disk once older than the configured flush
/// interval, on [`debug_flush`](Datadb::debug_flush), and on close.
///
/// # Shutdown
///
/// [`close`](Datadb::close) (or drop) stops the workers, flushes all
/// in-memory parts and releases the file parts. Outstanding [`PartRef`]s at
/// that point are a bug.
pub struct Datadb {
    inner: Arc<Inner>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Datadb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock_parts();
        f.debug_struct("Datadb")
            .field("path", &self.inner.path)
            .field("inmemory_parts", &state.inmemory_parts.len())
            .field("file_parts", &state.file_parts.len())
            .field("merge_workers", &state.merge_workers_count)
            .field("flusher_running", &state.flusher_running)
            .finish()
    }
}

impl Datadb {
    /// Opens the partition stored in `path`, creating it if needed.
    ///
    /// # Recovery Steps
    ///
    /// 1. Create the directory if it does not exist.
    /// 2. Remove `*.tmp` directories left by interrupted merges.
    /// 3. Load `parts.json` (or create an empty one).
    /// 4. Remove part directories not listed in `parts.json`.
    /// 5. Open every listed part; a missing one fails the open.
    /// 6. Start merge workers if the previous run left several parts.
    pub fn open<P: AsRef<Path>>(path: P, config: DatadbConfig) -> Result<Self> {
        config.validate()?;
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)
            .with_context(|| format!("cannot create partition dir {}", path.display()))?;

        recovery::remove_tmp_dirs(&path)?;
        let manifest = Manifest::load_or_create(&path)?;
        if !path.join(PARTS_FILENAME).exists() {
            manifest.save()?;
        }
        recovery::remove_unlisted_dirs(&path, &manifest)?;
        let file_parts = recovery::open_file_parts(&path, &manifest)?;
        let merge_idx = recovery::initial_merge_idx(&manifest)?;

        let inner = Arc::new(Inner {
            path,
            config,
            parts: Mutex::new(PartsState {
                inmemory_parts: Vec::new(),
                file_parts,
                manifest,
                merge_workers_count: 0,
                flusher_running: false,
                background: Vec::new(),
            }),
            parts_changed: Condvar::new(),
            stop: AtomicBool::new(false),
            merge_idx: AtomicU64::new(merge_idx),
            inmemory_merges_total: AtomicU64::new(0),
            inmemory_active_merges: AtomicU64::new(0),
            file_merges_total: AtomicU64::new(0),
            file_active_merges: AtomicU64::new(0),
        });

        {
            let mut state = inner.lock_parts();
            info!(
                path = %inner.path.display(),
                file_parts = state.file_parts.len(),
                "opened partition"
            );
            // Parts left unmerged by the previous run.
            if state.file_parts.len() > 1 {
                for _ in 0..inner.config.merge_workers {
                    inner.start_merge_worker_locked(&mut state);
                }
            }
        }

        Ok(Self {
            inner,
            closed: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    #[must_use]
    pub fn config(&self) -> &DatadbConfig {
        &self.inner.config
    }

    /// Adds `lr` as a new in-memory part and resets it. Blocks while the
    /// partition holds more than 20 in-memory parts.
    pub fn must_add_rows(&self, lr: &mut LogRows) {
        if lr.is_empty() {
            return;
        }
        let mp = match InmemoryPart::from_log_rows(lr, self.inner.config.format_version) {
            Ok(mp) => mp,
            Err(e) => panic!("BUG: cannot encode {} rows: {:#}", lr.len(), e),
        };
        lr.reset();
        let part = match Part::open_inmemory(Arc::new(mp)) {
            Ok(p) => p,
            Err(e) => panic!("BUG: cannot open freshly encoded part: {:#}", e),
        };
        let flush_deadline = Instant::now() + self.inner.config.flush_interval;
        let pw = PartWrapper::new(part, Some(flush_deadline));

        let mut state = self.inner.lock_parts();
        state.inmemory_parts.push(pw);
        self.inner.start_flusher_locked(&mut state);
        if state.inmemory_parts.len() > MAX_PARTS_TO_MERGE {
            self.inner.start_merge_worker_locked(&mut state);
        }
        while state.inmemory_parts.len() as u64 > MAX_INMEMORY_PARTS_PER_PARTITION
            && !self.inner.is_stopping()
        {
            debug!(
                inmemory_parts = state.inmemory_parts.len(),
                "waiting for in-memory parts to be merged"
            );
            self.inner.start_merge_worker_locked(&mut state);
            state = match self
                .inner
                .parts_changed
                .wait_timeout(state, BACKPRESSURE_POLL_INTERVAL)
            {
                Ok((s, _)) => s,
                Err(e) => e.into_inner().0,
            };
        }
    }

    /// Flushes all in-memory parts that aren't being merged to disk now.
    pub fn debug_flush(&self) {
        self.inner.flush_inmemory_parts_to_disk();
    }

    /// Takes a reference to every live part. The parts stay readable (and
    /// on disk) until the references are dropped, even if merges replace
    /// them meanwhile.
    #[must_use]
    pub fn acquire_parts(&self) -> Vec<PartRef> {
        let state = self.inner.lock_parts();
        state
            .file_parts
            .iter()
            .chain(&state.inmemory_parts)
            .map(PartRef::acquire)
            .collect()
    }

    /// Adds the partition's counters to `s`.
    pub fn update_stats(&self, s: &mut DatadbStats) {
        let inner = &self.inner;
        s.inmemory_merges_total += inner.inmemory_merges_total.load(Ordering::Relaxed);
        s.inmemory_active_merges += inner.inmemory_active_merges.load(Ordering::Relaxed);
        s.file_merges_total += inner.file_merges_total.load(Ordering::Relaxed);
        s.file_active_merges += inner.file_active_merges.load(Ordering::Relaxed);

        let state = inner.lock_parts();
        for (pw, inmemory) in state
            .inmemory_parts
            .iter()
            .map(|pw| (pw, true))
            .chain(state.file_parts.iter().map(|pw| (pw, false)))
        {
            let ph = pw.header();
            let (rows, parts, blocks, compressed, uncompressed) = if inmemory {
                (
                    &mut s.inmemory_rows_count,
                    &mut s.inmemory_parts,
                    &mut s.inmemory_blocks,
                    &mut s.compressed_inmemory_size,
                    &mut s.uncompressed_inmemory_size,
                )
            } else {
                (
                    &mut s.file_rows_count,
                    &mut s.file_parts,
                    &mut s.file_blocks,
                    &mut s.compressed_file_size,
                    &mut s.uncompressed_file_size,
                )
            };
            *rows += ph.rows_count;
            *parts += 1;
            *blocks += ph.blocks_count;
            *compressed += ph.compressed_size_bytes;
            *uncompressed += ph.uncompressed_size_bytes;
            if pw.is_in_merge() {
                s.parts_in_merge += 1;
            }
        }
    }

    #[must_use]
    pub fn stats(&self) -> DatadbStats {
        let mut s = DatadbStats::default();
        self.update_stats(&mut s);
        s
    }

    /// Stops background work, flushes in-memory parts and releases all
    /// parts.
    pub fn close(self) {
        self.shutdown();
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = &self.inner;

        // Set under the lock so no worker starts after the handles are taken.
        let handles = {
            let mut state = inner.lock_parts();
            inner.stop.store(true, Ordering::Release);
            std::mem::take(&mut state.background)
        };
        inner.parts_changed.notify_all();
        for h in handles {
            if let Err(e) = h.join() {
                std::panic::resume_unwind(e);
            }
        }

        inner.flush_inmemory_parts_to_disk();

        let mut state = inner.lock_parts();
        assert!(
            state.inmemory_parts.is_empty(),
            "BUG: {} in-memory parts remain after the final flush",
            state.inmemory_parts.len()
        );
        for pw in state.file_parts.drain(..) {
            pw.dec_ref();
            let n = pw.ref_count();
            assert_eq!(n, 0, "BUG: there are {} references to part {:?}", n, pw.part());
        }
        info!(path = %inner.path.display(), "closed partition");
    }
}

impl Drop for Datadb {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests;
