//! Reference-counted handles to opened parts.
//!
//! The partition's part list owns one reference to every part it lists.
//! Merges and readers take extra references for as long as they use a part.
//! When a merge replaces a part, the part is flagged `must_drop` and the
//! list's reference is released; the directory of a file part is removed
//! by whichever release brings the count to zero.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use anyhow::{Context, Result};
use part::{Part, PartHeader};
use tracing::debug;

pub struct PartWrapper {
    part: Part,
    ref_count: AtomicU64,
    must_drop: AtomicBool,
    /// Set while the part is an input of a running merge. Only changed
    /// under the partition lock.
    is_in_merge: AtomicBool,
    /// When an in-memory part must be on disk at the latest.
    flush_deadline: Option<Instant>,
    applied_seq: AtomicU64,
    /// Serializes applied seq updates and holds the part that replaced this
    /// one, so updates racing a merge reach the merged part.
    seq_state: Mutex<SeqState>,
}

#[derive(Default)]
struct SeqState {
    merged_into: Option<Arc<PartWrapper>>,
}

impl PartWrapper {
    /// Wraps `part` with a single reference, owned by the part list.
    pub(crate) fn new(part: Part, flush_deadline: Option<Instant>) -> Arc<Self> {
        let applied_seq = part.header().applied_seq;
        Arc::new(Self {
            part,
            ref_count: AtomicU64::new(1),
            must_drop: AtomicBool::new(false),
            is_in_merge: AtomicBool::new(false),
            flush_deadline,
            applied_seq: AtomicU64::new(applied_seq),
            seq_state: Mutex::new(SeqState::default()),
        })
    }

    #[must_use]
    pub fn part(&self) -> &Part {
        &self.part
    }

    #[must_use]
    pub fn header(&self) -> &PartHeader {
        self.part.header()
    }

    #[must_use]
    pub fn is_inmemory(&self) -> bool {
        self.part.is_inmemory()
    }

    #[must_use]
    pub fn ref_count(&self) -> u64 {
        self.ref_count.load(Ordering::Acquire)
    }

    pub(crate) fn flush_deadline(&self) -> Option<Instant> {
        self.flush_deadline
    }

    pub(crate) fn is_in_merge(&self) -> bool {
        self.is_in_merge.load(Ordering::Relaxed)
    }

    pub(crate) fn set_in_merge(&self, in_merge: bool) {
        let prev = self.is_in_merge.swap(in_merge, Ordering::Relaxed);
        assert_ne!(
            prev, in_merge,
            "BUG: is_in_merge is already {} for part {:?}",
            in_merge, self.part
        );
    }

    pub(crate) fn set_must_drop(&self) {
        self.must_drop.store(true, Ordering::Release);
    }

    pub(crate) fn inc_ref(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Takes a reference unless the part was already released for good.
    fn try_inc_ref(&self) -> bool {
        let mut cur = self.ref_count.load(Ordering::Acquire);
        while cur > 0 {
            match self.ref_count.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
        false
    }

    /// Releases one reference. The last release of a part flagged
    /// `must_drop` removes its directory.
    pub(crate) fn dec_ref(&self) {
        let prev = self.ref_count.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "BUG: negative reference count for part {:?}", self.part);
        if prev > 1 || !self.must_drop.load(Ordering::Acquire) {
            return;
        }
        if let Some(path) = self.part.path() {
            debug!(path = %path.display(), "removing dropped part");
            if let Err(e) = std::fs::remove_dir_all(path) {
                panic!("FATAL: cannot remove part {}: {}", path.display(), e);
            }
            if let Some(parent) = path.parent() {
                part::sync_dir(parent);
            }
        }
    }

    /// Delete-task progress recorded for this part.
    #[must_use]
    pub fn applied_seq(&self) -> u64 {
        self.applied_seq.load(Ordering::Acquire)
    }

    fn lock_seq_state(&self) -> MutexGuard<'_, SeqState> {
        self.seq_state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Raises the applied sequence of the part to `seq`. Lower values are
    /// ignored. File parts persist the new value in their metadata. Once the
    /// part was merged, the part that replaced it is raised too.
    ///
    /// The caller must hold a reference to the part.
    pub fn advance_applied_seq(&self, seq: u64) -> Result<()> {
        self.advance(seq, true)
    }

    fn advance(&self, seq: u64, may_persist: bool) -> Result<()> {
        let successor = {
            let state = self.lock_seq_state();
            let prev = self.applied_seq.fetch_max(seq, Ordering::AcqRel);
            if prev < seq && may_persist {
                self.persist_applied_seq(seq)?;
            }
            state.merged_into.clone()
        };
        let Some(next) = successor else {
            return Ok(());
        };
        // A released successor has no directory left to persist into.
        let pinned = next.try_inc_ref();
        let res = next.advance(seq, pinned);
        if pinned {
            next.dec_ref();
        }
        res
    }

    /// Records `next` as the part replacing this one and returns the applied
    /// sequence it must carry over. Later advances are forwarded to `next`.
    pub(crate) fn link_merged_into(&self, next: &Arc<PartWrapper>) -> u64 {
        let mut state = self.lock_seq_state();
        state.merged_into = Some(Arc::clone(next));
        self.applied_seq()
    }

    /// Must be called with `seq_state` held, so writes land in seq order.
    fn persist_applied_seq(&self, seq: u64) -> Result<()> {
        // A replaced part may already be gone from disk; its successor
        // persists the value instead.
        if self.must_drop.load(Ordering::Acquire) {
            return Ok(());
        }
        if let Some(path) = self.part.path() {
            let header = PartHeader {
                applied_seq: seq,
                ..self.part.header().clone()
            };
            header
                .write_to_dir(path)
                .with_context(|| format!("cannot persist applied seq of {}", path.display()))?;
        }
        Ok(())
    }
}

impl fmt::Debug for PartWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartWrapper")
            .field("part", &self.part)
            .field("ref_count", &self.ref_count())
            .field("must_drop", &self.must_drop.load(Ordering::Relaxed))
            .field("is_in_merge", &self.is_in_merge())
            .finish()
    }
}

/// A counted reference to a part, released on drop.
pub struct PartRef {
    pw: Arc<PartWrapper>,
}

impl PartRef {
    pub(crate) fn acquire(pw: &Arc<PartWrapper>) -> Self {
        pw.inc_ref();
        Self { pw: Arc::clone(pw) }
    }

    #[must_use]
    pub fn wrapper(&self) -> &PartWrapper {
        &self.pw
    }
}

impl Deref for PartRef {
    type Target = Part;

    fn deref(&self) -> &Part {
        self.pw.part()
    }
}

impl Drop for PartRef {
    fn drop(&mut self) {
        self.pw.dec_ref();
    }
}

impl fmt::Debug for PartRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.pw.fmt(f)
    }
}
