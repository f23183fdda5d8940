/// Merges: background merge workers, `merge_parts` and the atomic swap of
/// merged parts.
///
/// A merge takes parts flagged `is_in_merge` under the partition lock,
/// merges them without holding the lock, then swaps them for the result
/// under the lock again. Cancelled or postponed merges just clear the flags.
use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use part::{
    merge_block_streams, BlockStreamReader, BlockStreamWriter, FinishedPart, MergeOutcome, Part,
};
use tracing::{debug, info, warn};

use crate::disk::{self, DiskReservation, MergeLimiter};
use crate::error::MergeError;
use crate::part_wrapper::PartWrapper;
use crate::selection::{append_parts_to_merge, compressed_size, MAX_PARTS_TO_MERGE};
use crate::{Inner, PartsState};

/// Merges taking longer than this are logged.
const SLOW_MERGE_THRESHOLD: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PartType {
    Inmemory,
    File,
}

/// Unwraps results whose failure means corrupted data or a broken
/// filesystem.
fn must<T>(r: anyhow::Result<T>, what: impl Display) -> T {
    match r {
        Ok(v) => v,
        Err(e) => panic!("FATAL: {}: {:#}", what, e),
    }
}

pub(crate) fn spawn_background<F>(name: &str, f: F) -> thread::JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    match thread::Builder::new().name(name.to_string()).spawn(f) {
        Ok(h) => h,
        Err(e) => panic!("FATAL: cannot start {} thread: {}", name, e),
    }
}

/// Flags every part of `pws` as in merge. Must be called under the lock.
pub(crate) fn set_in_merge_locked(pws: &[Arc<PartWrapper>]) {
    for pw in pws {
        pw.set_in_merge(true);
    }
}

/// Splits `parts` into chunks for final merges: the best merge set while
/// there is one, then everything that is left.
pub(crate) fn final_merge_chunks(mut parts: Vec<Arc<PartWrapper>>) -> Vec<Vec<Arc<PartWrapper>>> {
    let mut chunks = Vec::new();
    while !parts.is_empty() {
        let mut chunk = Vec::new();
        append_parts_to_merge(&mut chunk, &parts, u64::MAX);
        if chunk.is_empty() {
            chunks.push(std::mem::take(&mut parts));
            break;
        }
        parts.retain(|pw| !chunk.iter().any(|c| Arc::ptr_eq(c, pw)));
        chunks.push(chunk);
    }
    chunks
}

/// Clears `is_in_merge` on drop.
struct InMergeGuard<'a> {
    inner: &'a Inner,
    pws: &'a [Arc<PartWrapper>],
}

impl Drop for InMergeGuard<'_> {
    fn drop(&mut self) {
        let _state = self.inner.lock_parts();
        for pw in self.pws {
            pw.set_in_merge(false);
        }
    }
}

struct ActiveMergeGuard<'a>(&'a AtomicU64);

impl<'a> ActiveMergeGuard<'a> {
    fn start(total: &AtomicU64, active: &'a AtomicU64) -> Self {
        total.fetch_add(1, Ordering::Relaxed);
        active.fetch_add(1, Ordering::Relaxed);
        Self(active)
    }
}

impl Drop for ActiveMergeGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

impl Inner {
    /// Starts a merge worker unless the partition already runs as many as
    /// configured. Must be called under the lock.
    pub(crate) fn start_merge_worker_locked(self: &Arc<Self>, state: &mut PartsState) {
        if self.is_stopping() || state.merge_workers_count >= self.config.merge_workers {
            return;
        }
        state.merge_workers_count += 1;
        let inner = Arc::clone(self);
        let handle = spawn_background("silt-merge", move || {
            let limiter = MergeLimiter::global(inner.config.global_merge_concurrency);
            let _permit = limiter.acquire();
            debug!(running = limiter.running(), "merge worker started");
            inner.merge_existing_parts();
        });
        state.background.retain(|h| !h.is_finished());
        state.background.push(handle);
    }

    /// Worker loop: merge the best set of parts that fits on disk until no
    /// merge is worth doing.
    fn merge_existing_parts(self: &Arc<Self>) {
        while !self.is_stopping() {
            let max_out_bytes =
                disk::available_disk_space(&self.path, self.config.min_free_disk_space_bytes);

            let pws = {
                let mut state = self.lock_parts();
                let candidates: Vec<Arc<PartWrapper>> = state
                    .inmemory_parts
                    .iter()
                    .chain(&state.file_parts)
                    .cloned()
                    .collect();
                let mut pws = Vec::new();
                append_parts_to_merge(&mut pws, &candidates, max_out_bytes);
                if pws.is_empty() {
                    // Under the same lock as the selection, so a part added
                    // meanwhile starts a new worker.
                    state.merge_workers_count -= 1;
                    return;
                }
                set_in_merge_locked(&pws);
                pws
            };

            match self.merge_parts(pws, false) {
                Ok(()) => {}
                Err(MergeError::Stopped) => break,
                Err(e @ MergeError::NoDiskSpace { .. }) => {
                    // The next round picks a smaller set.
                    warn!(path = %self.path.display(), error = %e, "postponing merge");
                }
            }
        }
        self.lock_parts().merge_workers_count -= 1;
    }

    pub(crate) fn next_merge_idx(&self) -> u64 {
        self.merge_idx.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn dst_part_type(&self, pws: &[Arc<PartWrapper>], is_final: bool) -> PartType {
        if is_final
            || compressed_size(pws) > self.config.max_inmemory_part_size()
            || pws.iter().any(|pw| !pw.is_inmemory())
        {
            PartType::File
        } else {
            PartType::Inmemory
        }
    }

    /// Merges `pws` into one part and swaps them for it.
    ///
    /// All of `pws` must be flagged `is_in_merge`; the flags are cleared
    /// before returning. A final merge always writes a file part and runs to
    /// completion even when the partition stops or disk space is short.
    pub(crate) fn merge_parts(
        self: &Arc<Self>,
        pws: Vec<Arc<PartWrapper>>,
        is_final: bool,
    ) -> Result<(), MergeError> {
        if pws.is_empty() {
            return Ok(());
        }
        for pw in &pws {
            assert!(pw.is_in_merge(), "BUG: merging part {:?} not flagged in merge", pw.part());
        }
        let _in_merge = InMergeGuard {
            inner: self,
            pws: &pws,
        };
        if !is_final && self.is_stopping() {
            return Err(MergeError::Stopped);
        }

        let start = Instant::now();
        let dst_type = self.dst_part_type(&pws, is_final);
        let src_size = compressed_size(&pws);
        let src_rows: u64 = pws.iter().map(|pw| pw.header().rows_count).sum();
        let src_blocks: u64 = pws.iter().map(|pw| pw.header().blocks_count).sum();

        let _reservation = match dst_type {
            PartType::Inmemory => None,
            PartType::File => match DiskReservation::try_reserve(
                &self.path,
                src_size,
                self.config.min_free_disk_space_bytes,
            ) {
                Ok(r) => Some(r),
                Err(available) if !is_final => {
                    return Err(MergeError::NoDiskSpace {
                        needed: src_size,
                        available,
                    })
                }
                Err(available) => {
                    // In-memory data must reach the disk anyway.
                    warn!(
                        needed = src_size,
                        available,
                        reserved = disk::reserved_disk_space(),
                        "final merge runs without a disk space reservation"
                    );
                    None
                }
            },
        };
        let _active = match dst_type {
            PartType::Inmemory => {
                ActiveMergeGuard::start(&self.inmemory_merges_total, &self.inmemory_active_merges)
            }
            PartType::File => {
                ActiveMergeGuard::start(&self.file_merges_total, &self.file_active_merges)
            }
        };

        let applied_seq = pws.iter().map(|pw| pw.applied_seq()).max().unwrap_or(0);
        let dst_path = match dst_type {
            PartType::Inmemory => None,
            PartType::File => Some(self.path.join(format!("{:016X}", self.next_merge_idx()))),
        };

        let new_pw = match (&dst_path, single_inmemory_part(&pws, is_final)) {
            (Some(dst_path), Some(mp)) => {
                // A lone in-memory part goes to disk as is.
                let tmp_path = tmp_path_for(dst_path);
                must(
                    mp.store_to_disk(&tmp_path, applied_seq),
                    format_args!("cannot store part to {}", tmp_path.display()),
                );
                self.publish_file_part(&tmp_path, dst_path)
            }
            _ => self.write_merged_part(&pws, dst_path.as_deref(), applied_seq, is_final)?,
        };

        let (dst_rows, dst_blocks, dst_size) = new_pw.as_ref().map_or((0, 0, 0), |pw| {
            let ph = pw.header();
            (ph.rows_count, ph.blocks_count, ph.compressed_size_bytes)
        });
        self.swap_src_with_dst(&pws, new_pw, dst_type);

        let d = start.elapsed();
        debug!(
            parts = pws.len(),
            src_rows,
            src_blocks,
            src_size,
            dst_rows,
            dst_blocks,
            dst_size,
            dst = ?dst_type,
            is_final,
            elapsed_ms = d.as_millis() as u64,
            "merged parts"
        );
        if d > SLOW_MERGE_THRESHOLD {
            let secs = d.as_secs_f64();
            info!(
                parts = pws.len(),
                src_rows,
                src_blocks,
                src_size,
                dst_rows,
                dst_blocks,
                dst_size,
                seconds = secs,
                rows_per_sec = (src_rows as f64 / secs) as u64,
                path = ?dst_path,
                "slow merge"
            );
        }
        Ok(())
    }

    /// Streams the blocks of `pws` into a new part. Returns `None` when the
    /// output has no rows.
    fn write_merged_part(
        &self,
        pws: &[Arc<PartWrapper>],
        dst_path: Option<&Path>,
        applied_seq: u64,
        is_final: bool,
    ) -> Result<Option<Arc<PartWrapper>>, MergeError> {
        let fv = self.config.format_version;
        let tmp_path = dst_path.map(tmp_path_for);
        let mut bsw = match &tmp_path {
            None => BlockStreamWriter::create_inmemory(fv),
            Some(tmp) => must(
                BlockStreamWriter::create_file(tmp, fv),
                format_args!("cannot create part {}", tmp.display()),
            ),
        };
        bsw.set_applied_seq(applied_seq);

        let readers = pws.iter().map(|pw| BlockStreamReader::new(pw.part())).collect();
        let stop = if is_final { None } else { Some(&self.stop) };
        let outcome = must(
            merge_block_streams(&mut bsw, readers, stop),
            format_args!("cannot merge {} parts", pws.len()),
        );
        if outcome == MergeOutcome::Stopped {
            drop(bsw);
            if let Some(tmp) = &tmp_path {
                remove_part_dir(tmp);
            }
            return Err(MergeError::Stopped);
        }

        let finished = must(bsw.finalize(), "cannot finalize merged part");
        let new_pw = match (finished, tmp_path, dst_path) {
            (FinishedPart::Inmemory(mp), _, _) => {
                if mp.header().rows_count == 0 {
                    return Ok(None);
                }
                let part = must(Part::open_inmemory(Arc::new(mp)), "cannot open merged part");
                Some(PartWrapper::new(part, Some(self.flush_deadline_for(pws))))
            }
            (FinishedPart::File(ph), Some(tmp), Some(dst)) => {
                if ph.rows_count == 0 {
                    remove_part_dir(&tmp);
                    return Ok(None);
                }
                self.publish_file_part(&tmp, dst)
            }
            (FinishedPart::File(_), _, _) => unreachable!("file part written without a path"),
        };
        Ok(new_pw)
    }

    /// Renames a completed part into place and opens it.
    fn publish_file_part(&self, tmp_path: &Path, dst_path: &Path) -> Option<Arc<PartWrapper>> {
        must(
            fs::rename(tmp_path, dst_path).map_err(anyhow::Error::from),
            format_args!(
                "cannot rename {} to {}",
                tmp_path.display(),
                dst_path.display()
            ),
        );
        part::sync_dir(&self.path);
        let part = must(
            Part::open(dst_path),
            format_args!("cannot open merged part {}", dst_path.display()),
        );
        Some(PartWrapper::new(part, None))
    }

    /// The earliest deadline among in-memory inputs, capped by a fresh one.
    fn flush_deadline_for(&self, pws: &[Arc<PartWrapper>]) -> Instant {
        let fresh = Instant::now() + self.config.flush_interval;
        pws.iter()
            .filter_map(|pw| pw.flush_deadline())
            .fold(fresh, Instant::min)
    }

    /// Replaces `pws` with `new_pw` in the part lists and releases the
    /// list's references to `pws`.
    pub(crate) fn swap_src_with_dst(
        self: &Arc<Self>,
        pws: &[Arc<PartWrapper>],
        new_pw: Option<Arc<PartWrapper>>,
        dst_type: PartType,
    ) {
        let mut state = self.lock_parts();
        let removed_inmemory = remove_parts(&mut state.inmemory_parts, pws);
        let removed_file = remove_parts(&mut state.file_parts, pws);

        let added_file = new_pw.is_some() && dst_type == PartType::File;
        if let Some(pw) = new_pw {
            // Inputs may have advanced while the merge ran.
            let seq = pws.iter().map(|src| src.link_merged_into(&pw)).max().unwrap_or(0);
            must(
                pw.advance_applied_seq(seq),
                "cannot carry applied seq over to merged part",
            );
            match dst_type {
                PartType::Inmemory => {
                    state.inmemory_parts.push(pw);
                    self.start_flusher_locked(&mut state);
                }
                PartType::File => state.file_parts.push(pw),
            }
            if state.inmemory_parts.len() + state.file_parts.len() > MAX_PARTS_TO_MERGE {
                self.start_merge_worker_locked(&mut state);
            }
        }

        // Persisted under the lock so concurrent swaps can't reorder writes.
        if removed_file > 0 || added_file {
            let names = file_part_names(&state.file_parts);
            must(
                state.manifest.set_part_names(names),
                format_args!("cannot update parts list in {}", self.path.display()),
            );
        }
        drop(state);

        assert_eq!(
            removed_inmemory + removed_file,
            pws.len(),
            "BUG: unexpected number of parts removed"
        );
        self.parts_changed.notify_all();

        for pw in pws {
            pw.set_must_drop();
            pw.dec_ref();
        }
    }

    /// Final-merges every in-memory part that isn't being merged already.
    pub(crate) fn flush_inmemory_parts_to_disk(self: &Arc<Self>) {
        let chunks = {
            let state = self.lock_parts();
            let pws: Vec<Arc<PartWrapper>> = state
                .inmemory_parts
                .iter()
                .filter(|pw| !pw.is_in_merge())
                .cloned()
                .collect();
            let chunks = final_merge_chunks(pws);
            for chunk in &chunks {
                set_in_merge_locked(chunk);
            }
            chunks
        };
        for chunk in chunks {
            if let Err(e) = self.merge_parts(chunk, true) {
                panic!("BUG: final merge failed: {}", e);
            }
        }
    }
}

/// The in-memory part of a final merge with a single input.
fn single_inmemory_part(pws: &[Arc<PartWrapper>], is_final: bool) -> Option<&part::InmemoryPart> {
    match pws {
        [pw] if is_final => pw.part().inmemory_part().map(|mp| mp.as_ref()),
        _ => None,
    }
}

fn tmp_path_for(dst: &Path) -> PathBuf {
    let mut name = dst.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

fn remove_part_dir(path: &Path) {
    if let Err(e) = fs::remove_dir_all(path) {
        panic!("FATAL: cannot remove {}: {}", path.display(), e);
    }
}

fn remove_parts(list: &mut Vec<Arc<PartWrapper>>, to_remove: &[Arc<PartWrapper>]) -> usize {
    let before = list.len();
    list.retain(|pw| !to_remove.iter().any(|r| Arc::ptr_eq(r, pw)));
    before - list.len()
}

fn file_part_names(pws: &[Arc<PartWrapper>]) -> Vec<String> {
    pws.iter()
        .filter_map(|pw| pw.part().path())
        .filter_map(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .collect()
}
