/// Background flusher for in-memory parts past their flush deadline.
///
/// One flusher runs per partition while it has in-memory parts. Due parts
/// are final-merged to disk in chunks of at most 15, bypassing the merge
/// score threshold and the free disk space check.
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::merge::{final_merge_chunks, set_in_merge_locked, spawn_background};
use crate::part_wrapper::PartWrapper;
use crate::{Inner, PartsState};

/// Upper bound on the time between two checks for due parts.
const MAX_FLUSH_CHECK_INTERVAL: Duration = Duration::from_secs(1);

impl Inner {
    /// Starts the flusher if it isn't running. Must be called under the lock.
    pub(crate) fn start_flusher_locked(self: &Arc<Self>, state: &mut PartsState) {
        if self.is_stopping() || state.flusher_running {
            return;
        }
        state.flusher_running = true;
        let inner = Arc::clone(self);
        let handle = spawn_background("silt-flusher", move || inner.flush_old_inmemory_parts());
        state.background.retain(|h| !h.is_finished());
        state.background.push(handle);
    }

    fn flush_old_inmemory_parts(self: &Arc<Self>) {
        let check_interval = self.config.flush_interval.min(MAX_FLUSH_CHECK_INTERVAL);
        loop {
            let chunks = {
                let mut state = self.lock_parts();
                if self.is_stopping() || state.inmemory_parts.is_empty() {
                    state.flusher_running = false;
                    return;
                }
                let now = Instant::now();
                let due: Vec<Arc<PartWrapper>> = state
                    .inmemory_parts
                    .iter()
                    .filter(|pw| !pw.is_in_merge())
                    .filter(|pw| pw.flush_deadline().is_some_and(|d| d <= now))
                    .cloned()
                    .collect();
                let chunks = final_merge_chunks(due);
                for chunk in &chunks {
                    set_in_merge_locked(chunk);
                }
                chunks
            };

            if !chunks.is_empty() {
                debug!(
                    path = %self.path.display(),
                    chunks = chunks.len(),
                    parts = chunks.iter().map(Vec::len).sum::<usize>(),
                    "flushing in-memory parts"
                );
            }
            for chunk in chunks {
                if let Err(e) = self.merge_parts(chunk, true) {
                    panic!("BUG: final merge failed: {}", e);
                }
            }

            let mut state = self.lock_parts();
            if self.is_stopping() {
                state.flusher_running = false;
                return;
            }
            let _state = match self.parts_changed.wait_timeout(state, check_interval) {
                Ok((s, _)) => s,
                Err(e) => e.into_inner().0,
            };
        }
    }
}
