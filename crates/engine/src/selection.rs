//! Choosing which parts to merge.
//!
//! Parts are sorted by size and every contiguous window of up to 15 parts
//! (and at least half that many) is scored by its merge multiplier: output
//! size divided by the largest input. A merge only happens when the best
//! window multiplies the largest part by at least 7.5.

use std::sync::Arc;

use crate::part_wrapper::PartWrapper;

/// Upper bound on parts merged at once.
pub const MAX_PARTS_TO_MERGE: usize = 15;

/// Minimum ratio of output size to the largest input size.
const MIN_MERGE_MULTIPLIER: f64 = 1.7;

/// What selection needs to know about a part.
pub trait MergeCandidate {
    fn size_bytes(&self) -> u64;
    fn min_timestamp(&self) -> i64;
    fn is_in_merge(&self) -> bool;
}

impl MergeCandidate for Arc<PartWrapper> {
    fn size_bytes(&self) -> u64 {
        self.header().compressed_size_bytes
    }

    fn min_timestamp(&self) -> i64 {
        self.header().min_timestamp
    }

    fn is_in_merge(&self) -> bool {
        PartWrapper::is_in_merge(self)
    }
}

/// Appends the best set of parts from `src` to merge within `max_out_bytes`
/// to `dst`. Appends nothing when no set is worth merging. Parts already in
/// a merge are never picked.
pub fn append_parts_to_merge<P>(dst: &mut Vec<P>, src: &[P], max_out_bytes: u64)
where
    P: MergeCandidate + Clone,
{
    let max_in_part_bytes = (max_out_bytes as f64 / MIN_MERGE_MULTIPLIER) as u64;
    let mut parts: Vec<&P> = src
        .iter()
        .filter(|p| !p.is_in_merge() && p.size_bytes() <= max_in_part_bytes)
        .collect();
    if parts.len() < 2 {
        return;
    }

    // Similar sizes together, newer data first within a size.
    parts.sort_by(|a, b| {
        a.size_bytes()
            .cmp(&b.size_bytes())
            .then_with(|| b.min_timestamp().cmp(&a.min_timestamp()))
    });

    let max_src_parts = MAX_PARTS_TO_MERGE.min(parts.len());
    let min_src_parts = ((max_src_parts + 1) / 2).max(2);

    let mut best: &[&P] = &[];
    let mut best_m = 0.0;
    for n in min_src_parts..=max_src_parts {
        for window in parts.windows(n) {
            let smallest = window[0].size_bytes();
            let largest = window[n - 1].size_bytes();
            if smallest.saturating_mul(n as u64) < largest {
                continue;
            }
            let out_size: u64 = window.iter().map(|p| p.size_bytes()).sum();
            if out_size > max_out_bytes {
                // Later windows of this length are only bigger.
                break;
            }
            let m = out_size as f64 / largest.max(1) as f64;
            if m < best_m {
                continue;
            }
            best_m = m;
            best = window;
        }
    }

    let min_m = (MAX_PARTS_TO_MERGE as f64 / 2.0).max(MIN_MERGE_MULTIPLIER);
    if best_m < min_m {
        return;
    }
    dst.extend(best.iter().map(|p| (*p).clone()));
}

/// Sum of compressed sizes.
pub(crate) fn compressed_size<P: MergeCandidate>(parts: &[P]) -> u64 {
    parts.iter().map(MergeCandidate::size_bytes).sum()
}
