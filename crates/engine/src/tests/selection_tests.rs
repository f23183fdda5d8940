use crate::selection::{append_parts_to_merge, MergeCandidate, MAX_PARTS_TO_MERGE};

#[derive(Debug, Clone, PartialEq, Eq)]
struct FakePart {
    id: usize,
    size: u64,
    min_ts: i64,
    in_merge: bool,
}

impl MergeCandidate for FakePart {
    fn size_bytes(&self) -> u64 {
        self.size
    }

    fn min_timestamp(&self) -> i64 {
        self.min_ts
    }

    fn is_in_merge(&self) -> bool {
        self.in_merge
    }
}

fn parts(sizes: &[u64]) -> Vec<FakePart> {
    sizes
        .iter()
        .enumerate()
        .map(|(id, &size)| FakePart {
            id,
            size,
            min_ts: id as i64,
            in_merge: false,
        })
        .collect()
}

fn select(src: &[FakePart], max_out_bytes: u64) -> Vec<FakePart> {
    let mut dst = Vec::new();
    append_parts_to_merge(&mut dst, src, max_out_bytes);
    dst
}

/// Deterministic pseudo-random sizes.
fn lcg_sizes(n: usize, seed: u64) -> Vec<u64> {
    let mut x = seed;
    (0..n)
        .map(|_| {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            1 + (x >> 33) % 10_000
        })
        .collect()
}

// -------------------- Thresholds --------------------

#[test]
fn nothing_to_merge_below_two_parts() {
    assert!(select(&[], u64::MAX).is_empty());
    assert!(select(&parts(&[100]), u64::MAX).is_empty());
}

#[test]
fn seven_equal_parts_are_not_worth_merging() {
    assert!(select(&parts(&[100; 7]), u64::MAX).is_empty());
}

#[test]
fn eight_equal_parts_are_merged() {
    assert_eq!(select(&parts(&[100; 8]), u64::MAX).len(), 8);
}

#[test]
fn at_most_fifteen_parts_per_merge() {
    let got = select(&parts(&[100; 40]), u64::MAX);
    assert_eq!(got.len(), MAX_PARTS_TO_MERGE);
}

#[test]
fn unbalanced_parts_are_skipped() {
    // One huge part next to small ones never forms a balanced window.
    let mut sizes = vec![10; 7];
    sizes.push(1_000_000);
    assert!(select(&parts(&sizes), u64::MAX).is_empty());

    let mut sizes = vec![10; 10];
    sizes.push(1_000_000);
    let got = select(&parts(&sizes), u64::MAX);
    assert_eq!(got.len(), 10);
    assert!(got.iter().all(|p| p.size == 10));
}

// -------------------- Budget --------------------

#[test]
fn oversized_parts_are_filtered_out() {
    let mut sizes = vec![100; 10];
    sizes.push(900);
    // 900 > 1000 / 1.7, so the big part can't join.
    let got = select(&parts(&sizes), 1000);
    assert!(got.iter().all(|p| p.size == 100));
    assert_eq!(got.len(), 10);
}

#[test]
fn selection_never_exceeds_budget() {
    for seed in 0..50u64 {
        let src = parts(&lcg_sizes(40, seed));
        for max_out in [1_000u64, 10_000, 50_000, 200_000, u64::MAX] {
            let got = select(&src, max_out);
            let total: u64 = got.iter().map(|p| p.size).sum();
            assert!(
                total <= max_out,
                "seed {} budget {}: selected {} bytes",
                seed,
                max_out,
                total
            );
            assert!(got.len() <= MAX_PARTS_TO_MERGE);
        }
    }
}

#[test]
fn zero_budget_selects_nothing() {
    assert!(select(&parts(&[100; 20]), 0).is_empty());
}

// -------------------- In-merge flag --------------------

#[test]
fn parts_in_merge_are_never_selected() {
    for seed in 0..20u64 {
        let mut src = parts(&lcg_sizes(30, seed));
        for p in src.iter_mut().filter(|p| p.id % 3 == 0) {
            p.in_merge = true;
        }
        let got = select(&src, u64::MAX);
        assert!(got.iter().all(|p| !p.in_merge), "seed {}", seed);
    }
}

#[test]
fn all_parts_in_merge_selects_nothing() {
    let mut src = parts(&[100; 20]);
    for p in &mut src {
        p.in_merge = true;
    }
    assert!(select(&src, u64::MAX).is_empty());
}

#[test]
fn selection_appends_to_dst() {
    let mut dst = parts(&[1]);
    append_parts_to_merge(&mut dst, &parts(&[100; 8]), u64::MAX);
    assert_eq!(dst.len(), 9);
    assert_eq!(dst[0].size, 1);
}

#[test]
fn size_clusters_are_not_mixed() {
    // Two clusters of very different sizes are never mixed.
    let mut sizes = vec![10; 9];
    sizes.extend(vec![1000; 9]);
    let got = select(&parts(&sizes), u64::MAX);
    assert!(!got.is_empty());
    let first = got[0].size;
    assert!(got.iter().all(|p| p.size == first));
}
