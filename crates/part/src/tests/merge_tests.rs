use std::sync::atomic::AtomicBool;

use anyhow::Result;

use super::helpers::*;
use crate::merge::merge_rows_for_test;
use crate::*;

fn merge_inmemory(parts: &[Part], stop: Option<&AtomicBool>) -> Result<(MergeOutcome, Part)> {
    let mut bsw = BlockStreamWriter::create_inmemory(1);
    let readers = parts.iter().map(BlockStreamReader::new).collect();
    let outcome = merge_block_streams(&mut bsw, readers, stop)?;
    let part = match bsw.finalize()? {
        FinishedPart::Inmemory(mp) => Part::open_inmemory(std::sync::Arc::new(mp))?,
        FinishedPart::File(_) => unreachable!(),
    };
    Ok((outcome, part))
}

fn sorted_rows(mut rows: Vec<Row>) -> Vec<Row> {
    rows.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
    rows
}

// -------------------- Conservation --------------------

#[test]
fn merge_preserves_all_rows() -> Result<()> {
    let mut expected = Vec::new();
    let mut parts = Vec::new();
    for k in 0..3 {
        let mut lr = log_rows(3, 40, k);
        parts.push(open_inmemory(&mut lr, 1)?);
        expected.extend(rows_of(&lr));
    }
    let (outcome, out) = merge_inmemory(&parts, None)?;
    assert_eq!(outcome, MergeOutcome::Completed);

    let ph = out.header();
    let in_blocks: u64 = parts.iter().map(|p| p.header().blocks_count).sum();
    let in_bytes: u64 = parts.iter().map(|p| p.header().uncompressed_size_bytes).sum();
    assert_eq!(ph.rows_count, 360);
    assert!(ph.blocks_count <= in_blocks);
    assert_eq!(ph.uncompressed_size_bytes, in_bytes);

    let rows = read_rows(&out)?;
    assert_sorted(&rows);
    assert_eq!(rows, sorted_rows(expected));
    Ok(())
}

#[test]
fn small_blocks_of_a_stream_are_coalesced() -> Result<()> {
    let mut parts = Vec::new();
    for k in 0..5 {
        let mut lr = log_rows(1, 2, k);
        parts.push(open_inmemory(&mut lr, 1)?);
    }
    let (_, out) = merge_inmemory(&parts, None)?;
    assert_eq!(out.header().blocks_count, 1);
    assert_eq!(out.header().rows_count, 10);
    Ok(())
}

#[test]
fn merge_of_disjoint_streams_keeps_stream_order() -> Result<()> {
    let mut lr_a = LogRows::new(&["host"]);
    let mut lr_b = LogRows::new(&["host"]);
    for i in 0..20 {
        lr_a.must_add(tenant(), i, fields(&[("host", "a"), ("_msg", "from a")]));
        lr_b.must_add(tenant(), i, fields(&[("host", "b"), ("_msg", "from b")]));
    }
    let parts = vec![open_inmemory(&mut lr_a, 1)?, open_inmemory(&mut lr_b, 1)?];
    let (_, out) = merge_inmemory(&parts, None)?;
    assert_eq!(out.header().blocks_count, 2);
    let bhs = block_headers(&out)?;
    assert!(bhs[0].stream_id < bhs[1].stream_id);
    Ok(())
}

// -------------------- Pass-through and limits --------------------

#[test]
fn full_blocks_pass_through_unchanged() -> Result<()> {
    let mut lr = LogRows::new(&["host"]);
    for i in 0..30 {
        let msg = format!("{} {}", "y".repeat(100_000), i);
        lr.must_add(tenant(), i, fields(&[("host", "h"), ("_msg", &msg)]));
    }
    let input = open_inmemory(&mut lr, 1)?;
    let in_bhs = block_headers(&input)?;
    assert!(in_bhs[0].uncompressed_size_bytes >= MAX_UNCOMPRESSED_BLOCK_SIZE);
    let original = input.read_block_data(&in_bhs[0])?;

    let (_, out) = merge_inmemory(std::slice::from_ref(&input), None)?;
    let out_bhs = block_headers(&out)?;
    let copied = out.read_block_data(&out_bhs[0])?;
    assert_eq!(copied, original);
    assert_eq!(read_rows(&out)?, rows_of(&lr));
    Ok(())
}

#[test]
fn merged_blocks_respect_columns_cap() -> Result<()> {
    let mut parts = Vec::new();
    for k in 0..2 {
        let mut lr = LogRows::new(&[]);
        let row: Vec<Field> = (0..1500)
            .map(|i| Field::new(format!("p{}_f{}", k, i), "v"))
            .collect();
        lr.must_add(tenant(), k, row);
        parts.push(open_inmemory(&mut lr, 1)?);
    }
    let (_, out) = merge_inmemory(&parts, None)?;
    assert_eq!(out.header().rows_count, 2);
    assert_eq!(out.header().blocks_count, 2);
    Ok(())
}

#[test]
fn v0_parts_merge_into_v1() -> Result<()> {
    let mut lr0 = log_rows(2, 10, 0);
    let mut lr1 = log_rows(2, 10, 1);
    let parts = vec![open_inmemory(&mut lr0, 0)?, open_inmemory(&mut lr1, 1)?];
    let (_, out) = merge_inmemory(&parts, None)?;
    assert_eq!(out.header().format_version, 1);

    let mut expected = rows_of(&lr0);
    expected.extend(rows_of(&lr1));
    assert_eq!(read_rows(&out)?, sorted_rows(expected));
    Ok(())
}

// -------------------- Cancellation --------------------

#[test]
fn stop_flag_interrupts_merge() -> Result<()> {
    let mut lr = log_rows(3, 10, 0);
    let parts = vec![open_inmemory(&mut lr, 1)?];
    let stop = AtomicBool::new(true);
    let (outcome, _) = merge_inmemory(&parts, Some(&stop))?;
    assert_eq!(outcome, MergeOutcome::Stopped);
    Ok(())
}

#[test]
fn lowered_stop_flag_is_ignored() -> Result<()> {
    let mut lr = log_rows(3, 10, 0);
    let parts = vec![open_inmemory(&mut lr, 1)?];
    let stop = AtomicBool::new(false);
    let (outcome, out) = merge_inmemory(&parts, Some(&stop))?;
    assert_eq!(outcome, MergeOutcome::Completed);
    assert_eq!(out.header().rows_count, 30);
    Ok(())
}

// -------------------- Row interleaving --------------------

#[test]
fn equal_timestamps_keep_pending_rows_first() {
    let a = (
        vec![1, 3, 3],
        vec![fields(&[("n", "a1")]), fields(&[("n", "a3")]), fields(&[("n", "a3b")])],
    );
    let b = (
        vec![2, 3, 4],
        vec![fields(&[("n", "b2")]), fields(&[("n", "b3")]), fields(&[("n", "b4")])],
    );
    let (ts, rows) = merge_rows_for_test(a, b);
    assert_eq!(ts, vec![1, 2, 3, 3, 3, 4]);
    let names: Vec<&str> = rows.iter().map(|r| r[0].value.as_str()).collect();
    assert_eq!(names, vec!["a1", "b2", "a3", "a3b", "b3", "b4"]);
}
