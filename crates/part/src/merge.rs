//! K-way merge of block streams into one writer.
//!
//! Blocks are taken from the readers in (stream id, min timestamp) order.
//! A block is only decoded into rows when it has to be combined with a
//! neighbouring block of the same stream; full blocks are copied as encoded.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use anyhow::Result;

use crate::block_data::BlockData;
use crate::reader::BlockStreamReader;
use crate::rows::{uncompressed_rows_size_bytes, Field};
use crate::stream_id::StreamId;
use crate::writer::BlockStreamWriter;
use crate::{MAX_COLUMNS_PER_BLOCK, MAX_UNCOMPRESSED_BLOCK_SIZE};

/// How a merge ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Completed,
    /// The stop flag was raised; the writer holds partial output.
    Stopped,
}

/// The current block of one reader, ordered for the heap.
struct HeapEntry {
    stream_id: StreamId,
    min_timestamp: i64,
    /// Index into the readers array.
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse to pop the smallest block first.
        // Ties go to the lower source index.
        other
            .stream_id
            .cmp(&self.stream_id)
            .then_with(|| other.min_timestamp.cmp(&self.min_timestamp))
            .then_with(|| other.source.cmp(&self.source))
    }
}

/// Merges all blocks of `readers` into `bsw`.
///
/// `stop` is checked before each block; pass `None` for merges that must run
/// to completion.
pub fn merge_block_streams(
    bsw: &mut BlockStreamWriter,
    mut readers: Vec<BlockStreamReader<'_>>,
    stop: Option<&AtomicBool>,
) -> Result<MergeOutcome> {
    let mut heap = BinaryHeap::with_capacity(readers.len());
    for (source, r) in readers.iter_mut().enumerate() {
        if r.next_block()? {
            heap.push(entry_for(r, source));
        }
    }

    let mut acc = Accumulator::default();
    while let Some(top) = heap.pop() {
        if stop.is_some_and(|s| s.load(AtomicOrdering::Relaxed)) {
            return Ok(MergeOutcome::Stopped);
        }
        let r = &mut readers[top.source];
        let bd = match r.take_block_data() {
            Some(bd) => bd,
            None => panic!("BUG: reader #{} on the heap has no block", top.source),
        };
        acc.add(bsw, bd)?;
        if r.next_block()? {
            heap.push(entry_for(r, top.source));
        }
    }
    acc.flush(bsw)?;
    Ok(MergeOutcome::Completed)
}

fn entry_for(r: &BlockStreamReader<'_>, source: usize) -> HeapEntry {
    match r.block_data() {
        Some(bd) => HeapEntry {
            stream_id: bd.stream_id,
            min_timestamp: bd.timestamps_data.min_timestamp,
            source,
        },
        None => panic!("BUG: reader #{} advanced without a block", source),
    }
}

/// Pending output of the merge for the current stream.
#[derive(Default)]
enum Pending {
    #[default]
    Empty,
    Data(BlockData),
    Rows {
        stream_id: StreamId,
        timestamps: Vec<i64>,
        rows: Vec<Vec<Field>>,
        names: HashSet<String>,
    },
}

#[derive(Default)]
struct Accumulator {
    pending: Pending,
}

impl Accumulator {
    fn add(&mut self, bsw: &mut BlockStreamWriter, bd: BlockData) -> Result<()> {
        let same_stream = match &self.pending {
            Pending::Empty => false,
            Pending::Data(p) => p.stream_id == bd.stream_id,
            Pending::Rows { stream_id, .. } => *stream_id == bd.stream_id,
        };
        if !same_stream || self.merged_columns_count(&bd) > MAX_COLUMNS_PER_BLOCK {
            self.flush(bsw)?;
            return self.start(bsw, bd);
        }
        if bd.is_full() {
            self.flush(bsw)?;
            return bsw.write_block_data(&bd);
        }

        let pending = std::mem::take(&mut self.pending);
        let (stream_id, mut timestamps, mut rows, mut names) = match pending {
            Pending::Data(p) => {
                let mut timestamps = Vec::new();
                let mut rows = Vec::new();
                p.to_block()?.append_rows_to(&mut timestamps, &mut rows);
                let names = p.column_names().map(str::to_string).collect();
                (p.stream_id, timestamps, rows, names)
            }
            Pending::Rows {
                stream_id,
                timestamps,
                rows,
                names,
            } => (stream_id, timestamps, rows, names),
            Pending::Empty => unreachable!("same stream implies pending output"),
        };
        names.extend(bd.column_names().map(str::to_string));

        let mut in_timestamps = Vec::new();
        let mut in_rows = Vec::new();
        bd.to_block()?
            .append_rows_to(&mut in_timestamps, &mut in_rows);
        merge_rows_by_timestamp(&mut timestamps, &mut rows, in_timestamps, in_rows);

        let size = uncompressed_rows_size_bytes(&rows);
        self.pending = Pending::Rows {
            stream_id,
            timestamps,
            rows,
            names,
        };
        if size >= MAX_UNCOMPRESSED_BLOCK_SIZE {
            self.flush(bsw)?;
        }
        Ok(())
    }

    /// Makes `bd` the new pending state, or writes it straight away if full.
    fn start(&mut self, bsw: &mut BlockStreamWriter, bd: BlockData) -> Result<()> {
        if bd.is_full() {
            return bsw.write_block_data(&bd);
        }
        self.pending = Pending::Data(bd);
        Ok(())
    }

    fn merged_columns_count(&self, bd: &BlockData) -> usize {
        match &self.pending {
            Pending::Empty => bd.columns_count(),
            Pending::Data(p) => {
                let mut names: HashSet<&str> = p.column_names().collect();
                names.extend(bd.column_names());
                names.len()
            }
            Pending::Rows { names, .. } => {
                names.len() + bd.column_names().filter(|n| !names.contains(*n)).count()
            }
        }
    }

    fn flush(&mut self, bsw: &mut BlockStreamWriter) -> Result<()> {
        match std::mem::take(&mut self.pending) {
            Pending::Empty => Ok(()),
            Pending::Data(bd) => bsw.write_block_data(&bd),
            Pending::Rows {
                stream_id,
                timestamps,
                rows,
                ..
            } => bsw.write_rows(stream_id, &timestamps, &rows),
        }
    }
}

/// Merges `src` into `dst`, both sorted by timestamp. On equal timestamps
/// rows already in `dst` go first.
fn merge_rows_by_timestamp(
    dst_timestamps: &mut Vec<i64>,
    dst_rows: &mut Vec<Vec<Field>>,
    src_timestamps: Vec<i64>,
    src_rows: Vec<Vec<Field>>,
) {
    let total = dst_timestamps.len() + src_timestamps.len();
    let mut timestamps = Vec::with_capacity(total);
    let mut rows = Vec::with_capacity(total);

    let mut a = std::mem::take(dst_timestamps)
        .into_iter()
        .zip(std::mem::take(dst_rows))
        .peekable();
    let mut b = src_timestamps.into_iter().zip(src_rows).peekable();
    loop {
        let take_a = match (a.peek(), b.peek()) {
            (Some((ta, _)), Some((tb, _))) => ta <= tb,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => break,
        };
        let next = if take_a { a.next() } else { b.next() };
        if let Some((ts, row)) = next {
            timestamps.push(ts);
            rows.push(row);
        }
    }
    *dst_timestamps = timestamps;
    *dst_rows = rows;
}

#[cfg(test)]
pub(crate) fn merge_rows_for_test(
    a: (Vec<i64>, Vec<Vec<Field>>),
    b: (Vec<i64>, Vec<Vec<Field>>),
) -> (Vec<i64>, Vec<Vec<Field>>) {
    let (mut ts, mut rows) = a;
    merge_rows_by_timestamp(&mut ts, &mut rows, b.0, b.1);
    (ts, rows)
}
