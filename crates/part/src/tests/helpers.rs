use std::sync::Arc;

use anyhow::Result;

use crate::*;

/// A decoded row together with its stream.
pub type Row = (StreamId, i64, Vec<Field>);

pub fn tenant() -> TenantId {
    TenantId {
        account_id: 1,
        project_id: 2,
    }
}

pub fn sid(hi: u64) -> StreamId {
    StreamId {
        tenant_id: tenant(),
        hi,
        lo: 0,
    }
}

pub fn fields(pairs: &[(&str, &str)]) -> Vec<Field> {
    pairs.iter().map(|(n, v)| Field::new(*n, *v)).collect()
}

/// `rows_per_stream` rows for each of `streams` streams, timestamps
/// interleaved across streams and offset by `ts_offset`.
pub fn log_rows(streams: usize, rows_per_stream: usize, ts_offset: i64) -> LogRows {
    let mut lr = LogRows::new(&["host"]);
    for i in 0..rows_per_stream {
        for s in 0..streams {
            let host = format!("host-{}", s);
            let msg = format!("request {} served by {}", i, host);
            let duration = (i * 3).to_string();
            let level = if i % 2 == 0 { "info" } else { "warn" };
            lr.must_add(
                tenant(),
                (i as i64) * 100 + ts_offset,
                fields(&[
                    ("host", &host),
                    ("_msg", &msg),
                    ("level", level),
                    ("duration", &duration),
                ]),
            );
        }
    }
    lr
}

pub fn open_inmemory(lr: &mut LogRows, format_version: u32) -> Result<Part> {
    let mp = InmemoryPart::from_log_rows(lr, format_version)?;
    Part::open_inmemory(Arc::new(mp))
}

/// Rows of `lr` in storage order. `lr` must already be sorted.
pub fn rows_of(lr: &LogRows) -> Vec<Row> {
    lr.stream_ids()
        .iter()
        .zip(lr.timestamps())
        .zip(lr.rows())
        .map(|((sid, ts), row)| (*sid, *ts, row.clone()))
        .collect()
}

/// Reads every row of `part` through a block stream reader.
pub fn read_rows(part: &Part) -> Result<Vec<Row>> {
    let mut r = BlockStreamReader::new(part);
    let mut out = Vec::new();
    while r.next_block()? {
        let bd = r.block_data().expect("block after next_block");
        let mut timestamps = Vec::new();
        let mut rows = Vec::new();
        bd.to_block()?.append_rows_to(&mut timestamps, &mut rows);
        for (ts, row) in timestamps.into_iter().zip(rows) {
            out.push((bd.stream_id, ts, row));
        }
    }
    Ok(out)
}

/// All block headers of `part`, in order.
pub fn block_headers(part: &Part) -> Result<Vec<BlockHeader>> {
    let mut bhs = Vec::new();
    for ibh in part.index_block_headers() {
        bhs.extend(part.read_block_headers(ibh)?);
    }
    Ok(bhs)
}

pub fn assert_sorted(rows: &[Row]) {
    for w in rows.windows(2) {
        assert!(
            (w[0].0, w[0].1) <= (w[1].0, w[1].1),
            "rows out of order: {:?} then {:?}",
            (w[0].0, w[0].1),
            (w[1].0, w[1].1)
        );
    }
}
