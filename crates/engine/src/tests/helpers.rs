use std::fs;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use config::DatadbConfig;
use part::{BlockStreamReader, Field, LogRows, Part, StreamId, TenantId};

use crate::merge::set_in_merge_locked;
use crate::{Datadb, MergeError, PartWrapper};

pub fn tenant() -> TenantId {
    TenantId {
        account_id: 0,
        project_id: 0,
    }
}

/// Keeps in-memory parts in memory unless a test flushes them.
pub fn test_config() -> DatadbConfig {
    DatadbConfig::default()
        .flush_interval(Duration::from_secs(3600))
        .min_free_disk_space_bytes(0)
}

/// `rows_per_stream` rows for each of `streams` streams. Timestamps start
/// at `ts_offset` and grow by 10 per row.
pub fn log_rows(streams: usize, rows_per_stream: usize, ts_offset: i64) -> LogRows {
    let mut lr = LogRows::new(&["app"]);
    for i in 0..rows_per_stream {
        for s in 0..streams {
            let ts = ts_offset + (i as i64) * 10;
            lr.must_add(
                tenant(),
                ts,
                vec![
                    Field::new("app", format!("app-{}", s)),
                    Field::new("_msg", format!("event {} of app-{} at {}", i, s, ts)),
                    Field::new("status", if i % 3 == 0 { "ok" } else { "retry" }),
                ],
            );
        }
    }
    lr
}

/// Polls `f` until it holds or `timeout` passes.
pub fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut f: F) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if f() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

/// (stream id, timestamp) of every row of `part` in block order.
pub fn row_keys(part: &Part) -> Result<Vec<(StreamId, i64)>> {
    let mut r = BlockStreamReader::new(part);
    let mut keys = Vec::new();
    while r.next_block()? {
        let bd = r.block_data().expect("block after next_block");
        let block = bd.to_block()?;
        keys.extend(block.timestamps().iter().map(|ts| (bd.stream_id, *ts)));
    }
    Ok(keys)
}

/// Row keys of all live parts of `db`, sorted.
pub fn all_row_keys(db: &Datadb) -> Result<Vec<(StreamId, i64)>> {
    let mut keys = Vec::new();
    for p in db.acquire_parts() {
        keys.extend(row_keys(&p)?);
    }
    keys.sort();
    Ok(keys)
}

/// Names of the part directories under `path`.
pub fn part_dirs(path: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(path)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

/// Runs one merge over every live part of `db`.
pub fn merge_all(db: &Datadb, is_final: bool) -> Result<(), MergeError> {
    let pws: Vec<std::sync::Arc<PartWrapper>> = {
        let state = db.inner.lock_parts();
        let pws: Vec<_> = state
            .inmemory_parts
            .iter()
            .chain(&state.file_parts)
            .cloned()
            .collect();
        set_in_merge_locked(&pws);
        pws
    };
    db.inner.merge_parts(pws, is_final)
}
