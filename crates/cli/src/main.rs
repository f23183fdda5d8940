//! # CLI - silt interactive shell
//!
//! A REPL over a single log partition. Reads commands from stdin, runs them
//! against the partition and prints results to stdout. Works both
//! interactively and scripted (pipe commands via stdin).
//!
//! ## Commands
//!
//! ```text
//! ADD stream message...    Ingest one row of `stream` stamped with the current time
//! INGEST streams rows      Ingest `rows` synthetic rows for each of `streams` streams
//! FLUSH                    Write all in-memory parts to disk
//! STATS                    Print partition counters
//! PARTS                    List live parts
//! EXIT / QUIT              Flush and shut down
//! ```
//!
//! ## Configuration
//!
//! ```text
//! SILT_DATA_DIR      partition directory (default: "data/partition")
//! SILT_*             engine tuning, see the `config` crate
//! RUST_LOG           log filter (default: "info")
//! ```
//!
//! ## Example
//!
//! ```text
//! $ cargo run -p cli
//! silt started (path=data/partition, file_parts=0, format_version=1)
//! > ADD nginx GET /index.html 200
//! OK (1 rows)
//! > FLUSH
//! OK (file_parts=1)
//! > EXIT
//! bye
//! ```

use anyhow::{bail, Context, Result};
use config::DatadbConfig;
use engine::{Datadb, DatadbStats};
use part::{Field, LogRows, TenantId};
use std::io::{self, BufRead, Write};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;
use tracing_subscriber::EnvFilter;

const STREAM_FIELD: &str = "app";

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn now_nanos() -> Result<i64> {
    let d = SystemTime::now().duration_since(UNIX_EPOCH)?;
    i64::try_from(d.as_nanos()).context("system clock is out of range")
}

fn tenant() -> TenantId {
    TenantId {
        account_id: 0,
        project_id: 0,
    }
}

fn add_row(db: &Datadb, stream: &str, msg: &str) -> Result<usize> {
    let mut lr = LogRows::new(&[STREAM_FIELD]);
    lr.must_add(
        tenant(),
        now_nanos()?,
        vec![Field::new(STREAM_FIELD, stream), Field::new("_msg", msg)],
    );
    let n = lr.len();
    db.must_add_rows(&mut lr);
    Ok(n)
}

fn ingest_synthetic(db: &Datadb, streams: usize, rows: usize) -> Result<usize> {
    if streams == 0 || rows == 0 {
        bail!("streams and rows must be positive");
    }
    let base = now_nanos()?;
    let mut lr = LogRows::new(&[STREAM_FIELD]);
    for i in 0..rows {
        for s in 0..streams {
            let level = if i % 10 == 0 { "error" } else { "info" };
            lr.must_add(
                tenant(),
                base + i as i64,
                vec![
                    Field::new(STREAM_FIELD, format!("app-{}", s)),
                    Field::new("level", level),
                    Field::new("_msg", format!("request {} served by app-{}", i, s)),
                ],
            );
        }
    }
    let n = lr.len();
    db.must_add_rows(&mut lr);
    Ok(n)
}

fn print_stats(s: &DatadbStats) {
    println!("rows              {}", s.rows_count());
    println!(
        "inmemory          parts={} rows={} blocks={} size={}/{}",
        s.inmemory_parts,
        s.inmemory_rows_count,
        s.inmemory_blocks,
        s.compressed_inmemory_size,
        s.uncompressed_inmemory_size
    );
    println!(
        "file              parts={} rows={} blocks={} size={}/{}",
        s.file_parts,
        s.file_rows_count,
        s.file_blocks,
        s.compressed_file_size,
        s.uncompressed_file_size
    );
    println!(
        "merges            inmemory={} (active {}) file={} (active {})",
        s.inmemory_merges_total,
        s.inmemory_active_merges,
        s.file_merges_total,
        s.file_active_merges
    );
    println!("parts_in_merge    {}", s.parts_in_merge);
}

fn print_parts(db: &Datadb) {
    let parts = db.acquire_parts();
    if parts.is_empty() {
        println!("(empty)");
        return;
    }
    for p in &parts {
        let name = match p.path().and_then(|p| p.file_name()) {
            Some(n) => n.to_string_lossy().into_owned(),
            None => "(in-memory)".to_string(),
        };
        let h = p.header();
        println!(
            "{} rows={} blocks={} size={} ts=[{}, {}] v{}",
            name,
            h.rows_count,
            h.blocks_count,
            h.compressed_size_bytes,
            h.min_timestamp,
            h.max_timestamp,
            h.format_version
        );
    }
    println!("({} parts)", parts.len());
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let data_dir = env_or("SILT_DATA_DIR", "data/partition");
    let cfg = DatadbConfig::from_env()?;
    let format_version = cfg.format_version;
    let db = Datadb::open(&data_dir, cfg)?;

    println!(
        "silt started (path={}, file_parts={}, format_version={})",
        data_dir,
        db.stats().file_parts,
        format_version
    );
    println!("Commands: ADD stream message | INGEST streams rows");
    println!("          FLUSH | STATS | PARTS | EXIT");
    print!("> ");
    io::stdout().flush().ok();

    let stdin = io::stdin();

    for line in stdin.lock().lines() {
        let line = line?;
        let mut parts = line.split_whitespace();
        if let Some(cmd) = parts.next() {
            match cmd.to_uppercase().as_str() {
                "ADD" => {
                    if let Some(stream) = parts.next() {
                        let msg: String = parts.collect::<Vec<&str>>().join(" ");
                        if msg.is_empty() {
                            println!("ERR usage: ADD stream message");
                        } else {
                            match add_row(&db, stream, &msg) {
                                Ok(n) => println!("OK ({} rows)", n),
                                Err(e) => println!("ERR add failed: {}", e),
                            }
                        }
                    } else {
                        println!("ERR usage: ADD stream message");
                    }
                }
                "INGEST" => {
                    let streams = parts.next().and_then(|s| s.parse::<usize>().ok());
                    let rows = parts.next().and_then(|s| s.parse::<usize>().ok());
                    match (streams, rows) {
                        (Some(streams), Some(rows)) => {
                            match ingest_synthetic(&db, streams, rows) {
                                Ok(n) => println!("OK ({} rows)", n),
                                Err(e) => println!("ERR ingest failed: {}", e),
                            }
                        }
                        _ => println!("ERR usage: INGEST streams rows"),
                    }
                }
                "FLUSH" => {
                    db.debug_flush();
                    println!("OK (file_parts={})", db.stats().file_parts);
                }
                "STATS" => print_stats(&db.stats()),
                "PARTS" => print_parts(&db),
                "EXIT" | "QUIT" => {
                    println!("bye");
                    break;
                }
                other => {
                    println!("unknown command: {}", other);
                }
            }
        }

        print!("> ");
        io::stdout().flush().ok();
    }

    info!(path = %data_dir, "closing partition");
    db.close();
    Ok(())
}
