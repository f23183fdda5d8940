/// Integration tests for the silt CLI
/// Tests cover: ingestion, flushes, part listing, stats, restarts, bad input
use std::fs;
use std::path::Path;
use tempfile::tempdir;

/// Helper to run CLI commands and capture stdout
fn run_cli_command(data_dir: &Path, command: &str) -> String {
    use std::io::Write;
    use std::process::{Command, Stdio};

    let mut child = Command::new(env!("CARGO_BIN_EXE_silt"))
        .env("SILT_DATA_DIR", data_dir.to_str().unwrap())
        .env("SILT_FLUSH_INTERVAL_MS", "3600000") // only explicit flushes
        .env("SILT_MIN_FREE_DISK_MB", "0")
        .env("RUST_LOG", "warn")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("Failed to spawn CLI");

    {
        let stdin = child.stdin.as_mut().expect("Failed to open stdin");
        stdin
            .write_all(command.as_bytes())
            .expect("Failed to write to stdin");
        stdin.write_all(b"EXIT\n").expect("Failed to write EXIT");
    }

    let output = child.wait_with_output().expect("Failed to read output");
    assert!(
        output.status.success(),
        "CLI failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).to_string()
}

/// Part directory names under `data_dir`.
fn part_dirs(data_dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(data_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[test]
fn test_startup_creates_partition() {
    let dir = tempdir().unwrap();
    let data_dir = dir.path().join("p");

    let output = run_cli_command(&data_dir, "");

    assert!(output.contains("silt started"));
    assert!(output.contains("bye"));
    assert_eq!(fs::read_to_string(data_dir.join("parts.json")).unwrap(), "[]");
}

#[test]
fn test_add_and_stats() {
    let dir = tempdir().unwrap();

    let output = run_cli_command(
        dir.path(),
        "ADD nginx GET /index.html 200\nADD nginx GET /about 404\nSTATS\n",
    );

    assert_eq!(output.matches("OK (1 rows)").count(), 2);
    assert!(output.contains("rows              2"));
}

#[test]
fn test_add_usage_errors() {
    let dir = tempdir().unwrap();

    let output = run_cli_command(dir.path(), "ADD\nADD nginx\n");

    assert_eq!(output.matches("ERR usage: ADD stream message").count(), 2);
}

#[test]
fn test_ingest_and_flush_writes_part() {
    let dir = tempdir().unwrap();

    let output = run_cli_command(dir.path(), "INGEST 3 100\nFLUSH\nPARTS\n");

    assert!(output.contains("OK (300 rows)"));
    assert!(output.contains("OK (file_parts=1)"));
    assert!(output.contains("rows=300"));
    assert!(output.contains("(1 parts)"));

    let dirs = part_dirs(dir.path());
    assert_eq!(dirs.len(), 1);
    assert_eq!(dirs[0].len(), 16);
    assert!(output.contains(&dirs[0]));
}

#[test]
fn test_ingest_rejects_bad_arguments() {
    let dir = tempdir().unwrap();

    let output = run_cli_command(dir.path(), "INGEST\nINGEST x 5\nINGEST 0 5\n");

    assert_eq!(output.matches("ERR usage: INGEST streams rows").count(), 2);
    assert!(output.contains("ERR ingest failed"));
}

#[test]
fn test_parts_lists_inmemory_parts() {
    let dir = tempdir().unwrap();

    let output = run_cli_command(dir.path(), "PARTS\nINGEST 2 10\nPARTS\n");

    assert!(output.contains("(empty)"));
    assert!(output.contains("(in-memory) rows=20"));
}

#[test]
fn test_exit_flushes_inmemory_parts() {
    let dir = tempdir().unwrap();

    run_cli_command(dir.path(), "INGEST 2 50\nADD api started\n");

    assert!(!part_dirs(dir.path()).is_empty());
    let output = run_cli_command(dir.path(), "STATS\n");
    assert!(output.contains("rows              101"));
}

#[test]
fn test_persistence_across_restarts() {
    let dir = tempdir().unwrap();

    run_cli_command(dir.path(), "INGEST 4 25\nFLUSH\n");
    run_cli_command(dir.path(), "INGEST 4 25\nFLUSH\n");

    let output = run_cli_command(dir.path(), "STATS\nPARTS\n");
    assert!(output.contains("rows              200"));
    assert!(output.contains("silt started"));
}

#[test]
fn test_many_batches_get_merged() {
    let dir = tempdir().unwrap();

    let mut commands = String::new();
    for _ in 0..40 {
        commands.push_str("INGEST 2 5\n");
    }
    commands.push_str("STATS\n");

    let output = run_cli_command(dir.path(), &commands);

    assert_eq!(output.matches("OK (10 rows)").count(), 40);
    assert!(output.contains("rows              400"));
}

#[test]
fn test_unknown_command() {
    let dir = tempdir().unwrap();

    let output = run_cli_command(dir.path(), "SELECT *\n");

    assert!(output.contains("unknown command: SELECT"));
}

#[test]
fn test_quit_command() {
    let dir = tempdir().unwrap();

    let output = run_cli_command(dir.path(), "QUIT\nADD never runs\n");

    assert!(output.contains("bye"));
    assert!(!output.contains("OK (1 rows)"));
}
