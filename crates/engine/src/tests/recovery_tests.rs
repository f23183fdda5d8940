use std::fs;

use anyhow::Result;
use tempfile::tempdir;

use super::helpers::*;
use crate::*;

#[test]
fn open_creates_empty_partition() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("p");
    let db = Datadb::open(&path, test_config())?;

    assert_eq!(fs::read_to_string(path.join(PARTS_FILENAME))?, "[]");
    assert_eq!(db.stats(), DatadbStats::default());
    assert!(part_dirs(&path).is_empty());
    Ok(())
}

#[test]
fn open_removes_tmp_entries() -> Result<()> {
    let dir = tempdir()?;
    {
        let db = Datadb::open(dir.path(), test_config())?;
        db.must_add_rows(&mut log_rows(2, 5, 0));
        db.debug_flush();
    }
    fs::create_dir(dir.path().join("00000000000000FF.tmp"))?;
    fs::write(dir.path().join("00000000000000FF.tmp").join("junk"), b"x")?;
    fs::write(dir.path().join("parts.json.tmp"), b"[\"garbage")?;

    let db = Datadb::open(dir.path(), test_config())?;
    assert!(!dir.path().join("00000000000000FF.tmp").exists());
    assert!(!dir.path().join("parts.json.tmp").exists());
    assert_eq!(db.stats().file_rows_count, 10);
    Ok(())
}

#[test]
fn open_removes_unlisted_dirs() -> Result<()> {
    let dir = tempdir()?;
    {
        let db = Datadb::open(dir.path(), test_config())?;
        db.must_add_rows(&mut log_rows(1, 5, 0));
        db.debug_flush();
    }
    let listed = part_dirs(dir.path());
    assert_eq!(listed.len(), 1);

    // A part written but not yet published when the process died.
    fs::create_dir(dir.path().join("0000000000000ABC"))?;

    let db = Datadb::open(dir.path(), test_config())?;
    assert_eq!(part_dirs(dir.path()), listed);
    assert_eq!(db.stats().file_parts, 1);
    Ok(())
}

#[test]
fn listed_part_missing_on_disk_fails_open() -> Result<()> {
    let dir = tempdir()?;
    fs::write(dir.path().join(PARTS_FILENAME), b"[\"0000000000000001\"]")?;

    let err = Datadb::open(dir.path(), test_config()).unwrap_err();
    assert!(
        err.to_string().contains("missing on disk"),
        "unexpected error: {err:#}"
    );
    Ok(())
}

#[test]
fn corrupted_parts_file_fails_open() -> Result<()> {
    let dir = tempdir()?;
    fs::write(dir.path().join(PARTS_FILENAME), b"{not json")?;
    assert!(Datadb::open(dir.path(), test_config()).is_err());
    Ok(())
}

#[test]
fn new_part_names_sort_after_existing_ones() -> Result<()> {
    let dir = tempdir()?;
    {
        let db = Datadb::open(dir.path(), test_config())?;
        db.must_add_rows(&mut log_rows(1, 5, 0));
        db.debug_flush();
    }

    // Pretend a clock far in the future named the existing part.
    let old = part_dirs(dir.path()).remove(0);
    let future = "7FFFFFFFFFFFFFF0";
    fs::rename(dir.path().join(&old), dir.path().join(future))?;
    fs::write(
        dir.path().join(PARTS_FILENAME),
        format!("[\"{}\"]", future),
    )?;

    let db = Datadb::open(dir.path(), test_config())?;
    db.must_add_rows(&mut log_rows(1, 5, 100));
    db.debug_flush();

    let names = part_dirs(dir.path());
    assert_eq!(names, vec![future.to_string(), "7FFFFFFFFFFFFFF1".to_string()]);
    assert_eq!(db.stats().file_rows_count, 10);
    Ok(())
}

#[test]
fn reopened_parts_are_merged_by_startup_workers() -> Result<()> {
    let dir = tempdir()?;
    {
        let db = Datadb::open(dir.path(), test_config())?;
        for i in 0..10 {
            db.must_add_rows(&mut log_rows(2, 10, i * 1000));
            db.debug_flush();
        }
        assert_eq!(db.stats().file_parts, 10);
    }

    let db = Datadb::open(dir.path(), test_config())?;
    assert!(
        wait_until(std::time::Duration::from_secs(30), || {
            let s = db.stats();
            s.file_parts < 10 && s.parts_in_merge == 0
        }),
        "startup workers didn't merge: {:?}",
        db.stats()
    );
    assert_eq!(db.stats().file_rows_count, 200);
    Ok(())
}

#[test]
fn legacy_format_round_trips_through_disk() -> Result<()> {
    let dir = tempdir()?;
    let cfg = test_config().format_version(0);
    let expected = {
        let db = Datadb::open(dir.path(), cfg.clone())?;
        for i in 0..3 {
            db.must_add_rows(&mut log_rows(3, 10, i * 1000));
        }
        let keys = all_row_keys(&db)?;
        db.close();
        keys
    };

    let db = Datadb::open(dir.path(), cfg)?;
    let parts = db.acquire_parts();
    assert_eq!(parts.len(), 1);
    assert_eq!(parts[0].header().format_version, 0);
    drop(parts);
    assert_eq!(all_row_keys(&db)?, expected);
    Ok(())
}
