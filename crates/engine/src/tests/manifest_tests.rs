use std::fs;

use anyhow::Result;
use tempfile::tempdir;

use crate::manifest::{Manifest, PARTS_FILENAME};

#[test]
fn missing_manifest_is_empty() -> Result<()> {
    let dir = tempdir()?;
    let m = Manifest::load_or_create(dir.path())?;
    assert!(m.part_names.is_empty());
    assert!(!dir.path().join(PARTS_FILENAME).exists());
    Ok(())
}

#[test]
fn save_and_reload_sorted() -> Result<()> {
    let dir = tempdir()?;
    let mut m = Manifest::load_or_create(dir.path())?;
    m.set_part_names(vec!["00000000000000B2".into(), "00000000000000A1".into()])?;

    let raw = fs::read_to_string(dir.path().join(PARTS_FILENAME))?;
    assert_eq!(raw, r#"["00000000000000A1","00000000000000B2"]"#);

    let m = Manifest::load_or_create(dir.path())?;
    assert_eq!(m.part_names, vec!["00000000000000A1", "00000000000000B2"]);
    assert!(m.contains("00000000000000B2"));
    assert!(!m.contains("00000000000000C3"));
    Ok(())
}

#[test]
fn save_leaves_no_tmp_file() -> Result<()> {
    let dir = tempdir()?;
    let mut m = Manifest::load_or_create(dir.path())?;
    m.set_part_names(vec!["X".into()])?;
    m.set_part_names(Vec::new())?;
    assert!(!dir.path().join("parts.json.tmp").exists());
    assert_eq!(fs::read_to_string(dir.path().join(PARTS_FILENAME))?, "[]");
    Ok(())
}

#[test]
fn corrupted_manifest_is_an_error() -> Result<()> {
    let dir = tempdir()?;
    fs::write(dir.path().join(PARTS_FILENAME), b"{not json")?;
    let err = Manifest::load_or_create(dir.path()).unwrap_err();
    assert!(format!("{:#}", err).contains("cannot parse"));
    Ok(())
}
