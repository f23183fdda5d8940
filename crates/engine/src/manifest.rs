//! # parts.json - the list of live file parts
//!
//! A partition directory holds one subdirectory per file part plus
//! `parts.json`, a JSON array with the names of the parts that belong to
//! the partition:
//!
//! ```text
//! ["17F2A9C4D1E00001","17F2A9C4D1E00002"]
//! ```
//!
//! Directories missing from the list are leftovers of an interrupted merge
//! and are removed on open. A listed directory that is missing means the
//! partition is damaged.
//!
//! The file is rewritten atomically: write `parts.json.tmp`, fsync, rename
//! over `parts.json`, fsync the directory.

use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const PARTS_FILENAME: &str = "parts.json";

const PARTS_TMP_FILENAME: &str = "parts.json.tmp";

#[derive(Debug, Clone)]
pub struct Manifest {
    path: PathBuf,
    /// Part directory names, sorted.
    pub part_names: Vec<String>,
}

impl Manifest {
    /// Loads `dir/parts.json`, or starts an empty list if it doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_or_create(dir: &Path) -> Result<Self> {
        let path = dir.join(PARTS_FILENAME);
        if !path.exists() {
            return Ok(Self {
                path,
                part_names: Vec::new(),
            });
        }
        let data =
            fs::read(&path).with_context(|| format!("cannot read {}", path.display()))?;
        let mut part_names: Vec<String> = serde_json::from_slice(&data)
            .with_context(|| format!("cannot parse {}", path.display()))?;
        part_names.sort();
        Ok(Self { path, part_names })
    }

    /// Replaces the list and persists it.
    pub fn set_part_names(&mut self, mut names: Vec<String>) -> Result<()> {
        names.sort();
        self.part_names = names;
        self.save()
    }

    /// Persists the list to disk.
    pub fn save(&self) -> Result<()> {
        let data = serde_json::to_vec(&self.part_names)?;
        let tmp_path = self.path.with_file_name(PARTS_TMP_FILENAME);
        {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)
                .with_context(|| format!("cannot create {}", tmp_path.display()))?;
            f.write_all(&data)?;
            f.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path).with_context(|| {
            format!(
                "cannot rename {} to {}",
                tmp_path.display(),
                self.path.display()
            )
        })?;
        if let Some(parent) = self.path.parent() {
            part::sync_dir(parent);
        }
        Ok(())
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.part_names.binary_search_by(|n| n.as_str().cmp(name)).is_ok()
    }
}
