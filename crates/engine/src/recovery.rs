/// Cold-start path: cleaning up after an unclean shutdown and opening the
/// file parts listed in `parts.json`.
use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

use part::Part;

use crate::manifest::{Manifest, PARTS_FILENAME};
use crate::part_wrapper::PartWrapper;

/// Removes `*.tmp` entries left by interrupted merges and manifest writes.
pub(crate) fn remove_tmp_dirs(dir: &Path) -> Result<()> {
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if !name.to_string_lossy().ends_with(".tmp") {
            continue;
        }
        let p = entry.path();
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(&p)
        } else {
            fs::remove_file(&p)
        }
        .with_context(|| format!("cannot remove {}", p.display()))?;
        removed += 1;
    }
    if removed > 0 {
        info!(path = %dir.display(), removed, "removed temporary entries");
        part::sync_dir(dir);
    }
    Ok(())
}

/// Removes part directories that `parts.json` doesn't list.
pub(crate) fn remove_unlisted_dirs(dir: &Path, manifest: &Manifest) -> Result<()> {
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        if manifest.contains(&name.to_string_lossy()) {
            continue;
        }
        let p = entry.path();
        fs::remove_dir_all(&p).with_context(|| format!("cannot remove {}", p.display()))?;
        removed += 1;
    }
    if removed > 0 {
        info!(path = %dir.display(), removed, "removed unlisted part directories");
        part::sync_dir(dir);
    }
    Ok(())
}

/// Opens every part listed in `parts.json`.
pub(crate) fn open_file_parts(dir: &Path, manifest: &Manifest) -> Result<Vec<Arc<PartWrapper>>> {
    let mut pws = Vec::with_capacity(manifest.part_names.len());
    for name in &manifest.part_names {
        let p = dir.join(name);
        if !p.exists() {
            let parts_file = dir.join(PARTS_FILENAME);
            bail!(
                "part {} is listed in {} but is missing on disk; make sure {} isn't corrupted",
                p.display(),
                parts_file.display(),
                parts_file.display()
            );
        }
        let part = Part::open(&p)?;
        pws.push(PartWrapper::new(part, None));
    }
    Ok(pws)
}

/// First merge index: the current time in nanoseconds, or past the largest
/// existing part name if the clock is behind it.
pub(crate) fn initial_merge_idx(manifest: &Manifest) -> Result<u64> {
    let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_nanos() as u64;
    let max_existing = manifest
        .part_names
        .iter()
        .filter_map(|n| u64::from_str_radix(n, 16).ok())
        .max()
        .unwrap_or(0);
    Ok(now.max(max_existing))
}
