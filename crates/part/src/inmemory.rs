use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};

use crate::headers::PartHeader;
use crate::rows::{uncompressed_row_size_bytes, LogRows};
use crate::writer::{BlockStreamWriter, FinishedPart};
use crate::{sync_dir, MAX_UNCOMPRESSED_BLOCK_SIZE};

/// A part whose streams live in memory.
///
/// Produced from freshly ingested rows or by merging small parts; flushed to
/// disk either through a merge or directly via
/// [`store_to_disk`](InmemoryPart::store_to_disk).
#[derive(Debug, Clone)]
pub struct InmemoryPart {
    header: PartHeader,
    files: BTreeMap<String, Vec<u8>>,
}

impl InmemoryPart {
    pub(crate) fn new(header: PartHeader, files: BTreeMap<String, Vec<u8>>) -> Self {
        Self { header, files }
    }

    /// Encodes `lr` into a new part. Rows are sorted by (stream id,
    /// timestamp) first; each stream's rows are cut into blocks of about
    /// [`MAX_UNCOMPRESSED_BLOCK_SIZE`].
    pub fn from_log_rows(lr: &mut LogRows, format_version: u32) -> Result<Self> {
        lr.sort();
        let mut bsw = BlockStreamWriter::create_inmemory(format_version);

        let sids = lr.stream_ids();
        let timestamps = lr.timestamps();
        let rows = lr.rows();
        let mut start = 0;
        let mut size = 0u64;
        for i in 0..rows.len() {
            if i > start && (sids[i] != sids[start] || size >= MAX_UNCOMPRESSED_BLOCK_SIZE) {
                bsw.write_rows(sids[start], &timestamps[start..i], &rows[start..i])?;
                start = i;
                size = 0;
            }
            size += uncompressed_row_size_bytes(&rows[i]);
        }
        if start < rows.len() {
            bsw.write_rows(sids[start], &timestamps[start..], &rows[start..])?;
        }

        match bsw.finalize()? {
            FinishedPart::Inmemory(mp) => Ok(mp),
            FinishedPart::File(_) => unreachable!("in-memory writer produced a file part"),
        }
    }

    #[must_use]
    pub fn header(&self) -> &PartHeader {
        &self.header
    }

    /// Contents of stream `name`, if the part has it.
    #[must_use]
    pub fn file(&self, name: &str) -> Option<&[u8]> {
        self.files.get(name).map(Vec::as_slice)
    }

    /// Writes the part into `dir` without re-encoding it, recording
    /// `applied_seq` in its header. The directory must not exist yet.
    pub fn store_to_disk(&self, dir: &Path, applied_seq: u64) -> Result<()> {
        fs::create_dir(dir)
            .with_context(|| format!("cannot create part directory {}", dir.display()))?;
        for (name, data) in &self.files {
            let path = dir.join(name);
            let mut f =
                File::create(&path).with_context(|| format!("cannot create {}", path.display()))?;
            f.write_all(data)
                .with_context(|| format!("cannot write {}", path.display()))?;
            f.sync_all()
                .with_context(|| format!("cannot fsync {}", path.display()))?;
        }
        let header = PartHeader {
            applied_seq,
            ..self.header.clone()
        };
        header.write_to_dir(dir)?;
        sync_dir(dir);
        Ok(())
    }
}
