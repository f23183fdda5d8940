//! Named byte streams a part is made of, backed by memory or files.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub const METADATA_FILENAME: &str = "metadata.json";
pub const METAINDEX_FILENAME: &str = "metaindex.bin";
pub const INDEX_FILENAME: &str = "index.bin";
pub const COLUMNS_HEADER_FILENAME: &str = "columns_header.bin";
pub const COLUMNS_HEADER_INDEX_FILENAME: &str = "columns_header_index.bin";
pub const COLUMN_NAMES_FILENAME: &str = "column_names.bin";
pub const TIMESTAMPS_FILENAME: &str = "timestamps.bin";
pub const MESSAGE_VALUES_FILENAME: &str = "message_values.bin";
pub const MESSAGE_BLOOM_FILENAME: &str = "message_bloom.bin";
const FIELD_VALUES_FILENAME: &str = "field_values.bin";
const FIELD_BLOOM_FILENAME: &str = "field_bloom.bin";

/// Number of field values/bloom file pairs in format v1 parts.
pub const BLOOM_VALUES_SHARDS_COUNT: u64 = 8;

/// Number of field values/bloom shards for parts of `format_version`.
pub(crate) fn shards_count_for(format_version: u32) -> u64 {
    if format_version == 0 {
        1
    } else {
        BLOOM_VALUES_SHARDS_COUNT
    }
}

/// Names of the values and bloom files holding column `name`.
pub(crate) fn column_filenames(name: &str, format_version: u32, shards_count: u64) -> (String, String) {
    if name.is_empty() {
        return (
            MESSAGE_VALUES_FILENAME.to_string(),
            MESSAGE_BLOOM_FILENAME.to_string(),
        );
    }
    if format_version == 0 {
        return (
            FIELD_VALUES_FILENAME.to_string(),
            FIELD_BLOOM_FILENAME.to_string(),
        );
    }
    let shard = bloom::hash64(name.as_bytes()) % shards_count.max(1);
    (
        format!("{}.{}", FIELD_VALUES_FILENAME, shard),
        format!("{}.{}", FIELD_BLOOM_FILENAME, shard),
    )
}

/// Every stream file of a part, `metadata.json` excluded.
pub(crate) fn part_filenames(format_version: u32, shards_count: u64) -> Vec<String> {
    let mut names: Vec<String> = [
        METAINDEX_FILENAME,
        INDEX_FILENAME,
        COLUMNS_HEADER_FILENAME,
        TIMESTAMPS_FILENAME,
        MESSAGE_VALUES_FILENAME,
        MESSAGE_BLOOM_FILENAME,
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    if format_version == 0 {
        names.push(FIELD_VALUES_FILENAME.to_string());
        names.push(FIELD_BLOOM_FILENAME.to_string());
        return names;
    }
    names.push(COLUMNS_HEADER_INDEX_FILENAME.to_string());
    names.push(COLUMN_NAMES_FILENAME.to_string());
    for shard in 0..shards_count {
        names.push(format!("{}.{}", FIELD_VALUES_FILENAME, shard));
        names.push(format!("{}.{}", FIELD_BLOOM_FILENAME, shard));
    }
    names
}

/// An append-only stream that knows how many bytes it holds.
enum StreamWriter {
    Memory(Vec<u8>),
    File {
        w: BufWriter<File>,
        path: PathBuf,
        written: u64,
    },
}

impl StreamWriter {
    fn create_file(path: PathBuf) -> Result<Self> {
        let f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .with_context(|| format!("cannot create {}", path.display()))?;
        Ok(Self::File {
            w: BufWriter::new(f),
            path,
            written: 0,
        })
    }

    /// Appends `data`, returning the offset it was written at.
    fn write(&mut self, data: &[u8]) -> Result<u64> {
        match self {
            Self::Memory(buf) => {
                let offset = buf.len() as u64;
                buf.extend_from_slice(data);
                Ok(offset)
            }
            Self::File { w, path, written } => {
                let offset = *written;
                w.write_all(data)
                    .with_context(|| format!("cannot write to {}", path.display()))?;
                *written += data.len() as u64;
                Ok(offset)
            }
        }
    }

    fn bytes_written(&self) -> u64 {
        match self {
            Self::Memory(buf) => buf.len() as u64,
            Self::File { written, .. } => *written,
        }
    }

    /// Flushes and fsyncs file streams; returns the buffer of memory streams.
    fn finish(self) -> Result<Vec<u8>> {
        match self {
            Self::Memory(buf) => Ok(buf),
            Self::File { w, path, .. } => {
                let f = w
                    .into_inner()
                    .map_err(|e| e.into_error())
                    .with_context(|| format!("cannot flush {}", path.display()))?;
                f.sync_all()
                    .with_context(|| format!("cannot fsync {}", path.display()))?;
                Ok(Vec::new())
            }
        }
    }
}

/// The full set of streams of a part being written.
pub(crate) struct PartStreams {
    dir: Option<PathBuf>,
    format_version: u32,
    shards_count: u64,
    writers: BTreeMap<String, StreamWriter>,
}

impl PartStreams {
    pub(crate) fn inmemory(format_version: u32) -> Self {
        let shards_count = shards_count_for(format_version);
        let writers = part_filenames(format_version, shards_count)
            .into_iter()
            .map(|name| (name, StreamWriter::Memory(Vec::new())))
            .collect();
        Self {
            dir: None,
            format_version,
            shards_count,
            writers,
        }
    }

    /// Creates `dir` and every stream file inside it.
    pub(crate) fn create_in_dir(dir: &Path, format_version: u32) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("cannot create part directory {}", dir.display()))?;
        let shards_count = shards_count_for(format_version);
        let mut writers = BTreeMap::new();
        for name in part_filenames(format_version, shards_count) {
            let w = StreamWriter::create_file(dir.join(&name))?;
            writers.insert(name, w);
        }
        Ok(Self {
            dir: Some(dir.to_path_buf()),
            format_version,
            shards_count,
            writers,
        })
    }

    pub(crate) fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub(crate) fn shards_count(&self) -> u64 {
        self.shards_count
    }

    pub(crate) fn column_filenames(&self, name: &str) -> (String, String) {
        column_filenames(name, self.format_version, self.shards_count)
    }

    /// Appends `data` to stream `name`, returning its offset.
    pub(crate) fn write(&mut self, name: &str, data: &[u8]) -> Result<u64> {
        match self.writers.get_mut(name) {
            Some(w) => w.write(data),
            None => panic!("BUG: part has no stream named {:?}", name),
        }
    }

    pub(crate) fn total_bytes_written(&self) -> u64 {
        self.writers.values().map(StreamWriter::bytes_written).sum()
    }

    /// Finishes all streams. Memory streams are returned by name; file
    /// streams are flushed and fsynced.
    pub(crate) fn finish(self) -> Result<BTreeMap<String, Vec<u8>>> {
        let mut files = BTreeMap::new();
        let is_inmemory = self.dir.is_none();
        for (name, w) in self.writers {
            let data = w.finish()?;
            if is_inmemory {
                files.insert(name, data);
            }
        }
        Ok(files)
    }
}
