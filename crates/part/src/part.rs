use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use bloom::BloomFilter;

use crate::block::Block;
use crate::block_data::{BlockData, ColumnData, TimestampsData};
use crate::encoding::{decompress_block, unmarshal_timestamps};
use crate::headers::{
    BlockHeader, ColumnNames, ColumnsHeader, ColumnsHeaderIndex, IndexBlockHeader, PartHeader,
};
use crate::inmemory::InmemoryPart;
use crate::stream_id::StreamId;
use crate::streams::{
    column_filenames, part_filenames, COLUMNS_HEADER_FILENAME, COLUMNS_HEADER_INDEX_FILENAME,
    COLUMN_NAMES_FILENAME, INDEX_FILENAME, METAINDEX_FILENAME, TIMESTAMPS_FILENAME,
};

enum Storage {
    Inmemory(Arc<InmemoryPart>),
    File {
        path: PathBuf,
        files: HashMap<String, Mutex<BufReader<File>>>,
    },
}

/// An opened part, backed by memory or by a directory.
///
/// On open the part header, the metaindex and (for format v1) the column
/// name table are loaded; everything else is read on demand by offset.
/// File handles are kept open for the lifetime of the part, each wrapped in
/// a `Mutex` so reads can go through `&self`.
pub struct Part {
    header: PartHeader,
    storage: Storage,
    index_block_headers: Vec<IndexBlockHeader>,
    column_names: ColumnNames,
}

impl Part {
    /// Opens an in-memory part.
    pub fn open_inmemory(mp: Arc<InmemoryPart>) -> Result<Self> {
        let header = mp.header().clone();
        let storage = Storage::Inmemory(mp);
        Self::init(header, storage)
    }

    /// Opens the part stored in `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let header = PartHeader::read_from_dir(path)?;
        let mut files = HashMap::new();
        for name in part_filenames(header.format_version, header.bloom_values_shards_count) {
            let p = path.join(&name);
            let f = File::open(&p).with_context(|| format!("cannot open {}", p.display()))?;
            files.insert(name, Mutex::new(BufReader::new(f)));
        }
        let storage = Storage::File {
            path: path.to_path_buf(),
            files,
        };
        Self::init(header, storage)
            .with_context(|| format!("cannot open part {}", path.display()))
    }

    fn init(header: PartHeader, storage: Storage) -> Result<Self> {
        let mut part = Self {
            header,
            storage,
            index_block_headers: Vec::new(),
            column_names: ColumnNames::default(),
        };

        let metaindex = part.read_whole(METAINDEX_FILENAME)?;
        let metaindex = decompress_block(&metaindex).context("cannot decompress metaindex")?;
        part.index_block_headers = IndexBlockHeader::unmarshal_metaindex(&metaindex)?;

        if part.header.format_version >= 1 {
            let names = part.read_whole(COLUMN_NAMES_FILENAME)?;
            part.column_names =
                ColumnNames::unmarshal(&names).context("cannot read column names")?;
        }
        Ok(part)
    }

    #[must_use]
    pub fn header(&self) -> &PartHeader {
        &self.header
    }

    /// Directory of a file part.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match &self.storage {
            Storage::Inmemory(_) => None,
            Storage::File { path, .. } => Some(path),
        }
    }

    #[must_use]
    pub fn is_inmemory(&self) -> bool {
        matches!(self.storage, Storage::Inmemory(_))
    }

    /// The underlying in-memory part, if any.
    #[must_use]
    pub fn inmemory_part(&self) -> Option<&Arc<InmemoryPart>> {
        match &self.storage {
            Storage::Inmemory(mp) => Some(mp),
            Storage::File { .. } => None,
        }
    }

    #[must_use]
    pub fn index_block_headers(&self) -> &[IndexBlockHeader] {
        &self.index_block_headers
    }

    /// Index blocks that may hold blocks of `stream_id`.
    #[must_use]
    pub fn index_blocks_for_stream(&self, stream_id: &StreamId) -> &[IndexBlockHeader] {
        let ibhs = &self.index_block_headers;
        let end = ibhs.partition_point(|ibh| ibh.stream_id <= *stream_id);
        let start = ibhs[..end].partition_point(|ibh| ibh.stream_id < *stream_id);
        // The index block before the first exact match may still hold
        // blocks of the stream.
        &ibhs[start.saturating_sub(1)..end]
    }

    fn read_whole(&self, name: &str) -> Result<Vec<u8>> {
        match &self.storage {
            Storage::Inmemory(mp) => match mp.file(name) {
                Some(data) => Ok(data.to_vec()),
                None => bail!("in-memory part has no {}", name),
            },
            Storage::File { path, files } => {
                let mut f = lock_file(files, name, path)?;
                let mut buf = Vec::new();
                f.seek(SeekFrom::Start(0))?;
                f.read_to_end(&mut buf)
                    .with_context(|| format!("cannot read {}", path.join(name).display()))?;
                Ok(buf)
            }
        }
    }

    /// Reads `size` bytes at `offset` of stream `name`.
    pub fn read_range(&self, name: &str, offset: u64, size: u64) -> Result<Vec<u8>> {
        match &self.storage {
            Storage::Inmemory(mp) => {
                let data = match mp.file(name) {
                    Some(data) => data,
                    None => bail!("in-memory part has no {}", name),
                };
                let end = offset.checked_add(size).unwrap_or(u64::MAX);
                if end > data.len() as u64 {
                    bail!(
                        "range {}..{} is out of bounds of {} ({} bytes)",
                        offset,
                        end,
                        name,
                        data.len()
                    );
                }
                Ok(data[offset as usize..end as usize].to_vec())
            }
            Storage::File { path, files } => {
                let mut f = lock_file(files, name, path)?;
                let mut buf = vec![0u8; size as usize];
                f.seek(SeekFrom::Start(offset))?;
                f.read_exact(&mut buf).with_context(|| {
                    format!(
                        "cannot read {} bytes at offset {} of {}",
                        size,
                        offset,
                        path.join(name).display()
                    )
                })?;
                Ok(buf)
            }
        }
    }

    // -------------------- Headers --------------------

    /// Decodes the block headers of one index block.
    pub fn read_block_headers(&self, ibh: &IndexBlockHeader) -> Result<Vec<BlockHeader>> {
        let data = self.read_range(INDEX_FILENAME, ibh.index_block_offset, ibh.index_block_size)?;
        let data = decompress_block(&data).context("cannot decompress index block")?;
        BlockHeader::unmarshal_all(&data, self.header.format_version)
    }

    /// Reads the columns header of a block, names resolved.
    pub fn read_columns_header(&self, bh: &BlockHeader) -> Result<ColumnsHeader> {
        let data = self.read_range(
            COLUMNS_HEADER_FILENAME,
            bh.columns_header_offset,
            bh.columns_header_size,
        )?;
        if self.header.format_version == 0 {
            return ColumnsHeader::unmarshal_v0(&data);
        }
        let index = self.read_range(
            COLUMNS_HEADER_INDEX_FILENAME,
            bh.columns_header_index_offset,
            bh.columns_header_index_size,
        )?;
        let index = ColumnsHeaderIndex::unmarshal(&index)?;
        ColumnsHeader::unmarshal_v1(&data, &index, self.column_names.names())
    }

    // -------------------- Block contents --------------------

    /// Reads the encoded block as stored.
    pub fn read_block_data(&self, bh: &BlockHeader) -> Result<BlockData> {
        let th = &bh.timestamps_header;
        let ts = self.read_range(TIMESTAMPS_FILENAME, th.block_offset, th.block_size)?;
        let csh = self.read_columns_header(bh)?;

        let mut columns_data = Vec::with_capacity(csh.column_headers.len());
        for ch in csh.column_headers {
            let (values_file, bloom_file) = self.column_filenames(&ch.name);
            let values_data = self.read_range(&values_file, ch.values_offset, ch.values_size)?;
            let bloom_filter_data =
                self.read_range(&bloom_file, ch.bloom_filter_offset, ch.bloom_filter_size)?;
            columns_data.push(ColumnData {
                name: ch.name,
                value_type: ch.value_type,
                min_value: ch.min_value,
                max_value: ch.max_value,
                dict: ch.dict,
                values_data,
                bloom_filter_data,
            });
        }

        Ok(BlockData {
            stream_id: bh.stream_id,
            uncompressed_size_bytes: bh.uncompressed_size_bytes,
            rows_count: bh.rows_count,
            timestamps_data: TimestampsData {
                data: ts,
                marshal_type: th.marshal_type,
                min_timestamp: th.min_timestamp,
                max_timestamp: th.max_timestamp,
            },
            columns_data,
            const_columns: csh.const_columns,
        })
    }

    /// Reads and decodes a whole block.
    pub fn read_block(&self, bh: &BlockHeader) -> Result<Block> {
        self.read_block_data(bh)?.to_block()
    }

    pub fn read_timestamps(&self, bh: &BlockHeader) -> Result<Vec<i64>> {
        let th = &bh.timestamps_header;
        let data = self.read_range(TIMESTAMPS_FILENAME, th.block_offset, th.block_size)?;
        unmarshal_timestamps(&data, th.marshal_type, bh.rows_count as usize)
    }

    /// Values of column `name` in the block, one per row. Returns `None` if
    /// the block has no such column.
    pub fn read_column_values(&self, bh: &BlockHeader, name: &str) -> Result<Option<Vec<String>>> {
        let csh = self.read_columns_header(bh)?;
        if let Some(f) = csh.find_const_column(name) {
            return Ok(Some(vec![f.value.clone(); bh.rows_count as usize]));
        }
        let ch = match csh.find_column(name) {
            Some(ch) => ch,
            None => return Ok(None),
        };
        let (values_file, _) = self.column_filenames(name);
        let cd = ColumnData {
            name: ch.name.clone(),
            value_type: ch.value_type,
            dict: ch.dict.clone(),
            values_data: self.read_range(&values_file, ch.values_offset, ch.values_size)?,
            ..Default::default()
        };
        cd.decode_values(bh.rows_count as usize).map(Some)
    }

    /// Bloom filter of column `name` in the block. Returns `None` when the
    /// column is missing, const, or dictionary encoded.
    pub fn read_bloom_filter(&self, bh: &BlockHeader, name: &str) -> Result<Option<BloomFilter>> {
        let csh = self.read_columns_header(bh)?;
        let ch = match csh.find_column(name) {
            Some(ch) if ch.value_type.has_bloom_filter() => ch,
            _ => return Ok(None),
        };
        let (_, bloom_file) = self.column_filenames(name);
        let data = self.read_range(&bloom_file, ch.bloom_filter_offset, ch.bloom_filter_size)?;
        let bf = BloomFilter::unmarshal(&data)
            .with_context(|| format!("cannot decode bloom filter of column {:?}", name))?;
        Ok(Some(bf))
    }

    fn column_filenames(&self, name: &str) -> (String, String) {
        column_filenames(
            name,
            self.header.format_version,
            self.header.bloom_values_shards_count,
        )
    }
}

fn lock_file<'a>(
    files: &'a HashMap<String, Mutex<BufReader<File>>>,
    name: &str,
    path: &Path,
) -> Result<std::sync::MutexGuard<'a, BufReader<File>>> {
    match files.get(name) {
        Some(m) => m.lock().map_err(|e| anyhow::anyhow!("lock poisoned: {}", e)),
        None => bail!("part {} has no {}", path.display(), name),
    }
}

impl fmt::Debug for Part {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Part")
            .field("path", &self.path())
            .field("rows", &self.header.rows_count)
            .field("blocks", &self.header.blocks_count)
            .field("format_version", &self.header.format_version)
            .finish()
    }
}
