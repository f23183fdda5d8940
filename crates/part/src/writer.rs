use std::path::Path;

use anyhow::{Context, Result};

use crate::block::Block;
use crate::block_data::BlockData;
use crate::encoding::compress_block;
use crate::headers::{
    BlockHeader, ColumnHeader, ColumnNames, ColumnsHeader, IndexBlockHeader, PartHeader,
    TimestampsHeader,
};
use crate::inmemory::InmemoryPart;
use crate::rows::Field;
use crate::stream_id::StreamId;
use crate::streams::{
    PartStreams, COLUMNS_HEADER_FILENAME, COLUMNS_HEADER_INDEX_FILENAME, COLUMN_NAMES_FILENAME,
    INDEX_FILENAME, METAINDEX_FILENAME, TIMESTAMPS_FILENAME,
};
use crate::{
    sync_dir, MAX_BLOOM_FILTER_BLOCK_SIZE, MAX_COLUMNS_HEADER_SIZE, MAX_COLUMNS_PER_BLOCK,
    MAX_INDEX_BLOCK_SIZE, MAX_TIMESTAMPS_BLOCK_SIZE, MAX_UNCOMPRESSED_INDEX_BLOCK_SIZE,
    MAX_VALUES_BLOCK_SIZE,
};

/// The result of [`BlockStreamWriter::finalize`].
#[derive(Debug)]
pub enum FinishedPart {
    Inmemory(InmemoryPart),
    /// The part was written to its directory; the header is also stored
    /// there as `metadata.json`.
    File(PartHeader),
}

impl FinishedPart {
    #[must_use]
    pub fn header(&self) -> &PartHeader {
        match self {
            Self::Inmemory(mp) => mp.header(),
            Self::File(ph) => ph,
        }
    }
}

/// Writes blocks into a new part, in memory or in a directory.
///
/// Blocks must arrive ordered by stream id, then by min timestamp. Block
/// headers are buffered into index blocks, which are compressed and flushed
/// once they exceed [`MAX_UNCOMPRESSED_INDEX_BLOCK_SIZE`]; the metaindex of
/// all index blocks is written by [`finalize`](BlockStreamWriter::finalize).
///
/// Ordering and size violations panic: they are caller bugs, not
/// environmental failures.
pub struct BlockStreamWriter {
    format_version: u32,
    streams: PartStreams,
    column_names: ColumnNames,

    index_block_buf: Vec<u8>,
    index_block_header: IndexBlockHeader,
    has_pending_index_block: bool,
    metaindex_buf: Vec<u8>,

    prev: Option<(StreamId, i64)>,
    header: PartHeader,
}

impl BlockStreamWriter {
    /// Starts an in-memory part.
    pub fn create_inmemory(format_version: u32) -> Self {
        Self::new(PartStreams::inmemory(format_version), format_version)
    }

    /// Starts a part in `dir`, creating the directory and its files.
    pub fn create_file(dir: &Path, format_version: u32) -> Result<Self> {
        let streams = PartStreams::create_in_dir(dir, format_version)?;
        Ok(Self::new(streams, format_version))
    }

    fn new(streams: PartStreams, format_version: u32) -> Self {
        assert!(
            format_version <= config::LATEST_FORMAT_VERSION,
            "BUG: cannot write parts in unknown format version {}",
            format_version
        );
        Self {
            format_version,
            header: PartHeader {
                min_timestamp: i64::MAX,
                max_timestamp: i64::MIN,
                format_version,
                bloom_values_shards_count: if format_version == 0 {
                    0
                } else {
                    streams.shards_count()
                },
                ..Default::default()
            },
            streams,
            column_names: ColumnNames::default(),
            index_block_buf: Vec::new(),
            index_block_header: IndexBlockHeader::default(),
            has_pending_index_block: false,
            metaindex_buf: Vec::new(),
            prev: None,
        }
    }

    /// Sets the applied sequence stored in the part header.
    pub fn set_applied_seq(&mut self, seq: u64) {
        self.header.applied_seq = seq;
    }

    #[must_use]
    pub fn rows_count(&self) -> u64 {
        self.header.rows_count
    }

    /// Writes sorted rows of one stream, splitting them into several blocks
    /// if they use more distinct columns than a block may hold.
    pub fn write_rows(
        &mut self,
        stream_id: StreamId,
        timestamps: &[i64],
        rows: &[Vec<Field>],
    ) -> Result<()> {
        let mut start = 0;
        while start < rows.len() {
            let (block, n) = Block::from_rows(&timestamps[start..], &rows[start..]);
            self.write_block(stream_id, &block)?;
            start += n;
        }
        Ok(())
    }

    pub fn write_block(&mut self, stream_id: StreamId, block: &Block) -> Result<()> {
        if block.is_empty() {
            return Ok(());
        }
        let ts = block.timestamps();
        if let Some(i) = ts.windows(2).position(|w| w[0] > w[1]) {
            panic!(
                "BUG: block of stream {} breaks timestamp order at row {}: {} > {}",
                stream_id,
                i + 1,
                ts[i],
                ts[i + 1]
            );
        }
        let bd = BlockData::from_block(stream_id, block);
        self.write_block_data(&bd)
    }

    /// Writes an already encoded block as is.
    pub fn write_block_data(&mut self, bd: &BlockData) -> Result<()> {
        if bd.rows_count == 0 {
            return Ok(());
        }
        let ts = &bd.timestamps_data;
        self.check_order(bd.stream_id, ts.min_timestamp);
        assert!(
            bd.columns_count() <= MAX_COLUMNS_PER_BLOCK,
            "BUG: block of stream {} has {} columns; the limit is {}",
            bd.stream_id,
            bd.columns_count(),
            MAX_COLUMNS_PER_BLOCK
        );
        assert!(
            ts.data.len() <= MAX_TIMESTAMPS_BLOCK_SIZE,
            "BUG: timestamps block of {} bytes exceeds {} bytes",
            ts.data.len(),
            MAX_TIMESTAMPS_BLOCK_SIZE
        );

        let ts_offset = self.streams.write(TIMESTAMPS_FILENAME, &ts.data)?;

        let mut csh = ColumnsHeader {
            column_headers: Vec::with_capacity(bd.columns_data.len()),
            const_columns: bd.const_columns.clone(),
        };
        for cd in &bd.columns_data {
            assert!(
                cd.values_data.len() <= MAX_VALUES_BLOCK_SIZE,
                "BUG: values block of column {:?} has {} bytes; the limit is {}",
                cd.name,
                cd.values_data.len(),
                MAX_VALUES_BLOCK_SIZE
            );
            assert!(
                cd.bloom_filter_data.len() <= MAX_BLOOM_FILTER_BLOCK_SIZE,
                "BUG: bloom filter of column {:?} has {} bytes; the limit is {}",
                cd.name,
                cd.bloom_filter_data.len(),
                MAX_BLOOM_FILTER_BLOCK_SIZE
            );
            let (values_file, bloom_file) = self.streams.column_filenames(&cd.name);
            let values_offset = self.streams.write(&values_file, &cd.values_data)?;
            let bloom_filter_offset = self.streams.write(&bloom_file, &cd.bloom_filter_data)?;
            csh.column_headers.push(ColumnHeader {
                name: cd.name.clone(),
                value_type: cd.value_type,
                min_value: cd.min_value,
                max_value: cd.max_value,
                dict: cd.dict.clone(),
                values_offset,
                values_size: cd.values_data.len() as u64,
                bloom_filter_offset,
                bloom_filter_size: cd.bloom_filter_data.len() as u64,
            });
        }

        let mut bh = BlockHeader {
            stream_id: bd.stream_id,
            uncompressed_size_bytes: bd.uncompressed_size_bytes,
            rows_count: bd.rows_count,
            timestamps_header: TimestampsHeader {
                block_offset: ts_offset,
                block_size: ts.data.len() as u64,
                min_timestamp: ts.min_timestamp,
                max_timestamp: ts.max_timestamp,
                marshal_type: ts.marshal_type,
            },
            ..Default::default()
        };

        let mut buf = Vec::new();
        if self.format_version == 0 {
            csh.marshal_v0(&mut buf);
        } else {
            let index = csh.marshal_v1(&mut buf, &mut self.column_names);
            let mut index_buf = Vec::new();
            index.marshal(&mut index_buf);
            bh.columns_header_index_offset =
                self.streams.write(COLUMNS_HEADER_INDEX_FILENAME, &index_buf)?;
            bh.columns_header_index_size = index_buf.len() as u64;
        }
        assert!(
            buf.len() <= MAX_COLUMNS_HEADER_SIZE,
            "BUG: columns header has {} bytes; the limit is {}",
            buf.len(),
            MAX_COLUMNS_HEADER_SIZE
        );
        bh.columns_header_offset = self.streams.write(COLUMNS_HEADER_FILENAME, &buf)?;
        bh.columns_header_size = buf.len() as u64;

        self.append_block_header(&bh)?;

        let ph = &mut self.header;
        ph.rows_count += bd.rows_count;
        ph.blocks_count += 1;
        ph.uncompressed_size_bytes += bd.uncompressed_size_bytes;
        ph.min_timestamp = ph.min_timestamp.min(ts.min_timestamp);
        ph.max_timestamp = ph.max_timestamp.max(ts.max_timestamp);
        Ok(())
    }

    fn check_order(&mut self, stream_id: StreamId, min_timestamp: i64) {
        if let Some((prev_sid, prev_ts)) = self.prev {
            assert!(
                prev_sid <= stream_id,
                "BUG: blocks must be written in stream id order; got {} after {}",
                stream_id,
                prev_sid
            );
            if prev_sid == stream_id {
                assert!(
                    prev_ts <= min_timestamp,
                    "BUG: blocks of stream {} must be written in timestamp order; got {} after {}",
                    stream_id,
                    min_timestamp,
                    prev_ts
                );
            }
        }
        self.prev = Some((stream_id, min_timestamp));
    }

    fn append_block_header(&mut self, bh: &BlockHeader) -> Result<()> {
        let th = &bh.timestamps_header;
        let ibh = &mut self.index_block_header;
        if !self.has_pending_index_block {
            ibh.stream_id = bh.stream_id;
            ibh.min_timestamp = th.min_timestamp;
            ibh.max_timestamp = th.max_timestamp;
            self.has_pending_index_block = true;
        } else {
            ibh.min_timestamp = ibh.min_timestamp.min(th.min_timestamp);
            ibh.max_timestamp = ibh.max_timestamp.max(th.max_timestamp);
        }
        bh.marshal(&mut self.index_block_buf, self.format_version);
        if self.index_block_buf.len() > MAX_UNCOMPRESSED_INDEX_BLOCK_SIZE {
            self.flush_index_block()?;
        }
        Ok(())
    }

    fn flush_index_block(&mut self) -> Result<()> {
        if !self.has_pending_index_block {
            return Ok(());
        }
        let mut compressed = Vec::new();
        compress_block(&mut compressed, &self.index_block_buf);
        assert!(
            compressed.len() <= MAX_INDEX_BLOCK_SIZE,
            "BUG: index block has {} bytes; the limit is {}",
            compressed.len(),
            MAX_INDEX_BLOCK_SIZE
        );
        let offset = self.streams.write(INDEX_FILENAME, &compressed)?;
        self.index_block_header.index_block_offset = offset;
        self.index_block_header.index_block_size = compressed.len() as u64;
        self.index_block_header.marshal(&mut self.metaindex_buf);

        self.index_block_buf.clear();
        self.index_block_header = IndexBlockHeader::default();
        self.has_pending_index_block = false;
        Ok(())
    }

    /// Flushes pending index data, writes the metaindex and completes the
    /// part header.
    pub fn finalize(mut self) -> Result<FinishedPart> {
        self.flush_index_block()?;

        let mut metaindex = Vec::new();
        compress_block(&mut metaindex, &self.metaindex_buf);
        self.streams.write(METAINDEX_FILENAME, &metaindex)?;

        if self.format_version >= 1 {
            let mut names = Vec::new();
            self.column_names.marshal(&mut names);
            self.streams.write(COLUMN_NAMES_FILENAME, &names)?;
        }

        let mut header = self.header;
        if header.rows_count == 0 {
            header.min_timestamp = 0;
            header.max_timestamp = 0;
        }
        header.compressed_size_bytes = self.streams.total_bytes_written();

        let dir = self.streams.dir().map(Path::to_path_buf);
        let files = self.streams.finish()?;
        match dir {
            None => Ok(FinishedPart::Inmemory(InmemoryPart::new(header, files))),
            Some(dir) => {
                header
                    .write_to_dir(&dir)
                    .with_context(|| format!("cannot finalize part {}", dir.display()))?;
                sync_dir(&dir);
                Ok(FinishedPart::File(header))
            }
        }
    }
}
