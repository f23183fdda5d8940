use anyhow::{Context, Result};

use crate::block_data::BlockData;
use crate::headers::{BlockHeader, PartHeader};
use crate::part::Part;
use crate::stream_id::StreamId;

/// Replays the blocks of a part in stored order.
///
/// Every block is checked against the previous one and against the part
/// header: blocks must be ordered by (stream id, min timestamp) and the
/// accumulated rows, blocks and uncompressed bytes must add up to the header
/// totals exactly. A mismatch means corruption or a writer bug and panics.
pub struct BlockStreamReader<'a> {
    part: &'a Part,
    next_index_block: usize,
    block_headers: Vec<BlockHeader>,
    next_block: usize,
    block_data: Option<BlockData>,

    prev: Option<(StreamId, i64)>,
    rows_read: u64,
    blocks_read: u64,
    uncompressed_bytes_read: u64,
}

impl<'a> BlockStreamReader<'a> {
    pub fn new(part: &'a Part) -> Self {
        Self {
            part,
            next_index_block: 0,
            block_headers: Vec::new(),
            next_block: 0,
            block_data: None,
            prev: None,
            rows_read: 0,
            blocks_read: 0,
            uncompressed_bytes_read: 0,
        }
    }

    #[must_use]
    pub fn part_header(&self) -> &PartHeader {
        self.part.header()
    }

    /// The block loaded by the last successful [`next_block`](Self::next_block).
    #[must_use]
    pub fn block_data(&self) -> Option<&BlockData> {
        self.block_data.as_ref()
    }

    pub(crate) fn take_block_data(&mut self) -> Option<BlockData> {
        self.block_data.take()
    }

    /// Loads the next block. Returns `false` once all blocks were read.
    pub fn next_block(&mut self) -> Result<bool> {
        while self.next_block >= self.block_headers.len() {
            if !self.load_next_index_block()? {
                self.check_totals();
                self.block_data = None;
                return Ok(false);
            }
        }
        let bh = self.block_headers[self.next_block];
        self.next_block += 1;
        self.check_block_header(&bh);

        let bd = self.part.read_block_data(&bh).with_context(|| {
            format!(
                "cannot read block #{} of part {:?}",
                self.blocks_read,
                self.part.path()
            )
        })?;
        self.blocks_read += 1;
        self.rows_read += bh.rows_count;
        self.uncompressed_bytes_read += bh.uncompressed_size_bytes;
        self.check_limits();
        self.block_data = Some(bd);
        Ok(true)
    }

    fn load_next_index_block(&mut self) -> Result<bool> {
        let ibhs = self.part.index_block_headers();
        let ibh = match ibhs.get(self.next_index_block) {
            Some(ibh) => *ibh,
            None => return Ok(false),
        };
        self.next_index_block += 1;
        let bhs = self.part.read_block_headers(&ibh).with_context(|| {
            format!(
                "cannot read index block #{} of part {:?}",
                self.next_index_block - 1,
                self.part.path()
            )
        })?;
        if let Some(first) = bhs.first() {
            assert_eq!(
                first.stream_id, ibh.stream_id,
                "FATAL: first block stream id doesn't match its index block header"
            );
        }
        for bh in &bhs {
            let th = &bh.timestamps_header;
            assert!(
                th.min_timestamp >= ibh.min_timestamp && th.max_timestamp <= ibh.max_timestamp,
                "FATAL: block time range [{}, {}] is outside its index block range [{}, {}]",
                th.min_timestamp,
                th.max_timestamp,
                ibh.min_timestamp,
                ibh.max_timestamp
            );
        }
        self.block_headers = bhs;
        self.next_block = 0;
        Ok(true)
    }

    fn check_block_header(&mut self, bh: &BlockHeader) {
        let min_ts = bh.timestamps_header.min_timestamp;
        if let Some((prev_sid, prev_ts)) = self.prev {
            assert!(
                prev_sid <= bh.stream_id,
                "FATAL: blocks are not sorted by stream id: {} follows {}",
                bh.stream_id,
                prev_sid
            );
            if prev_sid == bh.stream_id {
                assert!(
                    prev_ts <= min_ts,
                    "FATAL: blocks of stream {} are not sorted by timestamp: {} follows {}",
                    bh.stream_id,
                    min_ts,
                    prev_ts
                );
            }
        }
        let ph = self.part.header();
        assert!(
            min_ts >= ph.min_timestamp && bh.timestamps_header.max_timestamp <= ph.max_timestamp,
            "FATAL: block time range [{}, {}] is outside the part range [{}, {}]",
            min_ts,
            bh.timestamps_header.max_timestamp,
            ph.min_timestamp,
            ph.max_timestamp
        );
        self.prev = Some((bh.stream_id, min_ts));
    }

    fn check_limits(&self) {
        let ph = self.part.header();
        assert!(
            self.rows_read <= ph.rows_count,
            "FATAL: read {} rows; the part header declares {}",
            self.rows_read,
            ph.rows_count
        );
        assert!(
            self.blocks_read <= ph.blocks_count,
            "FATAL: read {} blocks; the part header declares {}",
            self.blocks_read,
            ph.blocks_count
        );
        assert!(
            self.uncompressed_bytes_read <= ph.uncompressed_size_bytes,
            "FATAL: read {} uncompressed bytes; the part header declares {}",
            self.uncompressed_bytes_read,
            ph.uncompressed_size_bytes
        );
    }

    fn check_totals(&self) {
        let ph = self.part.header();
        assert_eq!(
            self.rows_read, ph.rows_count,
            "FATAL: rows read don't match the part header"
        );
        assert_eq!(
            self.blocks_read, ph.blocks_count,
            "FATAL: blocks read don't match the part header"
        );
        assert_eq!(
            self.uncompressed_bytes_read, ph.uncompressed_size_bytes,
            "FATAL: uncompressed bytes read don't match the part header"
        );
    }
}
