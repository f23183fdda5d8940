//! # Part - immutable columnar storage for log rows
//!
//! A part holds log rows grouped into blocks, one stream per block, ordered
//! by (stream id, min timestamp). Parts live either in memory or in a
//! directory on disk and are never modified after they are written; the
//! engine replaces several small parts with one bigger part by merging them.
//!
//! ## Directory layout (format v1)
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │ metadata.json            PartHeader (JSON)                     │
//! │ metaindex.bin            compressed IndexBlockHeaders          │
//! │ index.bin                compressed BlockHeaders, one blob     │
//! │                          per index block                       │
//! │ columns_header.bin       ColumnsHeader per block               │
//! │ columns_header_index.bin column name id -> header offset       │
//! │ column_names.bin         column name table                     │
//! │ timestamps.bin           delta-encoded timestamps per block    │
//! │ message_values.bin       `_msg` values                         │
//! │ message_bloom.bin        `_msg` bloom filters                  │
//! │ field_values.bin.N       other columns' values, N = shard      │
//! │ field_bloom.bin.N        other columns' bloom filters          │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! Format v0 has no column name table and no columns header index; column
//! names are stored inline, and field values and bloom filters go to a
//! single `field_values.bin` / `field_bloom.bin` pair.
//!
//! ## Version history
//!
//! | Version | Features                                                   |
//! |---------|------------------------------------------------------------|
//! | v0      | inline column names, single field values/bloom files      |
//! | v1      | + column name table, columns header index, sharded files  |

use std::fs::File;
use std::path::Path;

mod block;
mod block_data;
pub mod encoding;
mod headers;
mod inmemory;
mod merge;
mod part;
mod reader;
mod rows;
mod stream_id;
mod streams;
pub mod values;
mod writer;

pub use block::{Block, Column};
pub use block_data::{BlockData, ColumnData, TimestampsData};
pub use headers::{
    BlockHeader, ColumnHeader, ColumnNames, ColumnsHeader, ColumnsHeaderIndex, IndexBlockHeader,
    PartHeader, TimestampsHeader,
};
pub use inmemory::InmemoryPart;
pub use merge::{merge_block_streams, MergeOutcome};
pub use part::Part;
pub use reader::BlockStreamReader;
pub use rows::{
    canonical_stream_tags, uncompressed_row_size_bytes, uncompressed_rows_size_bytes, Field,
    LogRows, MSG_FIELD_NAME,
};
pub use stream_id::{StreamId, TenantId, STREAM_ID_SIZE};
pub use streams::{
    BLOOM_VALUES_SHARDS_COUNT, COLUMNS_HEADER_FILENAME, COLUMNS_HEADER_INDEX_FILENAME,
    COLUMN_NAMES_FILENAME, INDEX_FILENAME, MESSAGE_BLOOM_FILENAME, MESSAGE_VALUES_FILENAME,
    METAINDEX_FILENAME, TIMESTAMPS_FILENAME,
};
pub use values::ValueType;
pub use writer::{BlockStreamWriter, FinishedPart};

pub use streams::METADATA_FILENAME;

/// Blocks are cut once their estimated uncompressed size reaches this.
pub const MAX_UNCOMPRESSED_BLOCK_SIZE: u64 = 2 * 1024 * 1024;

/// Maximum number of distinct columns (const ones included) per block.
pub const MAX_COLUMNS_PER_BLOCK: usize = 2000;

/// Columns whose single value is longer than this are never made const.
pub const MAX_CONST_COLUMN_VALUE_SIZE: usize = 256;

/// Maximum length of a field name in bytes.
pub const MAX_FIELD_NAME_SIZE: usize = 128;

/// Index blocks are compressed and flushed once their uncompressed size
/// exceeds this.
pub const MAX_UNCOMPRESSED_INDEX_BLOCK_SIZE: usize = 128 * 1024;

/// Upper bound for any single values block.
pub const MAX_VALUES_BLOCK_SIZE: usize = 8 * 1024 * 1024;

/// Upper bound for any single bloom filter block.
pub const MAX_BLOOM_FILTER_BLOCK_SIZE: usize = 8 * 1024 * 1024;

/// Upper bound for a compressed index block.
pub const MAX_INDEX_BLOCK_SIZE: usize = 8 * 1024 * 1024;

/// Upper bound for a compressed timestamps block.
pub const MAX_TIMESTAMPS_BLOCK_SIZE: usize = 8 * 1024 * 1024;

/// Upper bound for a marshaled columns header.
pub const MAX_COLUMNS_HEADER_SIZE: usize = 8 * 1024 * 1024;

/// Fsyncs a directory so renames and new entries inside it are durable.
/// Errors are ignored: some filesystems cannot open directories.
pub fn sync_dir(dir: &Path) {
    if let Ok(d) = File::open(dir) {
        let _ = d.sync_all();
    }
}

#[cfg(test)]
mod tests;
