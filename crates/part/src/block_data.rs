//! Encoded form of a block: the exact bytes that go into a part.
//!
//! Merges move `BlockData` between parts without decoding it unless the block
//! has to be combined with a neighbour.

use anyhow::{ensure, Context, Result};
use bloom::BloomFilter;

use crate::block::{Block, Column};
use crate::encoding::{
    marshal_strings_block, marshal_timestamps, unmarshal_strings_block, unmarshal_timestamps,
};
use crate::rows::Field;
use crate::stream_id::StreamId;
use crate::values::{decode_values, encode_values, ValueType, ValuesDict};
use crate::MAX_UNCOMPRESSED_BLOCK_SIZE;

/// Encoded timestamps of a block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimestampsData {
    pub data: Vec<u8>,
    pub marshal_type: u8,
    pub min_timestamp: i64,
    pub max_timestamp: i64,
}

/// Encoded values and bloom filter of one column.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnData {
    pub name: String,
    pub value_type: ValueType,
    pub min_value: u64,
    pub max_value: u64,
    pub dict: ValuesDict,
    pub values_data: Vec<u8>,
    pub bloom_filter_data: Vec<u8>,
}

/// A fully encoded block of a single stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockData {
    pub stream_id: StreamId,
    pub uncompressed_size_bytes: u64,
    pub rows_count: u64,
    pub timestamps_data: TimestampsData,
    pub columns_data: Vec<ColumnData>,
    pub const_columns: Vec<Field>,
}

impl BlockData {
    /// Encodes `block`, which must have its timestamps sorted.
    pub fn from_block(stream_id: StreamId, block: &Block) -> Self {
        let timestamps = block.timestamps();
        let mut ts_data = Vec::new();
        let marshal_type = marshal_timestamps(&mut ts_data, timestamps);
        let timestamps_data = TimestampsData {
            data: ts_data,
            marshal_type,
            min_timestamp: timestamps.first().copied().unwrap_or(0),
            max_timestamp: timestamps.last().copied().unwrap_or(0),
        };

        let columns_data = block.columns().iter().map(encode_column).collect();

        Self {
            stream_id,
            uncompressed_size_bytes: block.uncompressed_size_bytes(),
            rows_count: block.rows_count() as u64,
            timestamps_data,
            columns_data,
            const_columns: block.const_columns().to_vec(),
        }
    }

    /// Decodes the block back into columns.
    pub fn to_block(&self) -> Result<Block> {
        let rows_count = self.rows_count as usize;
        let timestamps = unmarshal_timestamps(
            &self.timestamps_data.data,
            self.timestamps_data.marshal_type,
            rows_count,
        )
        .with_context(|| format!("cannot decode timestamps of stream {}", self.stream_id))?;

        let mut columns = Vec::with_capacity(self.columns_data.len());
        for cd in &self.columns_data {
            let values = cd
                .decode_values(rows_count)
                .with_context(|| format!("cannot decode column {:?}", cd.name))?;
            columns.push(Column {
                name: cd.name.clone(),
                values,
            });
        }
        Ok(Block::from_parts(
            timestamps,
            columns,
            self.const_columns.clone(),
        ))
    }

    /// Whether the block is big enough to be written as is.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.uncompressed_size_bytes >= MAX_UNCOMPRESSED_BLOCK_SIZE
    }

    /// Names of all columns, const ones included.
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns_data
            .iter()
            .map(|cd| cd.name.as_str())
            .chain(self.const_columns.iter().map(|f| f.name.as_str()))
    }

    #[must_use]
    pub fn columns_count(&self) -> usize {
        self.columns_data.len() + self.const_columns.len()
    }
}

impl ColumnData {
    pub fn decode_values(&self, rows_count: usize) -> Result<Vec<String>> {
        let raw = unmarshal_strings_block(&self.values_data, rows_count)?;
        ensure!(
            raw.len() == rows_count,
            "column {:?} has {} values; want {}",
            self.name,
            raw.len(),
            rows_count
        );
        decode_values(&raw, self.value_type, &self.dict)
    }
}

fn encode_column(c: &Column) -> ColumnData {
    let ev = encode_values(&c.values);
    let mut values_data = Vec::new();
    marshal_strings_block(&mut values_data, &ev.values);

    let mut bloom_filter_data = Vec::new();
    if ev.value_type.has_bloom_filter() {
        let mut tokens: Vec<String> = Vec::new();
        for v in &c.values {
            tokens.extend(bloom::tokenize(v));
        }
        tokens.sort_unstable();
        tokens.dedup();
        BloomFilter::from_tokens(&tokens).marshal(&mut bloom_filter_data);
    }

    ColumnData {
        name: c.name.clone(),
        value_type: ev.value_type,
        min_value: ev.min_value,
        max_value: ev.max_value,
        dict: ev.dict,
        values_data,
        bloom_filter_data,
    }
}
