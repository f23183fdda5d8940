//! On-disk headers of a part.
//!
//! ```text
//! metaindex.bin  compressed [IndexBlockHeader]        one per index block
//! index.bin      compressed [BlockHeader] per index block
//! columns_header.bin          ColumnsHeader per block
//! columns_header_index.bin    (v1) column name id -> offset in ColumnsHeader
//! column_names.bin            (v1) column name table
//! metadata.json               PartHeader
//! ```
//!
//! Fixed-width integers are big-endian; everything else is varuint encoded.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{bail, ensure, Context, Result};
use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use serde::{Deserialize, Serialize};

use crate::encoding::{read_string, read_varuint64, write_bytes, write_varuint64};
use crate::rows::Field;
use crate::stream_id::StreamId;
use crate::values::{ValueType, ValuesDict};
use crate::{sync_dir, METADATA_FILENAME};

// -------------------- ColumnHeader --------------------

/// Describes where a column's values and bloom filter live and how they are
/// encoded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnHeader {
    pub name: String,
    pub value_type: ValueType,
    pub min_value: u64,
    pub max_value: u64,
    pub dict: ValuesDict,
    pub values_offset: u64,
    pub values_size: u64,
    pub bloom_filter_offset: u64,
    pub bloom_filter_size: u64,
}

impl ColumnHeader {
    /// Appends the header. Format v0 stores the name inline; later versions
    /// refer to it through the columns header index.
    pub fn marshal(&self, dst: &mut Vec<u8>, format_version: u32) {
        if format_version == 0 {
            write_bytes(dst, self.name.as_bytes());
        }
        let vt = self.value_type;
        dst.push(vt as u8);
        if vt == ValueType::Dict {
            self.dict.marshal(dst);
            write_varuint64(dst, self.values_offset);
            write_varuint64(dst, self.values_size);
            return;
        }
        if let Some(width) = vt.min_max_width() {
            write_fixed(dst, self.min_value, width);
            write_fixed(dst, self.max_value, width);
        }
        write_varuint64(dst, self.values_offset);
        write_varuint64(dst, self.values_size);
        write_varuint64(dst, self.bloom_filter_offset);
        write_varuint64(dst, self.bloom_filter_size);
    }

    /// Reads a header. For format v1 and later the name is left empty and
    /// must be filled in from the columns header index.
    pub fn unmarshal(src: &mut &[u8], format_version: u32) -> Result<Self> {
        let mut ch = Self::default();
        if format_version == 0 {
            ch.name = read_string(src).context("cannot read column name")?;
        }
        let (&b, tail) = src.split_first().context("cannot read column value type")?;
        *src = tail;
        let vt = ValueType::from_u8(b)?;
        ch.value_type = vt;
        if vt == ValueType::Dict {
            ch.dict = ValuesDict::unmarshal(src)
                .with_context(|| format!("cannot read dictionary of column {:?}", ch.name))?;
            ch.values_offset = read_varuint64(src)?;
            ch.values_size = read_varuint64(src)?;
            return Ok(ch);
        }
        if let Some(width) = vt.min_max_width() {
            ch.min_value = read_fixed(src, width)?;
            ch.max_value = read_fixed(src, width)?;
        }
        ch.values_offset = read_varuint64(src)?;
        ch.values_size = read_varuint64(src)?;
        ch.bloom_filter_offset = read_varuint64(src)?;
        ch.bloom_filter_size = read_varuint64(src)?;
        Ok(ch)
    }
}

fn write_fixed(dst: &mut Vec<u8>, v: u64, width: usize) {
    let mut buf = [0u8; 8];
    BigEndian::write_uint(&mut buf, v, width);
    dst.extend_from_slice(&buf[..width]);
}

fn read_fixed(src: &mut &[u8], width: usize) -> Result<u64> {
    ensure!(
        src.len() >= width,
        "cannot read {}-byte value from {} bytes",
        width,
        src.len()
    );
    let v = BigEndian::read_uint(&src[..width], width);
    *src = &src[width..];
    Ok(v)
}

// -------------------- ColumnsHeader --------------------

/// Per-block list of column headers plus const columns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnsHeader {
    pub column_headers: Vec<ColumnHeader>,
    pub const_columns: Vec<Field>,
}

/// Maps column name ids to offsets inside a marshaled [`ColumnsHeader`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnsHeaderIndex {
    pub columns: Vec<(u64, u64)>,
    pub const_columns: Vec<(u64, u64)>,
}

impl ColumnsHeader {
    /// Marshals the header in format v0, names inline.
    pub fn marshal_v0(&self, dst: &mut Vec<u8>) {
        write_varuint64(dst, self.column_headers.len() as u64);
        for ch in &self.column_headers {
            ch.marshal(dst, 0);
        }
        write_varuint64(dst, self.const_columns.len() as u64);
        for f in &self.const_columns {
            write_bytes(dst, f.name.as_bytes());
            write_bytes(dst, f.value.as_bytes());
        }
    }

    /// Marshals the header in format v1. Names are replaced by ids from
    /// `names` and recorded with their offsets in the returned index.
    pub fn marshal_v1(&self, dst: &mut Vec<u8>, names: &mut ColumnNames) -> ColumnsHeaderIndex {
        let base = dst.len();
        let mut index = ColumnsHeaderIndex::default();
        write_varuint64(dst, self.column_headers.len() as u64);
        for ch in &self.column_headers {
            let id = names.get_or_assign(&ch.name);
            index.columns.push((id, (dst.len() - base) as u64));
            ch.marshal(dst, 1);
        }
        write_varuint64(dst, self.const_columns.len() as u64);
        for f in &self.const_columns {
            let id = names.get_or_assign(&f.name);
            index.const_columns.push((id, (dst.len() - base) as u64));
            write_bytes(dst, f.value.as_bytes());
        }
        index
    }

    pub fn unmarshal_v0(src: &[u8]) -> Result<Self> {
        let mut src = src;
        let n = read_varuint64(&mut src)? as usize;
        let mut column_headers = Vec::with_capacity(n.min(crate::MAX_COLUMNS_PER_BLOCK));
        for i in 0..n {
            let ch = ColumnHeader::unmarshal(&mut src, 0)
                .with_context(|| format!("cannot read column header #{}", i))?;
            column_headers.push(ch);
        }
        let n = read_varuint64(&mut src)? as usize;
        let mut const_columns = Vec::with_capacity(n.min(crate::MAX_COLUMNS_PER_BLOCK));
        for i in 0..n {
            let name = read_string(&mut src)
                .with_context(|| format!("cannot read const column #{} name", i))?;
            let value = read_string(&mut src)
                .with_context(|| format!("cannot read const column {:?} value", name))?;
            const_columns.push(Field { name, value });
        }
        ensure!(
            src.is_empty(),
            "unexpected {} trailing bytes in columns header",
            src.len()
        );
        Ok(Self {
            column_headers,
            const_columns,
        })
    }

    /// Reads a v1 header, resolving names through `index` and `names`.
    pub fn unmarshal_v1(src: &[u8], index: &ColumnsHeaderIndex, names: &[String]) -> Result<Self> {
        let name_of = |id: u64| -> Result<String> {
            match names.get(id as usize) {
                Some(n) => Ok(n.clone()),
                None => bail!("unknown column name id {}; the table has {} names", id, names.len()),
            }
        };

        let mut tail = src;
        let n = read_varuint64(&mut tail)? as usize;
        ensure!(
            n == index.columns.len(),
            "columns header has {} columns; its index lists {}",
            n,
            index.columns.len()
        );
        let mut column_headers = Vec::with_capacity(n);
        for &(id, offset) in &index.columns {
            ensure!(
                offset as usize == src.len() - tail.len(),
                "column header offset {} does not match the index",
                offset
            );
            let mut ch = ColumnHeader::unmarshal(&mut tail, 1)?;
            ch.name = name_of(id)?;
            column_headers.push(ch);
        }
        let n = read_varuint64(&mut tail)? as usize;
        ensure!(
            n == index.const_columns.len(),
            "columns header has {} const columns; its index lists {}",
            n,
            index.const_columns.len()
        );
        let mut const_columns = Vec::with_capacity(n);
        for &(id, offset) in &index.const_columns {
            ensure!(
                offset as usize == src.len() - tail.len(),
                "const column offset {} does not match the index",
                offset
            );
            let value = read_string(&mut tail)?;
            const_columns.push(Field {
                name: name_of(id)?,
                value,
            });
        }
        ensure!(
            tail.is_empty(),
            "unexpected {} trailing bytes in columns header",
            tail.len()
        );
        Ok(Self {
            column_headers,
            const_columns,
        })
    }

    pub fn find_column(&self, name: &str) -> Option<&ColumnHeader> {
        self.column_headers.iter().find(|ch| ch.name == name)
    }

    pub fn find_const_column(&self, name: &str) -> Option<&Field> {
        self.const_columns.iter().find(|f| f.name == name)
    }
}

impl ColumnsHeaderIndex {
    pub fn marshal(&self, dst: &mut Vec<u8>) {
        for refs in [&self.columns, &self.const_columns] {
            write_varuint64(dst, refs.len() as u64);
            for &(id, offset) in refs {
                write_varuint64(dst, id);
                write_varuint64(dst, offset);
            }
        }
    }

    pub fn unmarshal(src: &[u8]) -> Result<Self> {
        let mut src = src;
        let mut read_refs = |what: &str| -> Result<Vec<(u64, u64)>> {
            let n = read_varuint64(&mut src)
                .with_context(|| format!("cannot read {} count", what))?
                as usize;
            let mut refs = Vec::with_capacity(n.min(crate::MAX_COLUMNS_PER_BLOCK));
            for _ in 0..n {
                let id = read_varuint64(&mut src)?;
                let offset = read_varuint64(&mut src)?;
                refs.push((id, offset));
            }
            Ok(refs)
        };
        let columns = read_refs("columns")?;
        let const_columns = read_refs("const columns")?;
        ensure!(
            src.is_empty(),
            "unexpected {} trailing bytes in columns header index",
            src.len()
        );
        Ok(Self {
            columns,
            const_columns,
        })
    }
}

// -------------------- Column names --------------------

/// Per-part table of column names, each given a dense id.
#[derive(Debug, Clone, Default)]
pub struct ColumnNames {
    ids: HashMap<String, u64>,
    names: Vec<String>,
}

impl ColumnNames {
    pub fn get_or_assign(&mut self, name: &str) -> u64 {
        if let Some(&id) = self.ids.get(name) {
            return id;
        }
        let id = self.names.len() as u64;
        self.names.push(name.to_string());
        self.ids.insert(name.to_string(), id);
        id
    }

    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn marshal(&self, dst: &mut Vec<u8>) {
        write_varuint64(dst, self.names.len() as u64);
        for n in &self.names {
            write_bytes(dst, n.as_bytes());
        }
    }

    pub fn unmarshal(src: &[u8]) -> Result<Self> {
        let mut src = src;
        let n = read_varuint64(&mut src)? as usize;
        let mut table = Self::default();
        for i in 0..n {
            let name = read_string(&mut src)
                .with_context(|| format!("cannot read column name #{}", i))?;
            ensure!(
                !table.ids.contains_key(&name),
                "duplicate column name {:?} in the names table",
                name
            );
            table.get_or_assign(&name);
        }
        ensure!(
            src.is_empty(),
            "unexpected {} trailing bytes in column names",
            src.len()
        );
        Ok(table)
    }
}

// -------------------- TimestampsHeader --------------------

pub const TIMESTAMPS_HEADER_SIZE: usize = 33;

/// Location and range of a block's timestamps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimestampsHeader {
    pub block_offset: u64,
    pub block_size: u64,
    pub min_timestamp: i64,
    pub max_timestamp: i64,
    pub marshal_type: u8,
}

impl TimestampsHeader {
    pub fn marshal(&self, dst: &mut Vec<u8>) {
        dst.extend_from_slice(&self.block_offset.to_be_bytes());
        dst.extend_from_slice(&self.block_size.to_be_bytes());
        dst.extend_from_slice(&self.min_timestamp.to_be_bytes());
        dst.extend_from_slice(&self.max_timestamp.to_be_bytes());
        dst.push(self.marshal_type);
    }

    pub fn unmarshal(src: &mut &[u8]) -> Result<Self> {
        ensure!(
            src.len() >= TIMESTAMPS_HEADER_SIZE,
            "cannot unmarshal timestamps header from {} bytes; need {}",
            src.len(),
            TIMESTAMPS_HEADER_SIZE
        );
        Ok(Self {
            block_offset: src.read_u64::<BigEndian>()?,
            block_size: src.read_u64::<BigEndian>()?,
            min_timestamp: src.read_i64::<BigEndian>()?,
            max_timestamp: src.read_i64::<BigEndian>()?,
            marshal_type: src.read_u8()?,
        })
    }
}

// -------------------- BlockHeader --------------------

/// Describes one block: its stream, sizes, timestamps and columns header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockHeader {
    pub stream_id: StreamId,
    pub uncompressed_size_bytes: u64,
    pub rows_count: u64,
    pub timestamps_header: TimestampsHeader,
    pub columns_header_index_offset: u64,
    pub columns_header_index_size: u64,
    pub columns_header_offset: u64,
    pub columns_header_size: u64,
}

impl BlockHeader {
    pub fn marshal(&self, dst: &mut Vec<u8>, format_version: u32) {
        self.stream_id.marshal(dst);
        write_varuint64(dst, self.uncompressed_size_bytes);
        write_varuint64(dst, self.rows_count);
        self.timestamps_header.marshal(dst);
        if format_version >= 1 {
            write_varuint64(dst, self.columns_header_index_offset);
            write_varuint64(dst, self.columns_header_index_size);
        }
        write_varuint64(dst, self.columns_header_offset);
        write_varuint64(dst, self.columns_header_size);
    }

    pub fn unmarshal(src: &mut &[u8], format_version: u32) -> Result<Self> {
        let stream_id = StreamId::unmarshal(src)?;
        let uncompressed_size_bytes = read_varuint64(src)?;
        let rows_count = read_varuint64(src)?;
        let timestamps_header = TimestampsHeader::unmarshal(src)?;
        let (columns_header_index_offset, columns_header_index_size) = if format_version >= 1 {
            (read_varuint64(src)?, read_varuint64(src)?)
        } else {
            (0, 0)
        };
        let columns_header_offset = read_varuint64(src)?;
        let columns_header_size = read_varuint64(src)?;
        let bh = Self {
            stream_id,
            uncompressed_size_bytes,
            rows_count,
            timestamps_header,
            columns_header_index_offset,
            columns_header_index_size,
            columns_header_offset,
            columns_header_size,
        };
        ensure!(bh.rows_count > 0, "block header has zero rows");
        ensure!(
            bh.timestamps_header.min_timestamp <= bh.timestamps_header.max_timestamp,
            "block min timestamp {} exceeds max timestamp {}",
            bh.timestamps_header.min_timestamp,
            bh.timestamps_header.max_timestamp
        );
        Ok(bh)
    }

    /// Decodes all block headers of an uncompressed index block.
    pub fn unmarshal_all(src: &[u8], format_version: u32) -> Result<Vec<Self>> {
        let mut src = src;
        let mut bhs = Vec::new();
        while !src.is_empty() {
            let bh = Self::unmarshal(&mut src, format_version)
                .with_context(|| format!("cannot read block header #{}", bhs.len()))?;
            bhs.push(bh);
        }
        Ok(bhs)
    }
}

// -------------------- IndexBlockHeader --------------------

pub const INDEX_BLOCK_HEADER_SIZE: usize = crate::stream_id::STREAM_ID_SIZE + 32;

/// Locates one compressed index block and summarizes its block headers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexBlockHeader {
    pub stream_id: StreamId,
    pub min_timestamp: i64,
    pub max_timestamp: i64,
    pub index_block_offset: u64,
    pub index_block_size: u64,
}

impl IndexBlockHeader {
    pub fn marshal(&self, dst: &mut Vec<u8>) {
        self.stream_id.marshal(dst);
        dst.extend_from_slice(&self.min_timestamp.to_be_bytes());
        dst.extend_from_slice(&self.max_timestamp.to_be_bytes());
        dst.extend_from_slice(&self.index_block_offset.to_be_bytes());
        dst.extend_from_slice(&self.index_block_size.to_be_bytes());
    }

    pub fn unmarshal(src: &mut &[u8]) -> Result<Self> {
        ensure!(
            src.len() >= INDEX_BLOCK_HEADER_SIZE,
            "cannot unmarshal index block header from {} bytes; need {}",
            src.len(),
            INDEX_BLOCK_HEADER_SIZE
        );
        Ok(Self {
            stream_id: StreamId::unmarshal(src)?,
            min_timestamp: src.read_i64::<BigEndian>()?,
            max_timestamp: src.read_i64::<BigEndian>()?,
            index_block_offset: src.read_u64::<BigEndian>()?,
            index_block_size: src.read_u64::<BigEndian>()?,
        })
    }

    /// Decodes the uncompressed metaindex, checking stream id order.
    pub fn unmarshal_metaindex(src: &[u8]) -> Result<Vec<Self>> {
        let mut src = src;
        let mut ibhs: Vec<Self> = Vec::with_capacity(src.len() / INDEX_BLOCK_HEADER_SIZE);
        while !src.is_empty() {
            let ibh = Self::unmarshal(&mut src)
                .with_context(|| format!("cannot read index block header #{}", ibhs.len()))?;
            if let Some(prev) = ibhs.last() {
                ensure!(
                    prev.stream_id <= ibh.stream_id,
                    "index block headers are not sorted by stream id: {} > {}",
                    prev.stream_id,
                    ibh.stream_id
                );
            }
            ibhs.push(ibh);
        }
        Ok(ibhs)
    }
}

// -------------------- PartHeader --------------------

/// Whole-part summary stored as `metadata.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PartHeader {
    pub compressed_size_bytes: u64,
    pub uncompressed_size_bytes: u64,
    pub rows_count: u64,
    pub blocks_count: u64,
    pub min_timestamp: i64,
    pub max_timestamp: i64,
    pub format_version: u32,
    #[serde(default)]
    pub bloom_values_shards_count: u64,
    #[serde(default)]
    pub applied_seq: u64,
}

impl PartHeader {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.format_version <= config::LATEST_FORMAT_VERSION,
            "unsupported part format version {}; the latest known is {}",
            self.format_version,
            config::LATEST_FORMAT_VERSION
        );
        ensure!(
            self.min_timestamp <= self.max_timestamp,
            "min timestamp {} exceeds max timestamp {}",
            self.min_timestamp,
            self.max_timestamp
        );
        ensure!(
            self.blocks_count <= self.rows_count,
            "blocks count {} exceeds rows count {}",
            self.blocks_count,
            self.rows_count
        );
        if self.format_version >= 1 {
            ensure!(
                self.bloom_values_shards_count > 0,
                "format v{} part must have bloom/values shards",
                self.format_version
            );
        }
        Ok(())
    }

    pub fn read_from_dir(dir: &Path) -> Result<Self> {
        let path = dir.join(METADATA_FILENAME);
        let data = fs::read(&path).with_context(|| format!("cannot read {}", path.display()))?;
        let ph: Self = serde_json::from_slice(&data)
            .with_context(|| format!("cannot parse {}", path.display()))?;
        ph.validate()
            .with_context(|| format!("invalid part header in {}", path.display()))?;
        Ok(ph)
    }

    /// Writes `metadata.json` into `dir`. The file is replaced atomically, so
    /// a crash leaves either the old or the new header.
    pub fn write_to_dir(&self, dir: &Path) -> Result<()> {
        let path = dir.join(METADATA_FILENAME);
        let tmp_path = dir.join(format!("{}.tmp", METADATA_FILENAME));
        let data = serde_json::to_vec_pretty(self).context("cannot serialize part header")?;
        {
            let mut f = fs::File::create(&tmp_path)
                .with_context(|| format!("cannot create {}", tmp_path.display()))?;
            f.write_all(&data)
                .with_context(|| format!("cannot write {}", tmp_path.display()))?;
            f.sync_all()?;
        }
        fs::rename(&tmp_path, &path).with_context(|| {
            format!("cannot rename {} to {}", tmp_path.display(), path.display())
        })?;
        sync_dir(dir);
        Ok(())
    }
}
