//! Low-level byte encodings shared by every on-disk structure.
//!
//! - varuint: LEB128, 7 data bits per byte with a continuation flag
//! - varint: zigzag-mapped varuint
//! - length-prefixed bytes: varuint length + payload
//! - compressed blocks: 1-byte kind + payload (raw or zstd)
//! - strings blocks: a column's values as varuint lengths + concatenated data
//! - timestamps blocks: first value + deltas as varints

use anyhow::{bail, ensure, Context, Result};

/// Blocks shorter than this are stored raw; compression rarely pays off.
const MIN_COMPRESSIBLE_SIZE: usize = 128;

const BLOCK_KIND_RAW: u8 = 0;
const BLOCK_KIND_ZSTD: u8 = 1;

const ZSTD_LEVEL: i32 = 1;

/// Timestamps stored as zigzag varint deltas inside a compressed block.
pub const TIMESTAMPS_MARSHAL_TYPE_DELTA: u8 = 1;

/// Appends `v` as a varuint.
pub fn write_varuint64(dst: &mut Vec<u8>, mut v: u64) {
    loop {
        let mut byte = (v & 0x7f) as u8;
        v >>= 7;
        if v != 0 {
            byte |= 0x80;
        }
        dst.push(byte);
        if v == 0 {
            break;
        }
    }
}

/// Reads a varuint from the front of `src`, advancing it.
pub fn read_varuint64(src: &mut &[u8]) -> Result<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    for (i, &byte) in src.iter().enumerate() {
        if shift >= 64 || (shift == 63 && byte > 1) {
            bail!("varuint overflows u64");
        }
        value |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            *src = &src[i + 1..];
            return Ok(value);
        }
        shift += 7;
    }
    bail!("unexpected end of data while reading varuint")
}

/// Appends `v` as a zigzag varint.
pub fn write_varint64(dst: &mut Vec<u8>, v: i64) {
    write_varuint64(dst, ((v << 1) ^ (v >> 63)) as u64);
}

/// Reads a zigzag varint from the front of `src`.
pub fn read_varint64(src: &mut &[u8]) -> Result<i64> {
    let u = read_varuint64(src)?;
    let v = (u >> 1) as i64;
    Ok(if u & 1 != 0 { !v } else { v })
}

/// Appends a varuint length followed by `data`.
pub fn write_bytes(dst: &mut Vec<u8>, data: &[u8]) {
    write_varuint64(dst, data.len() as u64);
    dst.extend_from_slice(data);
}

/// Reads length-prefixed bytes from the front of `src`.
pub fn read_bytes<'a>(src: &mut &'a [u8]) -> Result<&'a [u8]> {
    let n = read_varuint64(src)? as usize;
    ensure!(
        src.len() >= n,
        "cannot read {} bytes; only {} bytes left",
        n,
        src.len()
    );
    let (data, tail) = src.split_at(n);
    *src = tail;
    Ok(data)
}

/// Reads a length-prefixed UTF-8 string from the front of `src`.
pub fn read_string(src: &mut &[u8]) -> Result<String> {
    let data = read_bytes(src)?;
    let s = std::str::from_utf8(data).context("string is not valid UTF-8")?;
    Ok(s.to_string())
}

/// Appends `src` as a compressed block.
pub fn compress_block(dst: &mut Vec<u8>, src: &[u8]) {
    if src.len() >= MIN_COMPRESSIBLE_SIZE {
        if let Ok(compressed) = zstd::bulk::compress(src, ZSTD_LEVEL) {
            if compressed.len() < src.len() {
                dst.push(BLOCK_KIND_ZSTD);
                dst.extend_from_slice(&compressed);
                return;
            }
        }
    }
    dst.push(BLOCK_KIND_RAW);
    dst.extend_from_slice(src);
}

/// Decodes a block written by [`compress_block`].
pub fn decompress_block(src: &[u8]) -> Result<Vec<u8>> {
    let (&kind, payload) = src
        .split_first()
        .context("cannot decompress an empty block")?;
    match kind {
        BLOCK_KIND_RAW => Ok(payload.to_vec()),
        BLOCK_KIND_ZSTD => zstd::decode_all(payload).context("cannot decompress zstd block"),
        other => bail!("unknown compressed block kind {}", other),
    }
}

/// Encodes a column's values as a compressed strings block.
pub fn marshal_strings_block<V: AsRef<[u8]>>(dst: &mut Vec<u8>, values: &[V]) {
    let data_len: usize = values.iter().map(|v| v.as_ref().len()).sum();
    let mut payload = Vec::with_capacity(values.len() * 2 + data_len);
    for v in values {
        write_varuint64(&mut payload, v.as_ref().len() as u64);
    }
    for v in values {
        payload.extend_from_slice(v.as_ref());
    }
    compress_block(dst, &payload);
}

/// Decodes exactly `rows_count` values from a strings block.
pub fn unmarshal_strings_block(src: &[u8], rows_count: usize) -> Result<Vec<Vec<u8>>> {
    let payload = decompress_block(src)?;
    let mut tail = payload.as_slice();
    let mut lens = Vec::with_capacity(rows_count);
    for i in 0..rows_count {
        let n = read_varuint64(&mut tail)
            .with_context(|| format!("cannot read length of value #{}", i))?;
        lens.push(n as usize);
    }
    let mut values = Vec::with_capacity(rows_count);
    for n in lens {
        ensure!(
            tail.len() >= n,
            "strings block is truncated: need {} bytes, have {}",
            n,
            tail.len()
        );
        let (v, rest) = tail.split_at(n);
        values.push(v.to_vec());
        tail = rest;
    }
    ensure!(
        tail.is_empty(),
        "unexpected {} trailing bytes in strings block",
        tail.len()
    );
    Ok(values)
}

/// Encodes ascending timestamps as a compressed block of varint deltas.
/// Returns the marshal type to store in the timestamps header.
pub fn marshal_timestamps(dst: &mut Vec<u8>, timestamps: &[i64]) -> u8 {
    let mut payload = Vec::with_capacity(timestamps.len() * 2);
    let mut prev = 0i64;
    for &ts in timestamps {
        write_varint64(&mut payload, ts.wrapping_sub(prev));
        prev = ts;
    }
    compress_block(dst, &payload);
    TIMESTAMPS_MARSHAL_TYPE_DELTA
}

/// Decodes `rows_count` timestamps written by [`marshal_timestamps`].
pub fn unmarshal_timestamps(src: &[u8], marshal_type: u8, rows_count: usize) -> Result<Vec<i64>> {
    ensure!(
        marshal_type == TIMESTAMPS_MARSHAL_TYPE_DELTA,
        "unknown timestamps marshal type {}",
        marshal_type
    );
    let payload = decompress_block(src)?;
    let mut tail = payload.as_slice();
    let mut timestamps = Vec::with_capacity(rows_count);
    let mut prev = 0i64;
    for _ in 0..rows_count {
        let delta = read_varint64(&mut tail)?;
        prev = prev.wrapping_add(delta);
        timestamps.push(prev);
    }
    ensure!(
        tail.is_empty(),
        "unexpected {} trailing bytes in timestamps block",
        tail.len()
    );
    Ok(timestamps)
}
