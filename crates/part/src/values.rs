//! Column value codec.
//!
//! A column's string values are stored in the narrowest representation that
//! reproduces every value byte-for-byte on decode. Candidates are tried in
//! this order and the first one accepting all values wins:
//!
//! | Type               | Stored value                | min/max            |
//! |--------------------|-----------------------------|--------------------|
//! | `Dict`             | 1-byte id into a dictionary | -                  |
//! | `Uint8..Uint64`    | big-endian integer          | integer            |
//! | `Float64`          | big-endian IEEE-754 bits    | float bits         |
//! | `Ipv4`             | big-endian u32              | u32                |
//! | `TimestampIso8601` | big-endian i64 nanoseconds  | i64 as u64         |
//! | `String`           | raw bytes                   | -                  |

use anyhow::{bail, ensure, Context, Result};
use byteorder::{BigEndian, ByteOrder};
use chrono::{DateTime, NaiveDateTime};

use crate::encoding::{read_string, write_bytes};

/// Maximum number of distinct values in a dictionary-encoded column.
pub const MAX_DICT_LEN: usize = 8;

/// Maximum summed length of dictionary values.
pub const MAX_DICT_SIZE_BYTES: usize = 256;

const ISO8601_LEN: usize = "2006-01-02T15:04:05.000Z".len();
const ISO8601_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Encoding of the values stored in a column block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValueType {
    String = 1,
    Dict = 2,
    Uint8 = 3,
    Uint16 = 4,
    Uint32 = 5,
    Uint64 = 6,
    Float64 = 7,
    Ipv4 = 8,
    TimestampIso8601 = 9,
}

impl Default for ValueType {
    fn default() -> Self {
        Self::String
    }
}

impl ValueType {
    /// Parses the on-disk type byte.
    pub fn from_u8(b: u8) -> Result<Self> {
        Ok(match b {
            1 => Self::String,
            2 => Self::Dict,
            3 => Self::Uint8,
            4 => Self::Uint16,
            5 => Self::Uint32,
            6 => Self::Uint64,
            7 => Self::Float64,
            8 => Self::Ipv4,
            9 => Self::TimestampIso8601,
            other => bail!("unknown value type {}", other),
        })
    }

    /// Dictionary columns are matched against the dictionary directly, so
    /// they carry no bloom filter.
    #[must_use]
    pub fn has_bloom_filter(self) -> bool {
        self != Self::Dict
    }

    /// Width in bytes of min/max values in the column header, if any.
    #[must_use]
    pub fn min_max_width(self) -> Option<usize> {
        match self {
            Self::String | Self::Dict => None,
            Self::Uint8 => Some(1),
            Self::Uint16 => Some(2),
            Self::Uint32 | Self::Ipv4 => Some(4),
            Self::Uint64 | Self::Float64 | Self::TimestampIso8601 => Some(8),
        }
    }
}

/// Up to [`MAX_DICT_LEN`] distinct values of a dictionary-encoded column.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValuesDict {
    values: Vec<String>,
}

impl ValuesDict {
    /// Returns the id of `v`, adding it if there is still room.
    pub fn get_or_add(&mut self, v: &str) -> Option<u8> {
        if v.len() > MAX_DICT_SIZE_BYTES {
            return None;
        }
        let mut size = 0;
        for (i, existing) in self.values.iter().enumerate() {
            if existing == v {
                return Some(i as u8);
            }
            size += existing.len();
        }
        if self.values.len() >= MAX_DICT_LEN || size + v.len() > MAX_DICT_SIZE_BYTES {
            return None;
        }
        self.values.push(v.to_string());
        Some((self.values.len() - 1) as u8)
    }

    #[must_use]
    pub fn values(&self) -> &[String] {
        &self.values
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn marshal(&self, dst: &mut Vec<u8>) {
        assert!(
            self.values.len() <= MAX_DICT_LEN,
            "BUG: dictionary may contain at most {} values; got {}",
            MAX_DICT_LEN,
            self.values.len()
        );
        dst.push(self.values.len() as u8);
        for v in &self.values {
            write_bytes(dst, v.as_bytes());
        }
    }

    pub fn unmarshal(src: &mut &[u8]) -> Result<Self> {
        let (&n, tail) = src.split_first().context("cannot read dictionary length")?;
        *src = tail;
        ensure!(
            n as usize <= MAX_DICT_LEN,
            "dictionary length {} exceeds {}",
            n,
            MAX_DICT_LEN
        );
        let mut values = Vec::with_capacity(n as usize);
        for i in 0..n {
            let v = read_string(src)
                .with_context(|| format!("cannot read dictionary value #{}", i))?;
            values.push(v);
        }
        Ok(Self { values })
    }
}

/// The result of encoding one column's values.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedValues {
    pub value_type: ValueType,
    pub min_value: u64,
    pub max_value: u64,
    pub dict: ValuesDict,
    pub values: Vec<Vec<u8>>,
}

/// Encodes `values` with the first representation that accepts all of them.
pub fn encode_values(values: &[String]) -> EncodedValues {
    if values.is_empty() {
        return EncodedValues {
            value_type: ValueType::String,
            min_value: 0,
            max_value: 0,
            dict: ValuesDict::default(),
            values: Vec::new(),
        };
    }
    try_dict_encoding(values)
        .or_else(|| try_uint_encoding(values))
        .or_else(|| try_float64_encoding(values))
        .or_else(|| try_ipv4_encoding(values))
        .or_else(|| try_timestamp_iso8601_encoding(values))
        .unwrap_or_else(|| EncodedValues {
            value_type: ValueType::String,
            min_value: 0,
            max_value: 0,
            dict: ValuesDict::default(),
            values: values.iter().map(|v| v.as_bytes().to_vec()).collect(),
        })
}

/// Restores the original strings from encoded values.
pub fn decode_values(values: &[Vec<u8>], vt: ValueType, dict: &ValuesDict) -> Result<Vec<String>> {
    let check_len = |v: &[u8], want: usize| -> Result<()> {
        ensure!(
            v.len() == want,
            "unexpected value length for {:?}; got {}; want {}",
            vt,
            v.len(),
            want
        );
        Ok(())
    };

    let mut out = Vec::with_capacity(values.len());
    for v in values {
        let s = match vt {
            ValueType::String => String::from_utf8(v.clone()).context("value is not valid UTF-8")?,
            ValueType::Dict => {
                check_len(v, 1)?;
                let id = v[0] as usize;
                match dict.values().get(id) {
                    Some(s) => s.clone(),
                    None => bail!(
                        "unexpected dictionary id {}; it must be smaller than {}",
                        id,
                        dict.len()
                    ),
                }
            }
            ValueType::Uint8 => {
                check_len(v, 1)?;
                v[0].to_string()
            }
            ValueType::Uint16 => {
                check_len(v, 2)?;
                BigEndian::read_u16(v).to_string()
            }
            ValueType::Uint32 => {
                check_len(v, 4)?;
                BigEndian::read_u32(v).to_string()
            }
            ValueType::Uint64 => {
                check_len(v, 8)?;
                BigEndian::read_u64(v).to_string()
            }
            ValueType::Float64 => {
                check_len(v, 8)?;
                format_float64(f64::from_bits(BigEndian::read_u64(v)))
            }
            ValueType::Ipv4 => {
                check_len(v, 4)?;
                format_ipv4(BigEndian::read_u32(v))
            }
            ValueType::TimestampIso8601 => {
                check_len(v, 8)?;
                let nsecs = BigEndian::read_u64(v) as i64;
                format_timestamp_iso8601(nsecs)
                    .with_context(|| format!("timestamp {} is out of range", nsecs))?
            }
        };
        out.push(s);
    }
    Ok(out)
}

// -------------------- Candidate encodings --------------------

fn try_dict_encoding(values: &[String]) -> Option<EncodedValues> {
    let mut dict = ValuesDict::default();
    let mut encoded = Vec::with_capacity(values.len());
    for v in values {
        let id = dict.get_or_add(v)?;
        encoded.push(vec![id]);
    }
    Some(EncodedValues {
        value_type: ValueType::Dict,
        min_value: 0,
        max_value: 0,
        dict,
        values: encoded,
    })
}

fn try_uint_encoding(values: &[String]) -> Option<EncodedValues> {
    let nums = values
        .iter()
        .map(|v| try_parse_uint64(v))
        .collect::<Option<Vec<u64>>>()?;
    let min_value = *nums.iter().min()?;
    let max_value = *nums.iter().max()?;

    let bits = 64 - max_value.leading_zeros();
    let (value_type, width) = match bits {
        0..=8 => (ValueType::Uint8, 1),
        9..=16 => (ValueType::Uint16, 2),
        17..=32 => (ValueType::Uint32, 4),
        _ => (ValueType::Uint64, 8),
    };
    let encoded = nums
        .iter()
        .map(|&n| {
            let mut buf = vec![0u8; width];
            match width {
                1 => buf[0] = n as u8,
                2 => BigEndian::write_u16(&mut buf, n as u16),
                4 => BigEndian::write_u32(&mut buf, n as u32),
                _ => BigEndian::write_u64(&mut buf, n),
            }
            buf
        })
        .collect();
    Some(EncodedValues {
        value_type,
        min_value,
        max_value,
        dict: ValuesDict::default(),
        values: encoded,
    })
}

fn try_float64_encoding(values: &[String]) -> Option<EncodedValues> {
    let nums = values
        .iter()
        .map(|v| try_parse_float64(v))
        .collect::<Option<Vec<f64>>>()?;
    let min_value = nums.iter().copied().fold(f64::INFINITY, f64::min);
    let max_value = nums.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let encoded = nums
        .iter()
        .map(|f| f.to_bits().to_be_bytes().to_vec())
        .collect();
    Some(EncodedValues {
        value_type: ValueType::Float64,
        min_value: min_value.to_bits(),
        max_value: max_value.to_bits(),
        dict: ValuesDict::default(),
        values: encoded,
    })
}

fn try_ipv4_encoding(values: &[String]) -> Option<EncodedValues> {
    let ips = values
        .iter()
        .map(|v| try_parse_ipv4(v))
        .collect::<Option<Vec<u32>>>()?;
    let min_value = *ips.iter().min()? as u64;
    let max_value = *ips.iter().max()? as u64;
    let encoded = ips.iter().map(|ip| ip.to_be_bytes().to_vec()).collect();
    Some(EncodedValues {
        value_type: ValueType::Ipv4,
        min_value,
        max_value,
        dict: ValuesDict::default(),
        values: encoded,
    })
}

fn try_timestamp_iso8601_encoding(values: &[String]) -> Option<EncodedValues> {
    let timestamps = values
        .iter()
        .map(|v| try_parse_timestamp_iso8601(v))
        .collect::<Option<Vec<i64>>>()?;
    let min_value = *timestamps.iter().min()?;
    let max_value = *timestamps.iter().max()?;
    let encoded = timestamps
        .iter()
        .map(|&ts| (ts as u64).to_be_bytes().to_vec())
        .collect();
    Some(EncodedValues {
        value_type: ValueType::TimestampIso8601,
        min_value: min_value as u64,
        max_value: max_value as u64,
        dict: ValuesDict::default(),
        values: encoded,
    })
}

// -------------------- Parsers and formatters --------------------

/// Parses a canonical decimal `u64`: digits only, no sign, no leading zeros.
#[must_use]
pub fn try_parse_uint64(s: &str) -> Option<u64> {
    let b = s.as_bytes();
    if b.is_empty() || b.len() > 20 || !b.iter().all(u8::is_ascii_digit) {
        return None;
    }
    if b.len() > 1 && b[0] == b'0' {
        return None;
    }
    s.parse().ok()
}

/// Parses a decimal float without exponent that formats back to exactly `s`.
#[must_use]
pub fn try_parse_float64(s: &str) -> Option<f64> {
    let unsigned = s.strip_prefix('-').unwrap_or(s);
    let (int_part, frac_part) = match unsigned.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (unsigned, None),
    };
    if int_part.is_empty() || !int_part.bytes().all(|c| c.is_ascii_digit()) {
        return None;
    }
    if let Some(frac) = frac_part {
        if frac.is_empty() || !frac.bytes().all(|c| c.is_ascii_digit()) {
            return None;
        }
    }
    let f: f64 = s.parse().ok()?;
    if !f.is_finite() || format_float64(f) != s {
        return None;
    }
    Some(f)
}

#[must_use]
pub fn format_float64(f: f64) -> String {
    format!("{}", f)
}

/// Parses a dotted-quad IPv4 address in canonical form.
#[must_use]
pub fn try_parse_ipv4(s: &str) -> Option<u32> {
    if s.len() < "1.1.1.1".len() || s.len() > "255.255.255.255".len() {
        return None;
    }
    let mut ip = 0u32;
    let mut octets = 0;
    for part in s.split('.') {
        let n = try_parse_uint64(part)?;
        if n > 255 {
            return None;
        }
        ip = (ip << 8) | n as u32;
        octets += 1;
    }
    (octets == 4).then_some(ip)
}

#[must_use]
pub fn format_ipv4(ip: u32) -> String {
    let [a, b, c, d] = ip.to_be_bytes();
    format!("{}.{}.{}.{}", a, b, c, d)
}

/// Parses `YYYY-MM-DDThh:mm:ss.mssZ` into unix nanoseconds.
///
/// Only the exact UTC millisecond form is accepted, since other forms
/// cannot be restored to the same string.
#[must_use]
pub fn try_parse_timestamp_iso8601(s: &str) -> Option<i64> {
    if s.len() != ISO8601_LEN || !s.is_ascii() {
        return None;
    }
    let b = s.as_bytes();
    if b[19] != b'.' || b[23] != b'Z' {
        return None;
    }
    let secs = NaiveDateTime::parse_from_str(&s[..19], "%Y-%m-%dT%H:%M:%S").ok()?;
    let millis = &s[20..23];
    if !millis.bytes().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let millis: i64 = millis.parse().ok()?;
    let nsecs = secs
        .and_utc()
        .timestamp_nanos_opt()?
        .checked_add(millis * 1_000_000)?;
    if format_timestamp_iso8601(nsecs)? != s {
        return None;
    }
    Some(nsecs)
}

/// Formats unix nanoseconds as `YYYY-MM-DDThh:mm:ss.mssZ`.
#[must_use]
pub fn format_timestamp_iso8601(nsecs: i64) -> Option<String> {
    let secs = nsecs.div_euclid(1_000_000_000);
    let sub = nsecs.rem_euclid(1_000_000_000) as u32;
    let dt = DateTime::from_timestamp(secs, sub)?;
    Some(dt.format(ISO8601_FORMAT).to_string())
}
