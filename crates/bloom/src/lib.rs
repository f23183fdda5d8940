//! # Bloom - token bloom filters
//!
//! A space-efficient probabilistic structure answering "may this column block
//! contain the given token?". No false negatives, occasional false positives.
//!
//! ## Usage in Silt
//!
//! Every non-dictionary column of every block carries a bloom filter built
//! from the lower-cased tokens of its values (see [`tokenize`]). Search code
//! checks the filter first: if any required token is definitely absent the
//! whole column block is skipped without reading its values.
//!
//! ## Sizing
//!
//! The filter is sized from the number of distinct tokens:
//!
//! ```text
//! bits   = tokens * BITS_PER_TOKEN   (rounded up to whole u64 words)
//! probes = HASHES_COUNT per token, each from a reseeded 64-bit hash
//! ```
//!
//! ## Example
//!
//! ```rust
//! use bloom::{tokenize, BloomFilter};
//!
//! let tokens = tokenize("GET /api/v1/users 200");
//! let bf = BloomFilter::from_tokens(&tokens);
//! assert!(bf.contains_all(&["api", "users"]));
//! ```

mod tokenizer;

pub use tokenizer::tokenize;

use std::io;

/// Number of hash probes per token.
pub const HASHES_COUNT: usize = 6;

/// Bits of filter space reserved per token.
pub const BITS_PER_TOKEN: usize = 16;

/// Maximum serialized filter size accepted when decoding (8 MiB).
pub const MAX_BLOOM_BYTES: usize = 8 * 1024 * 1024;

const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
const FNV_SECOND_BASIS: u64 = 0x517cc1b727220a95;

/// A bloom filter over string tokens, backed by 64-bit words.
#[derive(Clone, PartialEq, Eq)]
pub struct BloomFilter {
    bits: Vec<u64>,
}

impl BloomFilter {
    /// Creates an empty filter sized for `tokens_count` distinct tokens.
    pub fn with_capacity(tokens_count: usize) -> Self {
        let num_bits = tokens_count.max(1) * BITS_PER_TOKEN;
        let words = (num_bits + 63) / 64;
        Self {
            bits: vec![0u64; words],
        }
    }

    /// Builds a filter containing every token in `tokens`.
    pub fn from_tokens<S: AsRef<str>>(tokens: &[S]) -> Self {
        let mut bf = Self::with_capacity(tokens.len());
        for token in tokens {
            bf.insert(token.as_ref());
        }
        bf
    }

    /// Inserts a token.
    pub fn insert(&mut self, token: &str) {
        let num_bits = self.num_bits();
        let h = fnv1a_64(token.as_bytes(), FNV_OFFSET_BASIS);
        for i in 0..HASHES_COUNT {
            let idx = probe_hash(h, i) % num_bits;
            self.bits[(idx / 64) as usize] |= 1u64 << (idx % 64);
        }
    }

    /// Returns `true` if the token **might** be present, `false` if it is
    /// **definitely not** present.
    #[must_use]
    pub fn may_contain(&self, token: &str) -> bool {
        let num_bits = self.num_bits();
        let h = fnv1a_64(token.as_bytes(), FNV_OFFSET_BASIS);
        (0..HASHES_COUNT).all(|i| {
            let idx = probe_hash(h, i) % num_bits;
            self.bits[(idx / 64) as usize] & (1u64 << (idx % 64)) != 0
        })
    }

    /// Returns `true` if every token might be present.
    #[must_use]
    pub fn contains_all<S: AsRef<str>>(&self, tokens: &[S]) -> bool {
        tokens.iter().all(|t| self.may_contain(t.as_ref()))
    }

    /// Returns the number of bits in the filter.
    #[must_use]
    pub fn num_bits(&self) -> u64 {
        self.bits.len() as u64 * 64
    }

    /// Returns the number of hash probes per token.
    #[must_use]
    pub fn num_hashes(&self) -> usize {
        HASHES_COUNT
    }

    /// Returns the size of the serialized filter in bytes.
    #[must_use]
    pub fn serialized_size(&self) -> usize {
        self.bits.len() * 8
    }

    /// Appends the serialized filter to `dst`.
    ///
    /// Wire format: the bit words, each as a little-endian `u64`. The word
    /// count is implied by the byte length stored in the column header.
    pub fn marshal(&self, dst: &mut Vec<u8>) {
        dst.reserve(self.serialized_size());
        for word in &self.bits {
            dst.extend_from_slice(&word.to_le_bytes());
        }
    }

    /// Decodes a filter previously written by [`marshal`](Self::marshal).
    pub fn unmarshal(src: &[u8]) -> io::Result<Self> {
        if src.is_empty() || src.len() % 8 != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("bloom filter length must be a non-zero multiple of 8; got {}", src.len()),
            ));
        }
        if src.len() > MAX_BLOOM_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("bloom filter too large: {} bytes", src.len()),
            ));
        }
        let bits = src
            .chunks_exact(8)
            .map(|chunk| {
                let mut word = [0u8; 8];
                word.copy_from_slice(chunk);
                u64::from_le_bytes(word)
            })
            .collect();
        Ok(Self { bits })
    }
}

impl std::fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BloomFilter")
            .field("num_bits", &self.num_bits())
            .field("num_hashes", &HASHES_COUNT)
            .field("bytes", &self.serialized_size())
            .finish()
    }
}

/// Returns a 64-bit hash of `data`.
#[must_use]
pub fn hash64(data: &[u8]) -> u64 {
    fnv1a_64(data, FNV_OFFSET_BASIS)
}

/// Returns a 128-bit hash of `data` as `(hi, lo)` halves.
///
/// The halves come from FNV-1a runs with two different bases, each passed
/// through a finalizer so that short inputs still spread over all bits.
#[must_use]
pub fn hash128(data: &[u8]) -> (u64, u64) {
    let hi = mix64(fnv1a_64(data, FNV_OFFSET_BASIS));
    let lo = mix64(fnv1a_64(data, FNV_SECOND_BASIS));
    (hi, lo)
}

/// Derives the hash for probe `i` by reseeding the token hash.
fn probe_hash(h: u64, i: usize) -> u64 {
    mix64(h ^ (i as u64 + 1).wrapping_mul(0x9e3779b97f4a7c15))
}

/// 64-bit finalizer from SplitMix64.
fn mix64(mut x: u64) -> u64 {
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58476d1ce4e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d049bb133111eb);
    x ^ (x >> 31)
}

/// FNV-1a 64-bit hash with a configurable starting basis.
fn fnv1a_64(data: &[u8], basis: u64) -> u64 {
    const FNV_PRIME: u64 = 0x00000100000001b3;
    let mut hash = basis;
    for &byte in data {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[cfg(test)]
mod tests;
