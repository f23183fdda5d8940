use anyhow::{ensure, Result};
use byteorder::{BigEndian, ReadBytesExt};
use std::fmt;

/// Marshaled size of a [`StreamId`]: two u32 tenant halves plus a 128-bit id.
pub const STREAM_ID_SIZE: usize = 24;

/// Tenant owning a stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TenantId {
    pub account_id: u32,
    pub project_id: u32,
}

/// Identifies a log stream: tenant plus a 128-bit hash of the canonical
/// stream tags.
///
/// Ordering is (tenant, hi, lo); blocks inside a part are sorted by it.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId {
    pub tenant_id: TenantId,
    pub hi: u64,
    pub lo: u64,
}

impl StreamId {
    /// Derives the stream id from canonical stream tags.
    pub fn from_canonical_tags(tenant_id: TenantId, canonical: &[u8]) -> Self {
        let (hi, lo) = bloom::hash128(canonical);
        Self { tenant_id, hi, lo }
    }

    pub fn marshal(&self, dst: &mut Vec<u8>) {
        dst.reserve(STREAM_ID_SIZE);
        dst.extend_from_slice(&self.tenant_id.account_id.to_be_bytes());
        dst.extend_from_slice(&self.tenant_id.project_id.to_be_bytes());
        dst.extend_from_slice(&self.hi.to_be_bytes());
        dst.extend_from_slice(&self.lo.to_be_bytes());
    }

    pub fn unmarshal(src: &mut &[u8]) -> Result<Self> {
        ensure!(
            src.len() >= STREAM_ID_SIZE,
            "cannot unmarshal stream id from {} bytes; need {}",
            src.len(),
            STREAM_ID_SIZE
        );
        let account_id = src.read_u32::<BigEndian>()?;
        let project_id = src.read_u32::<BigEndian>()?;
        let hi = src.read_u64::<BigEndian>()?;
        let lo = src.read_u64::<BigEndian>()?;
        Ok(Self {
            tenant_id: TenantId {
                account_id,
                project_id,
            },
            hi,
            lo,
        })
    }
}

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamId({})", self)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:08x}{:08x}{:016x}{:016x}",
            self.tenant_id.account_id, self.tenant_id.project_id, self.hi, self.lo
        )
    }
}
