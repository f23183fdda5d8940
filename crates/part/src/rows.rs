//! Log rows as they arrive at ingestion, before columnar encoding.

use std::cmp::Ordering;
use std::collections::HashSet;

use tracing::warn;

use crate::encoding::write_bytes;
use crate::stream_id::{StreamId, TenantId};
use crate::{MAX_COLUMNS_PER_BLOCK, MAX_FIELD_NAME_SIZE, MAX_UNCOMPRESSED_BLOCK_SIZE};

/// Public name of the message field, stored internally under the empty name.
pub const MSG_FIELD_NAME: &str = "_msg";

/// `len("2006-01-02T15:04:05.999999999Z07:00")`: the per-row cost of the
/// timestamp in uncompressed size accounting.
const RFC3339_NANO_LEN: u64 = 35;

/// A single `name=value` pair of a log row.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Field {
    pub name: String,
    pub value: String,
}

impl Field {
    /// Creates a field, mapping `_msg` to the internal empty name.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        let mut name = name.into();
        if name == MSG_FIELD_NAME {
            name.clear();
        }
        Self {
            name,
            value: value.into(),
        }
    }

    /// Uncompressed size this field contributes to one row.
    #[must_use]
    pub fn uncompressed_size_bytes(&self) -> u64 {
        field_size_bytes(&self.name, &self.value)
    }
}

pub(crate) fn field_size_bytes(name: &str, value: &str) -> u64 {
    if value.is_empty() {
        return 0;
    }
    let name_len = if name.is_empty() {
        MSG_FIELD_NAME.len()
    } else {
        name.len()
    };
    (name_len + 2 + value.len()) as u64
}

/// Estimated uncompressed size of a row, as if rendered as text.
#[must_use]
pub fn uncompressed_row_size_bytes(fields: &[Field]) -> u64 {
    RFC3339_NANO_LEN + fields.iter().map(Field::uncompressed_size_bytes).sum::<u64>()
}

/// Estimated uncompressed size of all `rows`.
#[must_use]
pub fn uncompressed_rows_size_bytes(rows: &[Vec<Field>]) -> u64 {
    rows.iter().map(|r| uncompressed_row_size_bytes(r)).sum()
}

pub(crate) fn timestamps_size_bytes(rows_count: usize) -> u64 {
    RFC3339_NANO_LEN * rows_count as u64
}

/// A batch of rows ready to be turned into an in-memory part.
///
/// Every row is tagged with the stream id derived from its stream fields.
/// Rows breaking per-row limits are dropped with a warning at
/// [`must_add`](LogRows::must_add) time.
#[derive(Debug, Clone, Default)]
pub struct LogRows {
    stream_ids: Vec<StreamId>,
    timestamps: Vec<i64>,
    rows: Vec<Vec<Field>>,
    stream_fields: HashSet<String>,
    default_msg_value: String,
}

impl LogRows {
    /// Creates an empty batch. Fields named in `stream_fields` identify the
    /// stream a row belongs to.
    pub fn new(stream_fields: &[&str]) -> Self {
        Self {
            stream_fields: stream_fields.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    /// Sets the `_msg` value added to rows that have none.
    pub fn with_default_msg_value(mut self, v: impl Into<String>) -> Self {
        self.default_msg_value = v.into();
        self
    }

    /// Adds a row whose stream is derived from the configured stream fields.
    pub fn must_add(&mut self, tenant_id: TenantId, timestamp: i64, fields: Vec<Field>) {
        let stream_tags: Vec<Field> = fields
            .iter()
            .filter(|f| self.stream_fields.contains(&f.name))
            .cloned()
            .collect();
        self.must_add_with_stream_tags(tenant_id, timestamp, fields, &stream_tags);
    }

    /// Adds a row with explicitly given stream tags.
    pub fn must_add_with_stream_tags(
        &mut self,
        tenant_id: TenantId,
        timestamp: i64,
        fields: Vec<Field>,
        stream_tags: &[Field],
    ) {
        if fields.len() > MAX_COLUMNS_PER_BLOCK {
            warn!(
                fields = fields.len(),
                limit = MAX_COLUMNS_PER_BLOCK,
                "ignoring log entry with too many fields"
            );
            return;
        }
        if let Some(f) = fields.iter().find(|f| f.name.len() > MAX_FIELD_NAME_SIZE) {
            warn!(
                field = %f.name,
                limit = MAX_FIELD_NAME_SIZE,
                "ignoring log entry with too long field name"
            );
            return;
        }
        let row_size = uncompressed_row_size_bytes(&fields);
        if row_size > MAX_UNCOMPRESSED_BLOCK_SIZE {
            warn!(
                size = row_size,
                limit = MAX_UNCOMPRESSED_BLOCK_SIZE,
                "ignoring too long log entry"
            );
            return;
        }

        let mut row: Vec<Field> = fields
            .into_iter()
            .map(|f| Field::new(f.name, f.value))
            .filter(|f| !f.value.is_empty())
            .collect();
        if !self.default_msg_value.is_empty() && !row.iter().any(|f| f.name.is_empty()) {
            row.push(Field::new("", self.default_msg_value.clone()));
        }
        row.sort_by(|a, b| a.name.cmp(&b.name));
        row.dedup_by(|a, b| a.name == b.name);

        let canonical = canonical_stream_tags(stream_tags);
        self.stream_ids
            .push(StreamId::from_canonical_tags(tenant_id, &canonical));
        self.timestamps.push(timestamp);
        self.rows.push(row);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    #[must_use]
    pub fn stream_ids(&self) -> &[StreamId] {
        &self.stream_ids
    }

    #[must_use]
    pub fn timestamps(&self) -> &[i64] {
        &self.timestamps
    }

    #[must_use]
    pub fn rows(&self) -> &[Vec<Field>] {
        &self.rows
    }

    /// Total uncompressed size of the batch.
    #[must_use]
    pub fn uncompressed_size_bytes(&self) -> u64 {
        uncompressed_rows_size_bytes(&self.rows)
    }

    /// Sorts rows by (stream id, timestamp), keeping arrival order for ties.
    pub fn sort(&mut self) {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.sort_by(|&a, &b| self.cmp_rows(a, b));

        let mut rows = std::mem::take(&mut self.rows);
        self.stream_ids = order.iter().map(|&i| self.stream_ids[i]).collect();
        self.timestamps = order.iter().map(|&i| self.timestamps[i]).collect();
        self.rows = order.iter().map(|&i| std::mem::take(&mut rows[i])).collect();
    }

    fn cmp_rows(&self, a: usize, b: usize) -> Ordering {
        self.stream_ids[a]
            .cmp(&self.stream_ids[b])
            .then_with(|| self.timestamps[a].cmp(&self.timestamps[b]))
    }

    /// Removes all rows, keeping stream field settings.
    pub fn reset(&mut self) {
        self.stream_ids.clear();
        self.timestamps.clear();
        self.rows.clear();
    }
}

/// Canonical byte form of stream tags: sorted by name, each as
/// length-prefixed name and value.
pub fn canonical_stream_tags(tags: &[Field]) -> Vec<u8> {
    let mut sorted: Vec<&Field> = tags.iter().collect();
    sorted.sort();
    let mut dst = Vec::new();
    for f in sorted {
        write_bytes(&mut dst, f.name.as_bytes());
        write_bytes(&mut dst, f.value.as_bytes());
    }
    dst
}
