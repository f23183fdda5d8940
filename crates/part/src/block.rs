//! In-memory block: one stream's rows in columnar form.

use std::collections::HashMap;

use tracing::warn;

use crate::rows::{field_size_bytes, timestamps_size_bytes, Field};
use crate::{MAX_COLUMNS_PER_BLOCK, MAX_CONST_COLUMN_VALUE_SIZE};

/// A named column with one value per block row. Empty values mean the field
/// is missing in that row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub values: Vec<String>,
}

impl Column {
    fn is_const(&self) -> bool {
        match self.values.first() {
            Some(first) => {
                first.len() <= MAX_CONST_COLUMN_VALUE_SIZE && self.values.iter().all(|v| v == first)
            }
            None => false,
        }
    }

    fn is_empty(&self) -> bool {
        self.values.iter().all(|v| v.is_empty())
    }
}

/// Rows of a single stream split into columns.
///
/// Columns with the same value in every row are kept aside as const columns.
/// Both columns and const columns are sorted by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Block {
    timestamps: Vec<i64>,
    columns: Vec<Column>,
    const_columns: Vec<Field>,
}

impl Block {
    /// Builds a block from the leading rows, stopping before the row that
    /// would push the number of distinct columns over the per-block cap.
    ///
    /// Returns the block and the number of rows consumed. At least one row is
    /// consumed when `rows` is non-empty.
    pub fn from_rows(timestamps: &[i64], rows: &[Vec<Field>]) -> (Self, usize) {
        assert_eq!(
            timestamps.len(),
            rows.len(),
            "BUG: timestamps and rows must have the same length"
        );
        if rows.is_empty() {
            return (Self::default(), 0);
        }

        let (columns, consumed) = if same_field_names(rows) {
            (columns_from_uniform_rows(rows), rows.len())
        } else {
            columns_from_mixed_rows(rows)
        };
        if consumed < rows.len() {
            warn!(
                rows = rows.len(),
                consumed,
                limit = MAX_COLUMNS_PER_BLOCK,
                "splitting block at the columns limit"
            );
        }

        let mut block = Self {
            timestamps: timestamps[..consumed].to_vec(),
            columns: Vec::with_capacity(columns.len()),
            const_columns: Vec::new(),
        };
        for c in columns {
            if c.is_empty() {
                continue;
            }
            if c.is_const() {
                let value = c.values.into_iter().next().unwrap_or_default();
                block.const_columns.push(Field { name: c.name, value });
            } else {
                block.columns.push(c);
            }
        }
        block.sort_columns();
        (block, consumed)
    }

    /// Assembles a block from already decoded parts.
    pub(crate) fn from_parts(
        timestamps: Vec<i64>,
        columns: Vec<Column>,
        const_columns: Vec<Field>,
    ) -> Self {
        let mut block = Self {
            timestamps,
            columns,
            const_columns,
        };
        block.sort_columns();
        block
    }

    fn sort_columns(&mut self) {
        self.columns.sort_by(|a, b| a.name.cmp(&b.name));
        self.const_columns.sort_by(|a, b| a.name.cmp(&b.name));
    }

    #[must_use]
    pub fn rows_count(&self) -> usize {
        self.timestamps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    #[must_use]
    pub fn timestamps(&self) -> &[i64] {
        &self.timestamps
    }

    #[must_use]
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    #[must_use]
    pub fn const_columns(&self) -> &[Field] {
        &self.const_columns
    }

    /// Number of distinct column names, const ones included.
    #[must_use]
    pub fn columns_count(&self) -> usize {
        self.columns.len() + self.const_columns.len()
    }

    /// Estimated uncompressed size; equals the summed row sizes of the rows
    /// the block was built from.
    #[must_use]
    pub fn uncompressed_size_bytes(&self) -> u64 {
        let rows = self.rows_count() as u64;
        let mut n = timestamps_size_bytes(self.rows_count());
        for c in &self.columns {
            n += c
                .values
                .iter()
                .map(|v| field_size_bytes(&c.name, v))
                .sum::<u64>();
        }
        for f in &self.const_columns {
            n += rows * f.uncompressed_size_bytes();
        }
        n
    }

    /// Appends the block rows to `timestamps` and `rows`. Each row gets its
    /// non-empty fields sorted by name.
    pub fn append_rows_to(&self, timestamps: &mut Vec<i64>, rows: &mut Vec<Vec<Field>>) {
        enum Source<'a> {
            Const(&'a Field),
            Column(&'a Column),
        }
        let mut sources: Vec<(&str, Source<'_>)> = self
            .const_columns
            .iter()
            .map(|f| (f.name.as_str(), Source::Const(f)))
            .chain(
                self.columns
                    .iter()
                    .map(|c| (c.name.as_str(), Source::Column(c))),
            )
            .collect();
        sources.sort_by(|a, b| a.0.cmp(b.0));

        timestamps.extend_from_slice(&self.timestamps);
        rows.reserve(self.rows_count());
        for i in 0..self.rows_count() {
            let mut row = Vec::with_capacity(sources.len());
            for (name, src) in &sources {
                let value = match src {
                    Source::Const(f) => &f.value,
                    Source::Column(c) => &c.values[i],
                };
                if !value.is_empty() {
                    row.push(Field {
                        name: name.to_string(),
                        value: value.clone(),
                    });
                }
            }
            rows.push(row);
        }
    }
}

fn same_field_names(rows: &[Vec<Field>]) -> bool {
    let first = &rows[0];
    if first.len() > MAX_COLUMNS_PER_BLOCK {
        return false;
    }
    rows[1..].iter().all(|row| {
        row.len() == first.len() && row.iter().zip(first).all(|(a, b)| a.name == b.name)
    })
}

fn columns_from_uniform_rows(rows: &[Vec<Field>]) -> Vec<Column> {
    let mut columns: Vec<Column> = rows[0]
        .iter()
        .map(|f| Column {
            name: f.name.clone(),
            values: Vec::with_capacity(rows.len()),
        })
        .collect();
    for row in rows {
        for (c, f) in columns.iter_mut().zip(row) {
            c.values.push(f.value.clone());
        }
    }
    columns
}

fn columns_from_mixed_rows(rows: &[Vec<Field>]) -> (Vec<Column>, usize) {
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut columns: Vec<Column> = Vec::new();

    for (i, row) in rows.iter().enumerate() {
        let new_names = row
            .iter()
            .filter(|f| !index.contains_key(f.name.as_str()))
            .count();
        if i > 0 && columns.len() + new_names > MAX_COLUMNS_PER_BLOCK {
            return (columns, i);
        }
        for f in row {
            let idx = *index.entry(f.name.as_str()).or_insert_with(|| {
                columns.push(Column {
                    name: f.name.clone(),
                    values: vec![String::new(); i],
                });
                columns.len() - 1
            });
            let c = &mut columns[idx];
            if c.values.len() == i {
                c.values.push(f.value.clone());
            }
        }
        for c in columns.iter_mut() {
            if c.values.len() == i {
                c.values.push(String::new());
            }
        }
    }
    (columns, rows.len())
}
