//! Chunk metadata table and its Parquet encoding.
//!
//! Row `i` of the table describes vector `i` of the flat index. The file
//! carries two non-null UTF-8 columns, `title` and `text`, which is also what
//! pandas writes for the same frame.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use arrow_array::cast::AsArray;
use arrow_array::{ArrayRef, RecordBatch, StringArray};
use arrow_schema::{DataType, Field, Schema};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::file::reader::ChunkReader;
use serde::{Deserialize, Serialize};

const TITLE_COLUMN: &str = "title";
const TEXT_COLUMN: &str = "text";
const WRITE_BATCH_ROWS: usize = 4096;

/// A retrievable chunk: the parent document title plus the chunk body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    /// Title of the document the chunk came from.
    pub title: String,
    /// Chunk text.
    pub text: String,
}

/// Ordered chunk records; the ordinal is the join key with the index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataTable {
    rows: Vec<ChunkRecord>,
}

impl MetadataTable {
    /// Wraps rows in insertion order.
    pub fn new(rows: Vec<ChunkRecord>) -> Self {
        Self { rows }
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True when the table has no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Row at `ordinal`.
    pub fn get(&self, ordinal: usize) -> Option<&ChunkRecord> {
        self.rows.get(ordinal)
    }

    /// All rows in ordinal order.
    pub fn rows(&self) -> &[ChunkRecord] {
        &self.rows
    }

    /// Writes the table to a Parquet file at `path`.
    pub fn write_parquet(&self, path: &Path) -> Result<()> {
        let schema = Arc::new(Schema::new(vec![
            Field::new(TITLE_COLUMN, DataType::Utf8, false),
            Field::new(TEXT_COLUMN, DataType::Utf8, false),
        ]));
        let file =
            File::create(path).with_context(|| format!("failed to create {:?}", path))?;
        let mut writer = ArrowWriter::try_new(file, Arc::clone(&schema), None)
            .context("failed to start parquet writer")?;
        for rows in self.rows.chunks(WRITE_BATCH_ROWS) {
            let titles = StringArray::from_iter_values(rows.iter().map(|r| r.title.as_str()));
            let texts = StringArray::from_iter_values(rows.iter().map(|r| r.text.as_str()));
            let columns: Vec<ArrayRef> = vec![Arc::new(titles), Arc::new(texts)];
            let batch = RecordBatch::try_new(Arc::clone(&schema), columns)
                .context("failed to assemble metadata record batch")?;
            writer
                .write(&batch)
                .context("failed to write metadata record batch")?;
        }
        writer.close().context("failed to finalize parquet file")?;
        Ok(())
    }

    /// Reads a table written by [`MetadataTable::write_parquet`] (or pandas).
    pub fn read_parquet(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("failed to open {:?}", path))?;
        let rows = read_title_text(file, None)
            .with_context(|| format!("failed to read metadata table {:?}", path))?;
        Ok(Self::new(
            rows.into_iter()
                .map(|(title, text)| ChunkRecord { title, text })
                .collect(),
        ))
    }
}

impl FromIterator<ChunkRecord> for MetadataTable {
    fn from_iter<I: IntoIterator<Item = ChunkRecord>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Reads `(title, text)` pairs from any Parquet source with those columns.
pub(crate) fn read_title_text<R>(reader: R, limit: Option<usize>) -> Result<Vec<(String, String)>>
where
    R: ChunkReader + 'static,
{
    let mut builder =
        ParquetRecordBatchReaderBuilder::try_new(reader).context("not a parquet file")?;
    if let Some(limit) = limit {
        builder = builder.with_limit(limit);
    }
    let batches = builder.build().context("failed to build parquet reader")?;

    let mut rows = Vec::new();
    for batch in batches {
        let batch = batch.context("failed to decode parquet record batch")?;
        let titles = string_values(&batch, TITLE_COLUMN, rows.len())?;
        let texts = string_values(&batch, TEXT_COLUMN, rows.len())?;
        rows.extend(titles.into_iter().zip(texts));
    }
    Ok(rows)
}

fn string_values(batch: &RecordBatch, name: &str, first_row: usize) -> Result<Vec<String>> {
    let column = batch
        .column_by_name(name)
        .with_context(|| format!("parquet file has no '{name}' column"))?;
    let values: Vec<Option<&str>> = if let Some(array) = column.as_string_opt::<i32>() {
        array.iter().collect()
    } else if let Some(array) = column.as_string_opt::<i64>() {
        array.iter().collect()
    } else {
        bail!(
            "column '{name}' has type {}, expected a string column",
            column.data_type()
        );
    };
    values
        .into_iter()
        .enumerate()
        .map(|(offset, value)| {
            value
                .map(str::to_owned)
                .with_context(|| format!("column '{name}' is null at row {}", first_row + offset))
        })
        .collect()
}
