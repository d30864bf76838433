//! Exact nearest-neighbour search over dense `f32` vectors.
//!
//! [`FlatL2Index`] keeps every vector in one row-major buffer and answers
//! queries by scanning all of them, so results are exact and there is nothing
//! to tune. Indexes are stored in the FAISS `IndexFlatL2` binary layout: files
//! written here open with `faiss.read_index` and vice versa.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use serde::Serialize;
use thiserror::Error;

mod format;

/// Errors raised while building, querying or (de)serializing an index.
#[derive(Debug, Error)]
pub enum FlatIndexError {
    /// Indexes need at least one dimension.
    #[error("index dimension must be positive")]
    ZeroDimension,
    /// A vector or query did not match the index dimensionality.
    #[error("vector dimension mismatch: index has {expected}, got {got}")]
    DimensionMismatch {
        /// Dimension the index was created with.
        expected: usize,
        /// Length of the offending vector.
        got: usize,
    },
    /// A flat buffer could not be split into whole rows.
    #[error("buffer of {len} floats is not a multiple of dimension {dim}")]
    RaggedBuffer {
        /// Number of floats supplied.
        len: usize,
        /// Index dimensionality.
        dim: usize,
    },
    /// The file holds some other FAISS index type.
    #[error("unsupported index type {0:?}, expected \"IxF2\"")]
    UnsupportedIndexType(String),
    /// The file holds a flat index with a non-L2 metric.
    #[error("unsupported metric type {0}, expected L2")]
    UnsupportedMetric(i32),
    /// Header and payload disagree, or the payload is cut short.
    #[error("corrupt index file: {0}")]
    Corrupt(String),
    /// Underlying reader or writer failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, FlatIndexError>;

/// A search hit: row ordinal plus squared Euclidean distance to the query.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Neighbor {
    /// Position of the vector in insertion order.
    pub ordinal: usize,
    /// Squared L2 distance, the value FAISS reports for `IndexFlatL2`.
    pub distance: f32,
}

/// Shape of an index, as printed by the `flat_index` binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexSummary {
    /// Vector dimensionality.
    pub dimensions: usize,
    /// Number of stored vectors.
    pub ntotal: usize,
    /// Distance metric name.
    pub metric: &'static str,
}

/// Exhaustive L2 index. Append-only; there is no removal.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatL2Index {
    dim: usize,
    data: Vec<f32>,
}

impl FlatL2Index {
    /// Creates an empty index for vectors of length `dim`.
    pub fn new(dim: usize) -> Result<Self> {
        if dim == 0 {
            return Err(FlatIndexError::ZeroDimension);
        }
        Ok(Self {
            dim,
            data: Vec::new(),
        })
    }

    /// Vector dimensionality.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of stored vectors.
    pub fn ntotal(&self) -> usize {
        self.data.len() / self.dim
    }

    /// True when no vectors have been added.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Row-major view of every stored float.
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Returns the stored vector at `ordinal`.
    pub fn vector(&self, ordinal: usize) -> Option<&[f32]> {
        let start = ordinal.checked_mul(self.dim)?;
        let end = start.checked_add(self.dim)?;
        self.data.get(start..end)
    }

    /// Appends a row-major buffer holding one or more vectors.
    pub fn add(&mut self, flat: &[f32]) -> Result<()> {
        if flat.len() % self.dim != 0 {
            return Err(FlatIndexError::RaggedBuffer {
                len: flat.len(),
                dim: self.dim,
            });
        }
        self.data.extend_from_slice(flat);
        Ok(())
    }

    /// Appends vectors one row at a time. Nothing is added if any row has the
    /// wrong length.
    pub fn add_rows<I, V>(&mut self, rows: I) -> Result<()>
    where
        I: IntoIterator<Item = V>,
        V: AsRef<[f32]>,
    {
        let start = self.data.len();
        for row in rows {
            let row = row.as_ref();
            if row.len() != self.dim {
                self.data.truncate(start);
                return Err(FlatIndexError::DimensionMismatch {
                    expected: self.dim,
                    got: row.len(),
                });
            }
            self.data.extend_from_slice(row);
        }
        Ok(())
    }

    /// Returns the `k` nearest vectors to `query`, closest first. Equal
    /// distances are ordered by ordinal. At most `ntotal` hits come back.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        if query.len() != self.dim {
            return Err(FlatIndexError::DimensionMismatch {
                expected: self.dim,
                got: query.len(),
            });
        }
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }

        let mut hits: Vec<Neighbor> = self
            .data
            .chunks_exact(self.dim)
            .enumerate()
            .map(|(ordinal, row)| Neighbor {
                ordinal,
                distance: squared_l2(query, row),
            })
            .collect();
        let k = k.min(hits.len());
        if k < hits.len() {
            hits.select_nth_unstable_by(k - 1, by_distance);
            hits.truncate(k);
        }
        hits.sort_unstable_by(by_distance);
        Ok(hits)
    }

    /// Shape summary.
    pub fn summary(&self) -> IndexSummary {
        IndexSummary {
            dimensions: self.dim,
            ntotal: self.ntotal(),
            metric: "L2",
        }
    }

    /// Serializes the index in the FAISS `IndexFlatL2` layout.
    pub fn write_to<W: Write>(&self, writer: W) -> Result<()> {
        format::write_index(self, writer)
    }

    /// Deserializes an index written by [`FlatL2Index::write_to`] or by FAISS.
    pub fn read_from<R: Read>(reader: R) -> Result<Self> {
        format::read_index(reader)
    }

    /// Writes the index to `path`, replacing any existing file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = File::create(path.as_ref())?;
        let mut writer = BufWriter::new(file);
        self.write_to(&mut writer)?;
        writer.flush()?;
        Ok(())
    }

    /// Reads an index from `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        Self::read_from(BufReader::new(file))
    }

    fn from_parts(dim: usize, data: Vec<f32>) -> Self {
        Self { dim, data }
    }
}

fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

fn by_distance(a: &Neighbor, b: &Neighbor) -> std::cmp::Ordering {
    a.distance
        .total_cmp(&b.distance)
        .then(a.ordinal.cmp(&b.ordinal))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FlatL2Index {
        let mut index = FlatL2Index::new(2).unwrap();
        index
            .add_rows([[0.0f32, 0.0], [1.0, 0.0], [0.0, 3.0], [5.0, 5.0]])
            .unwrap();
        index
    }

    #[test]
    fn rejects_zero_dimension() {
        assert!(matches!(
            FlatL2Index::new(0),
            Err(FlatIndexError::ZeroDimension)
        ));
    }

    #[test]
    fn search_orders_by_distance() {
        let index = sample();
        let hits = index.search(&[0.9, 0.1], 3).unwrap();
        let ordinals: Vec<usize> = hits.iter().map(|hit| hit.ordinal).collect();
        assert_eq!(ordinals, vec![1, 0, 2]);
        assert!((hits[0].distance - 0.02).abs() < 1e-6);
    }

    #[test]
    fn every_stored_vector_finds_itself() {
        let index = sample();
        for ordinal in 0..index.ntotal() {
            let query = index.vector(ordinal).unwrap().to_vec();
            let hits = index.search(&query, 1).unwrap();
            assert_eq!(hits[0].ordinal, ordinal);
            assert_eq!(hits[0].distance, 0.0);
        }
    }

    #[test]
    fn k_larger_than_index_returns_everything() {
        let index = sample();
        assert_eq!(index.search(&[0.0, 0.0], 50).unwrap().len(), 4);
        assert!(index.search(&[0.0, 0.0], 0).unwrap().is_empty());
    }

    #[test]
    fn out_of_range_ordinals_have_no_vector() {
        let index = sample();
        assert!(index.vector(4).is_none());
        assert!(index.vector(usize::MAX / 2).is_none());
        assert!(index.vector(usize::MAX).is_none());
    }

    #[test]
    fn ties_break_on_ordinal() {
        let mut index = FlatL2Index::new(1).unwrap();
        index.add(&[1.0, -1.0, 1.0]).unwrap();
        let hits = index.search(&[0.0], 3).unwrap();
        let ordinals: Vec<usize> = hits.iter().map(|hit| hit.ordinal).collect();
        assert_eq!(ordinals, vec![0, 1, 2]);
    }

    #[test]
    fn bad_rows_leave_index_untouched() {
        let mut index = sample();
        let rows: Vec<Vec<f32>> = vec![vec![1.0, 1.0], vec![1.0]];
        let err = index.add_rows(&rows).unwrap_err();
        assert!(matches!(
            err,
            FlatIndexError::DimensionMismatch {
                expected: 2,
                got: 1
            }
        ));
        assert_eq!(index.ntotal(), 4);
        assert!(index.add(&[1.0, 2.0, 3.0]).is_err());
        assert!(index.search(&[1.0], 1).is_err());
    }
}
