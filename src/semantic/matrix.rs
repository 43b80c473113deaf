//! Row-major `N×D` float32 matrix of sentence embeddings.
//!
//! Blob format (as persisted by the note store):
//! - no header, the dimension is a deployment-wide constant
//! - `N * D` float32 values, row-major, little-endian

use serde::{Deserialize, Serialize};

const F32_SIZE: usize = std::mem::size_of::<f32>();

#[derive(Debug, thiserror::Error)]
pub enum MatrixError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Blob of {len} bytes is not a whole number of {dimensions}-dim rows")]
    TruncatedBlob { len: usize, dimensions: usize },

    #[error("Dimension must be greater than 0")]
    ZeroDimension,
}

/// Embeddings of one note: one row per sentence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embeddings {
    dimensions: usize,
    data: Vec<f32>,
}

impl Embeddings {
    /// Empty matrix (zero sentences).
    pub fn empty(dimensions: usize) -> Self {
        Self {
            dimensions,
            data: Vec::new(),
        }
    }

    /// Build a matrix from individual rows, checking every row's length.
    pub fn from_rows(dimensions: usize, rows: Vec<Vec<f32>>) -> Result<Self, MatrixError> {
        if dimensions == 0 {
            return Err(MatrixError::ZeroDimension);
        }

        let mut data = Vec::with_capacity(rows.len() * dimensions);
        for row in rows {
            if row.len() != dimensions {
                return Err(MatrixError::DimensionMismatch {
                    expected: dimensions,
                    got: row.len(),
                });
            }
            data.extend(row);
        }

        Ok(Self { dimensions, data })
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Number of rows (sentences).
    pub fn rows(&self) -> usize {
        if self.dimensions == 0 {
            0
        } else {
            self.data.len() / self.dimensions
        }
    }

    pub fn row(&self, idx: usize) -> Option<&[f32]> {
        let start = idx.checked_mul(self.dimensions)?;
        self.data.get(start..start + self.dimensions)
    }

    pub fn iter_rows(&self) -> impl Iterator<Item = &[f32]> {
        self.data.chunks_exact(self.dimensions.max(1))
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn to_nested(&self) -> Vec<Vec<f32>> {
        self.iter_rows().map(<[f32]>::to_vec).collect()
    }

    /// Encode to the persisted blob format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.data.len() * F32_SIZE);
        for value in &self.data {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        bytes
    }

    /// Decode a persisted blob by reshaping it with `dimensions` columns.
    pub fn from_bytes(bytes: &[u8], dimensions: usize) -> Result<Self, MatrixError> {
        if dimensions == 0 {
            return Err(MatrixError::ZeroDimension);
        }

        if bytes.len() % (dimensions * F32_SIZE) != 0 {
            return Err(MatrixError::TruncatedBlob {
                len: bytes.len(),
                dimensions,
            });
        }

        let data = bytes
            .chunks_exact(F32_SIZE)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();

        Ok(Self { dimensions, data })
    }
}
