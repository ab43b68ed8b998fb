//! Dense row-major matrices for features and class probabilities.

use serde::{Deserialize, Serialize};

use crate::{Result, TypesError};

/// Row-major `f64` matrix.
///
/// Used both as the feature matrix fed to models (rows = samples, columns =
/// features in the agreed order) and as the probability matrix they return
/// (rows = samples, columns = classes).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(try_from = "RawMatrix")]
pub struct Matrix {
    n_rows: usize,
    n_cols: usize,
    data: Vec<f64>,
}

/// Unchecked wire form; `data` must hold exactly `n_rows * n_cols` values.
#[derive(Deserialize)]
struct RawMatrix {
    n_rows: usize,
    n_cols: usize,
    data: Vec<f64>,
}

impl TryFrom<RawMatrix> for Matrix {
    type Error = TypesError;

    fn try_from(raw: RawMatrix) -> Result<Self> {
        let RawMatrix {
            n_rows,
            n_cols,
            data,
        } = raw;
        if n_rows.checked_mul(n_cols) != Some(data.len()) {
            return Err(TypesError::ShapeLength {
                n_rows,
                n_cols,
                len: data.len(),
            });
        }
        Ok(Self {
            n_rows,
            n_cols,
            data,
        })
    }
}

/// Samples × features.
pub type FeatureMatrix = Matrix;

/// Samples × classes; rows sum to 1 after normalization.
pub type ProbabilityMatrix = Matrix;

impl Matrix {
    /// All-zero matrix.
    pub fn zeros(n_rows: usize, n_cols: usize) -> Self {
        Self {
            n_rows,
            n_cols,
            data: vec![0.0; n_rows * n_cols],
        }
    }

    /// Wrap a flat row-major buffer.
    ///
    /// # Errors
    /// Returns [`TypesError::DataLength`] if `data.len()` is not a multiple of `n_cols`.
    pub fn new(n_cols: usize, data: Vec<f64>) -> Result<Self> {
        if n_cols == 0 {
            if !data.is_empty() {
                return Err(TypesError::DataLength {
                    len: data.len(),
                    n_cols,
                });
            }
            return Ok(Self::default());
        }
        if data.len() % n_cols != 0 {
            return Err(TypesError::DataLength {
                len: data.len(),
                n_cols,
            });
        }
        Ok(Self {
            n_rows: data.len() / n_cols,
            n_cols,
            data,
        })
    }

    /// Build from nested rows.
    ///
    /// # Errors
    /// Returns [`TypesError::RaggedRows`] if rows differ in width.
    pub fn from_rows<R: AsRef<[f64]>>(rows: &[R]) -> Result<Self> {
        let n_cols = rows.first().map(|r| r.as_ref().len()).unwrap_or(0);
        let mut data = Vec::with_capacity(rows.len() * n_cols);
        for (i, row) in rows.iter().enumerate() {
            let row = row.as_ref();
            if row.len() != n_cols {
                return Err(TypesError::RaggedRows {
                    row: i,
                    expected: n_cols,
                    found: row.len(),
                });
            }
            data.extend_from_slice(row);
        }
        Ok(Self {
            n_rows: rows.len(),
            n_cols,
            data,
        })
    }

    #[inline]
    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    #[inline]
    pub fn n_cols(&self) -> usize {
        self.n_cols
    }

    pub fn is_empty(&self) -> bool {
        self.n_rows == 0
    }

    /// Row `i` as a slice. Panics if out of range.
    #[inline]
    pub fn row(&self, i: usize) -> &[f64] {
        &self.data[i * self.n_cols..(i + 1) * self.n_cols]
    }

    #[inline]
    pub fn row_mut(&mut self, i: usize) -> &mut [f64] {
        &mut self.data[i * self.n_cols..(i + 1) * self.n_cols]
    }

    pub fn rows(&self) -> impl ExactSizeIterator<Item = &[f64]> + '_ {
        (0..self.n_rows).map(move |i| self.row(i))
    }

    /// New matrix holding the given rows, in the given order.
    pub fn select_rows(&self, indices: &[usize]) -> Self {
        let mut data = Vec::with_capacity(indices.len() * self.n_cols);
        for &i in indices {
            data.extend_from_slice(self.row(i));
        }
        Self {
            n_rows: indices.len(),
            n_cols: self.n_cols,
            data,
        }
    }

    pub fn row_sums(&self) -> Vec<f64> {
        self.rows().map(|r| r.iter().sum()).collect()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    /// Copy out as nested rows (for JSON output and debugging).
    pub fn to_rows(&self) -> Vec<Vec<f64>> {
        self.rows().map(<[f64]>::to_vec).collect()
    }
}
