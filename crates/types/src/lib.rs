//! Core types for the crop-advisor ensemble engine.
//!
//! This crate provides the data types shared by the inference core and the
//! CLI: encoded class labels, the ordered master label set, row-major
//! feature/probability matrices, and the crop dataset schema.

use derive_more::{From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;

mod labels;
mod matrix;
pub mod schema;

pub use labels::LabelSet;
pub use matrix::{FeatureMatrix, Matrix, ProbabilityMatrix};

// =============================================================================
// Class Identifier
// =============================================================================

/// Encoded class label (e.g. a label-encoded crop name).
///
/// Decoding back to a human-readable name is the job of a separate label
/// table; the engine only ever sees the integer code.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Default,
    From,
    Into,
)]
#[serde(transparent)]
pub struct ClassId(pub i32);

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Class({})", self.0)
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Errors raised while constructing shared types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TypesError {
    /// Rows passed to a matrix constructor have different widths.
    #[error("ragged rows: row {row} has {found} columns, expected {expected}")]
    RaggedRows {
        row: usize,
        expected: usize,
        found: usize,
    },

    /// Flat buffer length is not a multiple of the column count.
    #[error("data length {len} is not a multiple of column count {n_cols}")]
    DataLength { len: usize, n_cols: usize },

    /// Declared matrix shape disagrees with its buffer.
    #[error("matrix shape {n_rows}x{n_cols} does not match data length {len}")]
    ShapeLength {
        n_rows: usize,
        n_cols: usize,
        len: usize,
    },

    /// A label appears more than once in a label set.
    #[error("duplicate label {0} in label set")]
    DuplicateLabel(ClassId),
}

/// Result type for type construction.
pub type Result<T> = std::result::Result<T, TypesError>;
