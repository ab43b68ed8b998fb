//! Error types for ensemble inference, fitting and model loading.

use std::path::PathBuf;

use types::{ClassId, TypesError};

/// Errors raised by the ensemble engine.
///
/// None of these are retried: they point at a defect in the model bundle or
/// the feature pipeline and fail the single call that hit them.
#[derive(Debug, thiserror::Error)]
pub enum EnsembleError {
    /// A fitted attribute is missing (predicting before fit).
    #[error("{model} is not fitted: missing `{attribute}`")]
    NotFitted {
        model: String,
        attribute: &'static str,
    },

    /// Feature matrix width disagrees with what the model was trained on.
    #[error("feature shape mismatch: expected {expected} columns, found {found}")]
    ShapeMismatch { expected: usize, found: usize },

    /// A submodel returned a different number of rows than it was given.
    #[error("{model} returned {found} probability rows for {expected} input rows")]
    RowCountMismatch {
        model: String,
        expected: usize,
        found: usize,
    },

    /// A submodel reports labels outside the master label set.
    #[error("{model} has labels outside the master label set: {labels:?}")]
    LabelMismatch { model: String, labels: Vec<ClassId> },

    /// Model artifact is structurally invalid.
    #[error("invalid model: {0}")]
    InvalidModel(String),

    /// Invalid arguments or training data.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// File I/O error with path context.
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Types(#[from] TypesError),
}

impl EnsembleError {
    pub(crate) fn not_fitted(model: impl Into<String>, attribute: &'static str) -> Self {
        Self::NotFitted {
            model: model.into(),
            attribute,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result type alias for ensemble operations.
pub type Result<T> = std::result::Result<T, EnsembleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_fitted_display() {
        let err = EnsembleError::not_fitted("CascadeRandomForest_x", "layers");
        assert_eq!(
            err.to_string(),
            "CascadeRandomForest_x is not fitted: missing `layers`"
        );
    }

    #[test]
    fn test_shape_mismatch_display() {
        let err = EnsembleError::ShapeMismatch {
            expected: 20,
            found: 3,
        };
        assert_eq!(
            err.to_string(),
            "feature shape mismatch: expected 20 columns, found 3"
        );
    }

    #[test]
    fn test_io_error_has_path_and_source() {
        let err = EnsembleError::io(
            "models/cascade.json",
            std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
        );
        let msg = err.to_string();
        assert!(msg.contains("cascade.json"));
        assert!(msg.contains("not found"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_types_error_converts() {
        let err: EnsembleError = TypesError::DuplicateLabel(ClassId(2)).into();
        assert!(matches!(err, EnsembleError::Types(_)));
    }
}
