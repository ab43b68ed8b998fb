//! Ensemble inference engine for crop recommendation.
//!
//! This crate provides:
//! - Rust inference for random forests exported from sklearn as JSON
//! - [`CascadeAggregator`] - layers trained on residual errors, blended with
//!   geometrically decaying weights
//! - [`HierarchicalAggregator`] - one global model mixed with cluster-local
//!   models chosen by a fitted [`Partitioner`]
//! - [`ModelRegistry`] - the serving layer's explicitly owned set of models
//!
//! Every model implements [`MlModel`] and returns a probability matrix whose
//! columns follow its own `classes()`. Aggregators re-project each submodel
//! into the master [`LabelSet`](types::LabelSet) before blending.
//!
//! # Architecture
//!
//! ```text
//! features ──► submodel.predict_proba ──► align::reproject ──► weighted sum
//!                                                               │
//!                       predict = argmax ◄── align::normalize_rows
//! ```
//!
//! Fitting goes through builders ([`CascadeBuilder`], [`HierarchicalBuilder`])
//! which only hand out an aggregator once every submodel trained; aggregators
//! are immutable afterwards and safe to share across threads.
//!
//! # Usage
//!
//! ```ignore
//! use ensemble::{CascadeBuilder, CascadeConfig, MlModel};
//!
//! let cascade = CascadeBuilder::new(CascadeConfig::default()).fit(&x, &y)?;
//! let proba = cascade.predict_proba(&x_new)?;
//! let crops = cascade.predict(&x_new)?;
//! ```

pub mod align;
mod cascade;
mod decision_tree;
mod error;
mod hierarchical;
mod kmeans;
mod model_registry;
mod preprocessing;
mod random_forest;
mod recommendation;
mod training;

pub use cascade::{CascadeAggregator, CascadeBuilder, CascadeConfig};
pub use decision_tree::{DecisionTree, TreeNode};
pub use error::{EnsembleError, Result};
pub use hierarchical::{
    GLOBAL_WEIGHT, HierarchicalAggregator, HierarchicalBuilder, HierarchicalConfig, LOCAL_WEIGHT,
};
pub use kmeans::{KMeans, KMeansConfig, Partitioner};
pub use model_registry::{ModelRegistry, load_model_file};
pub use preprocessing::{LabelEncoder, PREPROCESSOR_FILE, Preprocessor, Record, StandardScaler};
pub use random_forest::RandomForest;
pub use recommendation::{Recommendation, recommend, top_k};
pub use training::{ForestConfig, ForestTrainer, Trainer};

use types::{ClassId, FeatureMatrix, ProbabilityMatrix};

/// Trait for models that produce per-row class probabilities.
///
/// Implementors must be `Send + Sync`: fitted models are shared read-only
/// between request handlers.
pub trait MlModel: Send + Sync {
    /// Class probabilities for each row of `x`.
    ///
    /// Column `j` of the result is the probability of `self.classes()[j]`.
    ///
    /// # Errors
    /// [`EnsembleError::ShapeMismatch`] if `x.n_cols() != self.n_features()`.
    fn predict_proba(&self, x: &FeatureMatrix) -> Result<ProbabilityMatrix>;

    /// The model's own label subset, in column order.
    fn classes(&self) -> &[ClassId];

    /// Model name for logging and registry lookup.
    fn name(&self) -> &str;

    /// Number of features expected per row.
    fn n_features(&self) -> usize;

    /// Most probable class per row (ties go to the lowest column).
    fn predict(&self, x: &FeatureMatrix) -> Result<Vec<ClassId>> {
        let proba = self.predict_proba(x)?;
        let classes = self.classes();
        Ok(proba
            .rows()
            .map(|row| classes[align::argmax(row)])
            .collect())
    }

    /// Per-feature importances, if the model tracks them.
    fn feature_importances(&self) -> Option<Vec<f64>> {
        None
    }
}

/// Fail with [`EnsembleError::ShapeMismatch`] unless `x` has `expected` columns.
#[inline]
pub(crate) fn check_n_features(x: &FeatureMatrix, expected: usize) -> Result<()> {
    if x.n_cols() != expected {
        return Err(EnsembleError::ShapeMismatch {
            expected,
            found: x.n_cols(),
        });
    }
    Ok(())
}

/// Fail with [`EnsembleError::RowCountMismatch`] unless `proba` has one row
/// per input row.
#[inline]
pub(crate) fn check_n_rows(
    model: &dyn MlModel,
    proba: &ProbabilityMatrix,
    expected: usize,
) -> Result<()> {
    if proba.n_rows() != expected {
        return Err(EnsembleError::RowCountMismatch {
            model: model.name().to_string(),
            expected,
            found: proba.n_rows(),
        });
    }
    Ok(())
}

/// Fraction of rows where `predicted` matches `actual`.
pub fn accuracy(predicted: &[ClassId], actual: &[ClassId]) -> f64 {
    if actual.is_empty() {
        return 0.0;
    }
    let hits = predicted
        .iter()
        .zip(actual)
        .filter(|(p, a)| p == a)
        .count();
    hits as f64 / actual.len() as f64
}
