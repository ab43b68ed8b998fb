//! Cascade aggregator: layers trained on the residual errors of their
//! predecessors, blended with geometrically decaying weights.
//!
//! # Fitting
//!
//! Layer 0 sees every training row. Each later layer sees only the rows the
//! previous layer got wrong, so the cascade shrinks towards the hard cases:
//!
//! ```text
//! all rows ──► layer 0 ──► misclassified ──► layer 1 ──► misclassified ──► layer 2
//! ```
//!
//! Fitting stops early once a layer gets all of its rows right, or fewer than
//! `min_residual_samples` remain; a single-layer cascade is a valid result.
//!
//! # Prediction
//!
//! Layer `i` of `L` gets weight `2^(L-i-1)`, normalized (4:2:1 for three
//! layers). Each layer's output is re-projected into the master label set,
//! weighted, summed, and every row renormalized.
//!
//! # JSON Format
//!
//! ```json
//! {
//!   "model_type": "cascade_random_forest",
//!   "model_name": "cascade",
//!   "classes": [0, 1, 2],
//!   "layers": [ { "model_type": "random_forest", ... }, ... ]
//! }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use types::{ClassId, FeatureMatrix, LabelSet, ProbabilityMatrix};

use crate::training::check_training_data;
use crate::{
    EnsembleError, ForestConfig, ForestTrainer, MlModel, RandomForest, Result, Trainer, align,
    check_n_rows,
};

pub(crate) const MODEL_TYPE: &str = "cascade_random_forest";

// =============================================================================
// Configuration
// =============================================================================

/// Cascade hyperparameters.
#[derive(Debug, Clone)]
pub struct CascadeConfig {
    /// Maximum number of layers; fitting may produce fewer.
    pub n_layers: usize,
    pub n_estimators_per_layer: usize,
    pub max_depth: usize,
    pub min_samples_split: usize,
    /// Layer `k` is trained with seed `random_state + k`.
    pub random_state: u64,
    /// Stop adding layers when fewer residual rows than this remain.
    pub min_residual_samples: usize,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            n_layers: 3,
            n_estimators_per_layer: 50,
            max_depth: 15,
            min_samples_split: 5,
            random_state: 42,
            min_residual_samples: 10,
        }
    }
}

impl CascadeConfig {
    pub fn n_layers(mut self, n: usize) -> Self {
        self.n_layers = n;
        self
    }

    pub fn n_estimators_per_layer(mut self, n: usize) -> Self {
        self.n_estimators_per_layer = n;
        self
    }

    pub fn max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn min_samples_split(mut self, n: usize) -> Self {
        self.min_samples_split = n;
        self
    }

    pub fn random_state(mut self, seed: u64) -> Self {
        self.random_state = seed;
        self
    }

    pub fn min_residual_samples(mut self, n: usize) -> Self {
        self.min_residual_samples = n;
        self
    }

    /// Forest settings for each layer.
    pub fn forest_config(&self, model_name: &str) -> ForestConfig {
        ForestConfig::default()
            .model_name(format!("{model_name}_layer"))
            .n_estimators(self.n_estimators_per_layer)
            .max_depth(self.max_depth)
            .min_samples_split(self.min_samples_split)
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Fits a [`CascadeAggregator`].
///
/// Layers accumulate inside [`fit`](Self::fit); the aggregator only exists
/// once every layer trained, so a failed fit never leaves a half-built model.
#[derive(Debug, Clone)]
pub struct CascadeBuilder<T = ForestTrainer> {
    config: CascadeConfig,
    trainer: T,
    model_name: String,
}

impl CascadeBuilder<ForestTrainer> {
    /// Builder training random-forest layers per `config`.
    pub fn new(config: CascadeConfig) -> Self {
        let trainer = ForestTrainer::new(config.forest_config("cascade"));
        Self::with_trainer(config, trainer)
    }
}

impl<T: Trainer> CascadeBuilder<T> {
    /// Builder training layers with a custom trainer.
    pub fn with_trainer(config: CascadeConfig, trainer: T) -> Self {
        Self {
            config,
            trainer,
            model_name: "cascade".to_string(),
        }
    }

    pub fn model_name(mut self, name: impl Into<String>) -> Self {
        self.model_name = name.into();
        self
    }

    pub fn config(&self) -> &CascadeConfig {
        &self.config
    }

    /// Train the cascade on `x`/`y`.
    ///
    /// # Errors
    /// Invalid training data, or any error from the trainer.
    pub fn fit(&self, x: &FeatureMatrix, y: &[ClassId]) -> Result<CascadeAggregator<T::Model>> {
        check_training_data(x, y)?;
        if self.config.n_layers == 0 {
            return Err(EnsembleError::InvalidInput(
                "cascade needs at least one layer".into(),
            ));
        }

        let labels = LabelSet::from_targets(y);
        let mut layers = Vec::with_capacity(self.config.n_layers);
        let mut residual: Option<(FeatureMatrix, Vec<ClassId>)> = None;

        for k in 0..self.config.n_layers {
            let (rx, ry) = match &residual {
                Some((rx, ry)) => (rx, ry.as_slice()),
                None => (x, y),
            };

            info!(
                model = %self.model_name,
                layer = k + 1,
                samples = ry.len(),
                "training cascade layer"
            );
            let layer = self
                .trainer
                .train(rx, ry, self.config.random_state.wrapping_add(k as u64))?;

            if k + 1 == self.config.n_layers {
                layers.push(layer);
                break;
            }

            let predicted = layer.predict(rx)?;
            layers.push(layer);

            let missed: Vec<usize> = predicted
                .iter()
                .zip(ry)
                .enumerate()
                .filter(|(_, (p, t))| p != t)
                .map(|(i, _)| i)
                .collect();

            if missed.is_empty() {
                info!(layer = k + 1, "all remaining samples correctly classified");
                break;
            }
            info!(layer = k + 1, misclassified = missed.len(), "residual samples");
            if missed.len() < self.config.min_residual_samples {
                info!(
                    remaining = missed.len(),
                    min = self.config.min_residual_samples,
                    "too few residual samples for another layer"
                );
                break;
            }

            let next_y = missed.iter().map(|&i| ry[i]).collect();
            residual = Some((rx.select_rows(&missed), next_y));
        }

        info!(model = %self.model_name, layers = layers.len(), "cascade complete");
        CascadeAggregator::new(self.model_name.clone(), labels, layers)
    }
}

// =============================================================================
// Aggregator
// =============================================================================

/// Fitted cascade. Immutable; safe to share across threads.
#[derive(Debug, Clone)]
pub struct CascadeAggregator<M = RandomForest> {
    name: String,
    model_name: String,
    labels: LabelSet,
    layers: Vec<M>,
    weights: Vec<f64>,
}

impl<M: MlModel> CascadeAggregator<M> {
    /// Assemble a cascade from already fitted layers, first-trained first.
    ///
    /// # Errors
    /// - [`EnsembleError::NotFitted`] if `labels` or `layers` is empty
    /// - [`EnsembleError::LabelMismatch`] if a layer has labels outside `labels`
    pub fn new(model_name: impl Into<String>, labels: LabelSet, layers: Vec<M>) -> Result<Self> {
        let model_name = model_name.into();
        let name = format!("CascadeRandomForest_{model_name}");
        if labels.is_empty() {
            return Err(EnsembleError::not_fitted(name, "classes"));
        }
        if layers.is_empty() {
            return Err(EnsembleError::not_fitted(name, "layers"));
        }
        for layer in &layers {
            let foreign = labels.missing_from(layer.classes());
            if !foreign.is_empty() {
                return Err(EnsembleError::LabelMismatch {
                    model: layer.name().to_string(),
                    labels: foreign,
                });
            }
        }
        let weights = align::cascade_weights(layers.len());
        Ok(Self {
            name,
            model_name,
            labels,
            layers,
            weights,
        })
    }

    /// Normalized layer weights, layer 0 first.
    pub fn layer_weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn labels(&self) -> &LabelSet {
        &self.labels
    }

    pub fn layers(&self) -> &[M] {
        &self.layers
    }

    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// Weighted sum of re-projected layer outputs, before row normalization.
    pub fn accumulate(&self, x: &FeatureMatrix) -> Result<ProbabilityMatrix> {
        let mut acc = ProbabilityMatrix::zeros(x.n_rows(), self.labels.len());
        for (layer, &weight) in self.layers.iter().zip(&self.weights) {
            let proba = layer.predict_proba(x)?;
            check_n_rows(layer, &proba, x.n_rows())?;
            let aligned = align::reproject(&self.labels, layer.classes(), &proba);
            align::add_scaled(&mut acc, &aligned, weight);
        }
        Ok(acc)
    }
}

impl<M: MlModel> MlModel for CascadeAggregator<M> {
    fn predict_proba(&self, x: &FeatureMatrix) -> Result<ProbabilityMatrix> {
        debug!(model = %self.name, rows = x.n_rows(), layers = self.layers.len(), "predict_proba");
        let mut proba = self.accumulate(x)?;
        align::normalize_rows(&mut proba);
        Ok(proba)
    }

    fn classes(&self) -> &[ClassId] {
        self.labels.as_slice()
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn n_features(&self) -> usize {
        self.layers[0].n_features()
    }

    /// Mean of the layers' importances.
    fn feature_importances(&self) -> Option<Vec<f64>> {
        mean_importances(self.layers.iter().map(|l| l.feature_importances()))
    }
}

/// Element-wise mean; None if any input is missing or widths differ.
pub(crate) fn mean_importances(
    parts: impl Iterator<Item = Option<Vec<f64>>>,
) -> Option<Vec<f64>> {
    let mut total: Option<Vec<f64>> = None;
    let mut n = 0usize;
    for part in parts {
        let part = part?;
        match &mut total {
            None => total = Some(part),
            Some(acc) if acc.len() == part.len() => {
                acc.iter_mut().zip(&part).for_each(|(a, p)| *a += p);
            }
            Some(_) => return None,
        }
        n += 1;
    }
    let mut total = total?;
    total.iter_mut().for_each(|v| *v /= n as f64);
    Some(total)
}

// =============================================================================
// Persistence
// =============================================================================

#[derive(Debug, Deserialize)]
struct CascadeJson {
    model_type: String,
    model_name: String,
    #[serde(default)]
    classes: Option<LabelSet>,
    #[serde(default)]
    layers: Option<Vec<RandomForest>>,
}

#[derive(Serialize)]
struct CascadeJsonRef<'a> {
    model_type: &'static str,
    model_name: &'a str,
    classes: &'a LabelSet,
    layers: &'a [RandomForest],
}

impl CascadeAggregator<RandomForest> {
    /// Load a cascade from a JSON file.
    pub fn from_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|e| EnsembleError::io(path, e))?;
        Self::from_json_str(&content)
    }

    /// Load a cascade from a JSON string.
    ///
    /// # Errors
    /// [`EnsembleError::NotFitted`] if `classes` or `layers` is null, missing
    /// or empty.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let model: CascadeJson = serde_json::from_str(json)?;
        if model.model_type != MODEL_TYPE {
            return Err(EnsembleError::InvalidModel(format!(
                "expected model_type '{MODEL_TYPE}', got '{}'",
                model.model_type
            )));
        }
        let name = format!("CascadeRandomForest_{}", model.model_name);
        let classes = model
            .classes
            .ok_or_else(|| EnsembleError::not_fitted(name.clone(), "classes"))?;
        let layers = model
            .layers
            .ok_or_else(|| EnsembleError::not_fitted(name, "layers"))?;
        Self::new(model.model_name, classes, layers)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string(&CascadeJsonRef {
            model_type: MODEL_TYPE,
            model_name: &self.model_name,
            classes: &self.labels,
            layers: &self.layers,
        })?)
    }

    /// Write the cascade as JSON.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        std::fs::write(path, self.to_json_string()?).map_err(|e| EnsembleError::io(path, e))
    }
}
