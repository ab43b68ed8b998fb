//! Random Forest classifier.
//!
//! Loads a sklearn RandomForestClassifier exported to JSON (or one trained by
//! [`ForestTrainer`](crate::ForestTrainer)) and performs inference by
//! averaging leaf distributions across all trees.
//!
//! # JSON Format
//!
//! ```json
//! {
//!   "model_type": "random_forest",
//!   "model_name": "standard",
//!   "feature_names": ["District", "Season", ...],
//!   "n_features": 20,
//!   "n_classes": 4,
//!   "classes": [0, 1, 2, 3],
//!   "n_estimators": 100,
//!   "feature_importances": [0.08, ...],
//!   "trees": [
//!     { "n_nodes": 393, "nodes": [...] },
//!     ...
//!   ]
//! }
//! ```
//!
//! `feature_names` and `feature_importances` are optional.

use std::path::Path;

use serde::{Deserialize, Serialize};
use types::{ClassId, FeatureMatrix, ProbabilityMatrix};

use crate::decision_tree::DecisionTree;
use crate::{EnsembleError, MlModel, Result, check_n_features};

pub(crate) const MODEL_TYPE: &str = "random_forest";

/// On-disk form of a forest.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RandomForestJson {
    model_type: String,
    model_name: String,
    #[serde(default)]
    feature_names: Vec<String>,
    n_features: usize,
    n_classes: usize,
    classes: Vec<ClassId>,
    n_estimators: usize,
    #[serde(default)]
    feature_importances: Option<Vec<f64>>,
    trees: Vec<DecisionTree>,
}

/// Random Forest classifier over an arbitrary label subset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RandomForestJson", into = "RandomForestJson")]
pub struct RandomForest {
    /// Model name for identification (`RandomForest_{model_name}`).
    name: String,
    model_name: String,
    feature_names: Vec<String>,
    n_features: usize,
    /// Label subset, in leaf-value column order.
    classes: Vec<ClassId>,
    trees: Vec<DecisionTree>,
    feature_importances: Option<Vec<f64>>,
}

impl RandomForest {
    /// Assemble and validate a forest.
    ///
    /// # Errors
    /// [`EnsembleError::InvalidModel`] if there are no trees, no classes, or
    /// any tree fails validation against `n_features` / `classes.len()`.
    pub fn new(
        model_name: impl Into<String>,
        n_features: usize,
        classes: Vec<ClassId>,
        trees: Vec<DecisionTree>,
    ) -> Result<Self> {
        let model_name = model_name.into();
        if classes.is_empty() {
            return Err(EnsembleError::InvalidModel(format!(
                "random forest {model_name} has no classes"
            )));
        }
        if trees.is_empty() {
            return Err(EnsembleError::InvalidModel(format!(
                "random forest {model_name} has no trees"
            )));
        }
        for (t, tree) in trees.iter().enumerate() {
            tree.validate(n_features, classes.len()).map_err(|e| {
                EnsembleError::InvalidModel(format!("{model_name} tree {t}: {e}"))
            })?;
        }
        Ok(Self {
            name: format!("RandomForest_{model_name}"),
            model_name,
            feature_names: Vec::new(),
            n_features,
            classes,
            trees,
            feature_importances: None,
        })
    }

    pub fn with_feature_names(mut self, names: Vec<String>) -> Self {
        self.feature_names = names;
        self
    }

    pub fn with_feature_importances(mut self, importances: Vec<f64>) -> Self {
        self.feature_importances = Some(importances);
        self
    }

    /// Load a random forest from a JSON file.
    ///
    /// # Errors
    /// Returns error if file cannot be read or JSON is malformed.
    pub fn from_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|e| EnsembleError::io(path, e))?;
        Self::from_json_str(&content)
    }

    /// Load a random forest from a JSON string.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let model: RandomForestJson = serde_json::from_str(json)?;
        Self::try_from(model)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Write the forest as JSON.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        std::fs::write(path, self.to_json_string()?).map_err(|e| EnsembleError::io(path, e))
    }

    /// Number of trees in the ensemble.
    pub fn n_estimators(&self) -> usize {
        self.trees.len()
    }

    pub fn trees(&self) -> &[DecisionTree] {
        &self.trees
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    /// Average leaf distribution for one row.
    fn predict_row(&self, features: &[f64], out: &mut [f64]) {
        for tree in &self.trees {
            for (o, p) in out.iter_mut().zip(tree.leaf_value(features)) {
                *o += p;
            }
        }
        let n = self.trees.len() as f64;
        for o in out.iter_mut() {
            *o /= n;
        }
    }
}

impl TryFrom<RandomForestJson> for RandomForest {
    type Error = EnsembleError;

    fn try_from(model: RandomForestJson) -> Result<Self> {
        // Validate model type
        if model.model_type != MODEL_TYPE {
            return Err(EnsembleError::InvalidModel(format!(
                "expected model_type '{MODEL_TYPE}', got '{}'",
                model.model_type
            )));
        }

        if model.n_classes != model.classes.len() {
            return Err(EnsembleError::InvalidModel(format!(
                "n_classes ({}) doesn't match classes count ({})",
                model.n_classes,
                model.classes.len()
            )));
        }

        // Validate tree count
        if model.trees.len() != model.n_estimators {
            return Err(EnsembleError::InvalidModel(format!(
                "n_estimators ({}) doesn't match trees count ({})",
                model.n_estimators,
                model.trees.len()
            )));
        }

        if !model.feature_names.is_empty() && model.feature_names.len() != model.n_features {
            return Err(EnsembleError::InvalidModel(format!(
                "{} feature names for {} features",
                model.feature_names.len(),
                model.n_features
            )));
        }

        let mut forest =
            Self::new(model.model_name, model.n_features, model.classes, model.trees)?
                .with_feature_names(model.feature_names);
        if let Some(importances) = model.feature_importances {
            if importances.len() != forest.n_features {
                return Err(EnsembleError::InvalidModel(format!(
                    "{} feature importances for {} features",
                    importances.len(),
                    forest.n_features
                )));
            }
            forest.feature_importances = Some(importances);
        }
        Ok(forest)
    }
}

impl From<RandomForest> for RandomForestJson {
    fn from(forest: RandomForest) -> Self {
        Self {
            model_type: MODEL_TYPE.to_string(),
            model_name: forest.model_name,
            feature_names: forest.feature_names,
            n_features: forest.n_features,
            n_classes: forest.classes.len(),
            classes: forest.classes,
            n_estimators: forest.trees.len(),
            feature_importances: forest.feature_importances,
            trees: forest.trees,
        }
    }
}

impl MlModel for RandomForest {
    fn predict_proba(&self, x: &FeatureMatrix) -> Result<ProbabilityMatrix> {
        check_n_features(x, self.n_features)?;
        let mut out = ProbabilityMatrix::zeros(x.n_rows(), self.classes.len());
        for (i, row) in x.rows().enumerate() {
            self.predict_row(row, out.row_mut(i));
        }
        Ok(out)
    }

    fn classes(&self) -> &[ClassId] {
        &self.classes
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn n_features(&self) -> usize {
        self.n_features
    }

    fn feature_importances(&self) -> Option<Vec<f64>> {
        self.feature_importances.clone()
    }
}
