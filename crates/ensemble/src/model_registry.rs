//! Model registry for serving predictions.
//!
//! The [`ModelRegistry`] is built once at startup (usually from a bundle
//! directory via [`ModelRegistry::from_dir`]) and only read afterwards. It is
//! passed explicitly to whatever serves requests; there is no process-wide
//! model cache.
//!
//! # Usage
//!
//! ```ignore
//! use ensemble::ModelRegistry;
//!
//! let registry = ModelRegistry::from_dir("models/")?;
//! for (name, proba) in registry.predict_all(&features) {
//!     println!("{name}: {:?}", proba?.row(0));
//! }
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use tracing::info;
use types::{FeatureMatrix, ProbabilityMatrix};

use crate::preprocessing::PREPROCESSOR_FILE;
use crate::{
    CascadeAggregator, EnsembleError, HierarchicalAggregator, MlModel, RandomForest, Result,
    cascade, hierarchical, random_forest,
};

/// Registry of named models.
///
/// Models are stored as `Arc<dyn MlModel>` so callers can hold on to one
/// across threads without borrowing the registry.
pub struct ModelRegistry {
    /// Models indexed by name.
    models: HashMap<String, Arc<dyn MlModel>>,
    parallel: bool,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelRegistry {
    /// Create a new empty model registry.
    pub fn new() -> Self {
        Self {
            models: HashMap::new(),
            parallel: false,
        }
    }

    /// Score models in parallel in [`predict_all`](Self::predict_all).
    ///
    /// Off by default: one request runs on its caller's thread.
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Load every model file in a bundle directory.
    ///
    /// All `*.json` files except the preprocessor are treated as models.
    ///
    /// # Errors
    /// The first file that fails to load.
    pub fn from_dir<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let entries = std::fs::read_dir(dir).map_err(|e| EnsembleError::io(dir, e))?;

        let mut paths: Vec<PathBuf> = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| EnsembleError::io(dir, e))?.path();
            let is_json = path.extension().is_some_and(|ext| ext == "json");
            let is_preprocessor = path
                .file_name()
                .is_some_and(|name| name == PREPROCESSOR_FILE);
            if is_json && !is_preprocessor {
                paths.push(path);
            }
        }
        paths.sort();

        let mut registry = Self::new();
        for path in &paths {
            let model = load_model_file(path)?;
            info!(model = model.name(), path = %path.display(), "loaded model");
            registry.register_arc(model);
        }
        Ok(registry)
    }

    /// Register a model with the registry.
    ///
    /// If a model with the same name already exists, it will be replaced.
    pub fn register<M: MlModel + 'static>(&mut self, model: M) {
        let name = model.name().to_string();
        self.models.insert(name, Arc::new(model));
    }

    /// Register a model wrapped in Arc.
    pub fn register_arc(&mut self, model: Arc<dyn MlModel>) {
        let name = model.name().to_string();
        self.models.insert(name, model);
    }

    /// Get a model by name.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn MlModel>> {
        self.models.get(name)
    }

    /// Check if a model is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    /// Get the number of registered models.
    pub fn len(&self) -> usize {
        self.models.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// All model names, sorted.
    pub fn model_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.models.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Models in name order.
    pub fn models(&self) -> Vec<(&str, &Arc<dyn MlModel>)> {
        let mut models: Vec<_> = self
            .models
            .iter()
            .map(|(name, model)| (name.as_str(), model))
            .collect();
        models.sort_unstable_by_key(|(name, _)| *name);
        models
    }

    /// Probabilities from every model, in name order.
    ///
    /// Each model's result stands alone: one model rejecting the input does
    /// not stop the others.
    pub fn predict_all(&self, x: &FeatureMatrix) -> Vec<(String, Result<ProbabilityMatrix>)> {
        parallel::map_slice(
            &self.models(),
            |(name, model)| (name.to_string(), model.predict_proba(x)),
            !self.parallel,
        )
    }
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("model_count", &self.models.len())
            .field("models", &self.model_names())
            .finish()
    }
}

#[derive(Deserialize)]
struct ModelTypeProbe {
    model_type: String,
}

/// Load one model file, picking the loader from its `model_type`.
///
/// # Errors
/// [`EnsembleError::InvalidModel`] for an unknown `model_type`, otherwise
/// whatever the specific loader reports.
pub fn load_model_file<P: AsRef<Path>>(path: P) -> Result<Arc<dyn MlModel>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| EnsembleError::io(path, e))?;
    let probe: ModelTypeProbe = serde_json::from_str(&content)?;

    let model: Arc<dyn MlModel> = match probe.model_type.as_str() {
        random_forest::MODEL_TYPE => Arc::new(RandomForest::from_json_str(&content)?),
        cascade::MODEL_TYPE => Arc::new(CascadeAggregator::from_json_str(&content)?),
        hierarchical::MODEL_TYPE => Arc::new(HierarchicalAggregator::from_json_str(&content)?),
        other => {
            return Err(EnsembleError::InvalidModel(format!(
                "{}: unknown model_type '{other}'",
                path.display()
            )));
        }
    };
    Ok(model)
}
