//! Hierarchical aggregator: one global model blended with cluster-local
//! models.
//!
//! A [`Partitioner`] fit once at training time splits feature space into
//! clusters. Every row gets the global model's distribution at
//! [`GLOBAL_WEIGHT`]; rows whose cluster has a local model also get that
//! model's distribution at [`LOCAL_WEIGHT`]. Rows are then renormalized, which
//! turns a global-only row (mass 0.25) back into a full distribution.
//!
//! ```text
//!            ┌──► global model ─────────────── × 0.25 ──┐
//! rows ──────┤                                          ├──► Σ ──► normalize
//!            └──► assign ──► cluster c model ── × 0.75 ──┘
//!                            (only if c has one)
//! ```
//!
//! Clusters with fewer than `min_cluster_samples` training rows get no local
//! model and fall back to global-only.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use types::{ClassId, FeatureMatrix, LabelSet, ProbabilityMatrix};

use crate::cascade::mean_importances;
use crate::training::check_training_data;
use crate::{
    EnsembleError, ForestConfig, ForestTrainer, KMeans, KMeansConfig, MlModel, Partitioner,
    RandomForest, Result, Trainer, align, check_n_rows,
};

pub(crate) const MODEL_TYPE: &str = "hierarchical_random_forest";

/// Share of every row's raw mass taken from the global model.
pub const GLOBAL_WEIGHT: f64 = 0.25;

/// Share taken from the row's cluster-local model, when there is one.
pub const LOCAL_WEIGHT: f64 = 0.75;

// =============================================================================
// Configuration
// =============================================================================

/// Hierarchical forest hyperparameters.
#[derive(Debug, Clone)]
pub struct HierarchicalConfig {
    pub n_clusters: usize,
    pub n_estimators_global: usize,
    pub n_estimators_local: usize,
    pub max_depth: usize,
    /// Seeds k-means and the global model; cluster `c` uses `random_state + c`.
    pub random_state: u64,
    /// Clusters with fewer training rows get no local model.
    pub min_cluster_samples: usize,
}

impl Default for HierarchicalConfig {
    fn default() -> Self {
        Self {
            n_clusters: 3,
            n_estimators_global: 50,
            n_estimators_local: 30,
            max_depth: 12,
            random_state: 42,
            min_cluster_samples: 10,
        }
    }
}

impl HierarchicalConfig {
    pub fn n_clusters(mut self, k: usize) -> Self {
        self.n_clusters = k;
        self
    }

    pub fn n_estimators_global(mut self, n: usize) -> Self {
        self.n_estimators_global = n;
        self
    }

    pub fn n_estimators_local(mut self, n: usize) -> Self {
        self.n_estimators_local = n;
        self
    }

    pub fn max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn random_state(mut self, seed: u64) -> Self {
        self.random_state = seed;
        self
    }

    pub fn min_cluster_samples(mut self, n: usize) -> Self {
        self.min_cluster_samples = n;
        self
    }

    pub fn global_forest_config(&self, model_name: &str) -> ForestConfig {
        ForestConfig::default()
            .model_name(format!("{model_name}_global"))
            .n_estimators(self.n_estimators_global)
            .max_depth(self.max_depth)
    }

    pub fn local_forest_config(&self, model_name: &str) -> ForestConfig {
        ForestConfig::default()
            .model_name(format!("{model_name}_local"))
            .n_estimators(self.n_estimators_local)
            .max_depth(self.max_depth)
    }

    pub fn kmeans_config(&self) -> KMeansConfig {
        KMeansConfig::default()
            .n_clusters(self.n_clusters)
            .random_state(self.random_state)
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Fits a [`HierarchicalAggregator`].
#[derive(Debug, Clone)]
pub struct HierarchicalBuilder<T = ForestTrainer> {
    config: HierarchicalConfig,
    global_trainer: T,
    local_trainer: T,
    model_name: String,
}

impl HierarchicalBuilder<ForestTrainer> {
    /// Builder training random forests per `config`.
    pub fn new(config: HierarchicalConfig) -> Self {
        let global = ForestTrainer::new(config.global_forest_config("hierarchical"));
        let local = ForestTrainer::new(config.local_forest_config("hierarchical"));
        Self::with_trainers(config, global, local)
    }
}

impl<T: Trainer> HierarchicalBuilder<T> {
    pub fn with_trainers(config: HierarchicalConfig, global_trainer: T, local_trainer: T) -> Self {
        Self {
            config,
            global_trainer,
            local_trainer,
            model_name: "hierarchical".to_string(),
        }
    }

    pub fn model_name(mut self, name: impl Into<String>) -> Self {
        self.model_name = name.into();
        self
    }

    pub fn config(&self) -> &HierarchicalConfig {
        &self.config
    }

    /// Fit k-means on `x`, then the global and local models.
    pub fn fit(
        &self,
        x: &FeatureMatrix,
        y: &[ClassId],
    ) -> Result<HierarchicalAggregator<T::Model, KMeans>> {
        check_training_data(x, y)?;
        info!(
            model = %self.model_name,
            clusters = self.config.n_clusters,
            "clustering training rows"
        );
        let kmeans = KMeans::fit(x, &self.config.kmeans_config())?;
        self.fit_with_partitioner(x, y, kmeans)
    }

    /// Fit the global and local models around an already fitted partitioner.
    pub fn fit_with_partitioner<P: Partitioner>(
        &self,
        x: &FeatureMatrix,
        y: &[ClassId],
        partitioner: P,
    ) -> Result<HierarchicalAggregator<T::Model, P>> {
        check_training_data(x, y)?;
        let labels = LabelSet::from_targets(y);
        let assignments = partitioner.assign(x)?;
        let n_clusters = partitioner.n_clusters();

        let mut members: Vec<Vec<usize>> = vec![Vec::new(); n_clusters];
        for (row, &c) in assignments.iter().enumerate() {
            match members.get_mut(c) {
                Some(rows) => rows.push(row),
                None => {
                    return Err(EnsembleError::InvalidModel(format!(
                        "partitioner assigned cluster {c} of {n_clusters}"
                    )));
                }
            }
        }
        let sizes: Vec<usize> = members.iter().map(Vec::len).collect();
        info!(sizes = ?sizes, "cluster sizes");

        info!(model = %self.model_name, samples = y.len(), "training global model");
        let global = self
            .global_trainer
            .train(x, y, self.config.random_state)?;

        let locals = parallel::try_map_indices(
            n_clusters,
            |c| {
                let rows = &members[c];
                if rows.len() < self.config.min_cluster_samples {
                    info!(cluster = c, samples = rows.len(), "cluster skipped");
                    return Ok(None);
                }
                info!(cluster = c, samples = rows.len(), "training cluster model");
                let cx = x.select_rows(rows);
                let cy: Vec<ClassId> = rows.iter().map(|&i| y[i]).collect();
                let seed = self.config.random_state.wrapping_add(c as u64);
                self.local_trainer.train(&cx, &cy, seed).map(Some)
            },
            false,
        )?;

        let cluster_models: BTreeMap<usize, T::Model> = locals
            .into_iter()
            .enumerate()
            .filter_map(|(c, model)| model.map(|m| (c, m)))
            .collect();
        info!(
            model = %self.model_name,
            cluster_models = cluster_models.len(),
            "hierarchical forest complete"
        );

        HierarchicalAggregator::new(
            self.model_name.clone(),
            labels,
            partitioner,
            global,
            cluster_models,
        )
    }
}

// =============================================================================
// Aggregator
// =============================================================================

/// Fitted hierarchical ensemble. Immutable; safe to share across threads.
#[derive(Debug, Clone)]
pub struct HierarchicalAggregator<M = RandomForest, P = KMeans> {
    name: String,
    model_name: String,
    labels: LabelSet,
    partitioner: P,
    global: M,
    cluster_models: BTreeMap<usize, M>,
}

impl<M: MlModel, P: Partitioner> HierarchicalAggregator<M, P> {
    /// Assemble from fitted parts.
    ///
    /// # Errors
    /// - [`EnsembleError::NotFitted`] if `labels` is empty or the partitioner
    ///   has no clusters
    /// - [`EnsembleError::LabelMismatch`] if a submodel has labels outside `labels`
    /// - [`EnsembleError::InvalidModel`] if a cluster id is out of range
    pub fn new(
        model_name: impl Into<String>,
        labels: LabelSet,
        partitioner: P,
        global: M,
        cluster_models: BTreeMap<usize, M>,
    ) -> Result<Self> {
        let model_name = model_name.into();
        let name = format!("HierarchicalRandomForest_{model_name}");
        if labels.is_empty() {
            return Err(EnsembleError::not_fitted(name, "classes"));
        }
        if partitioner.n_clusters() == 0 {
            return Err(EnsembleError::not_fitted(name, "kmeans"));
        }
        for model in std::iter::once(&global).chain(cluster_models.values()) {
            let foreign = labels.missing_from(model.classes());
            if !foreign.is_empty() {
                return Err(EnsembleError::LabelMismatch {
                    model: model.name().to_string(),
                    labels: foreign,
                });
            }
        }
        if let Some(&c) = cluster_models
            .keys()
            .find(|&&c| c >= partitioner.n_clusters())
        {
            return Err(EnsembleError::InvalidModel(format!(
                "{name} has a model for cluster {c} but only {} clusters",
                partitioner.n_clusters()
            )));
        }
        Ok(Self {
            name,
            model_name,
            labels,
            partitioner,
            global,
            cluster_models,
        })
    }

    pub fn labels(&self) -> &LabelSet {
        &self.labels
    }

    pub fn partitioner(&self) -> &P {
        &self.partitioner
    }

    pub fn global_model(&self) -> &M {
        &self.global
    }

    pub fn cluster_model(&self, cluster: usize) -> Option<&M> {
        self.cluster_models.get(&cluster)
    }

    /// Clusters that have a local model, ascending.
    pub fn cluster_ids(&self) -> Vec<usize> {
        self.cluster_models.keys().copied().collect()
    }

    pub fn has_local_model(&self, cluster: usize) -> bool {
        self.cluster_models.contains_key(&cluster)
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// Global and local contributions before row normalization.
    ///
    /// Local models only see the rows of their own cluster.
    pub fn accumulate(&self, x: &FeatureMatrix) -> Result<ProbabilityMatrix> {
        let global = self.global.predict_proba(x)?;
        check_n_rows(&self.global, &global, x.n_rows())?;
        let mut acc = ProbabilityMatrix::zeros(x.n_rows(), self.labels.len());
        align::add_scaled(
            &mut acc,
            &align::reproject(&self.labels, self.global.classes(), &global),
            GLOBAL_WEIGHT,
        );

        let clusters = self.partitioner.assign(x)?;
        if clusters.len() != x.n_rows() {
            return Err(EnsembleError::InvalidModel(format!(
                "partitioner assigned {} of {} rows",
                clusters.len(),
                x.n_rows()
            )));
        }
        for (&c, model) in &self.cluster_models {
            let rows: Vec<usize> = clusters
                .iter()
                .enumerate()
                .filter(|&(_, &assigned)| assigned == c)
                .map(|(i, _)| i)
                .collect();
            if rows.is_empty() {
                continue;
            }
            let local = model.predict_proba(&x.select_rows(&rows))?;
            check_n_rows(model, &local, rows.len())?;
            let aligned = align::reproject(&self.labels, model.classes(), &local);
            for (k, &i) in rows.iter().enumerate() {
                for (a, p) in acc.row_mut(i).iter_mut().zip(aligned.row(k)) {
                    *a += LOCAL_WEIGHT * p;
                }
            }
        }
        Ok(acc)
    }
}

impl<M: MlModel, P: Partitioner> MlModel for HierarchicalAggregator<M, P> {
    fn predict_proba(&self, x: &FeatureMatrix) -> Result<ProbabilityMatrix> {
        debug!(
            model = %self.name,
            rows = x.n_rows(),
            cluster_models = self.cluster_models.len(),
            "predict_proba"
        );
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
        self.global.n_features()
    }

    /// `(global + Σ local) / (1 + n_local)`
    fn feature_importances(&self) -> Option<Vec<f64>> {
        mean_importances(
            std::iter::once(&self.global)
                .chain(self.cluster_models.values())
                .map(|m| m.feature_importances()),
        )
    }
}

// =============================================================================
// Persistence
// =============================================================================

#[derive(Debug, Deserialize)]
struct HierarchicalJson {
    model_type: String,
    model_name: String,
    #[serde(default)]
    classes: Option<LabelSet>,
    #[serde(default)]
    kmeans: Option<KMeans>,
    #[serde(default)]
    global_model: Option<RandomForest>,
    #[serde(default)]
    cluster_models: Option<BTreeMap<usize, RandomForest>>,
}

#[derive(Serialize)]
struct HierarchicalJsonRef<'a> {
    model_type: &'static str,
    model_name: &'a str,
    classes: &'a LabelSet,
    kmeans: &'a KMeans,
    global_model: &'a RandomForest,
    cluster_models: &'a BTreeMap<usize, RandomForest>,
}

impl HierarchicalAggregator<RandomForest, KMeans> {
    /// Load from a JSON file.
    pub fn from_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|e| EnsembleError::io(path, e))?;
        Self::from_json_str(&content)
    }

    /// Load from a JSON string.
    ///
    /// # Errors
    /// [`EnsembleError::NotFitted`] if any fitted attribute is null or missing.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let model: HierarchicalJson = serde_json::from_str(json)?;
        if model.model_type != MODEL_TYPE {
            return Err(EnsembleError::InvalidModel(format!(
                "expected model_type '{MODEL_TYPE}', got '{}'",
                model.model_type
            )));
        }
        let name = format!("HierarchicalRandomForest_{}", model.model_name);
        let missing = |attribute| EnsembleError::not_fitted(name.clone(), attribute);

        let classes = model.classes.ok_or_else(|| missing("classes"))?;
        let kmeans = model.kmeans.ok_or_else(|| missing("kmeans"))?;
        let global = model.global_model.ok_or_else(|| missing("global_model"))?;
        let cluster_models = model
            .cluster_models
            .ok_or_else(|| missing("cluster_models"))?;
        Self::new(model.model_name, classes, kmeans, global, cluster_models)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string(&HierarchicalJsonRef {
            model_type: MODEL_TYPE,
            model_name: &self.model_name,
            classes: &self.labels,
            kmeans: &self.partitioner,
            global_model: &self.global,
            cluster_models: &self.cluster_models,
        })?)
    }

    /// Write as JSON.
    pub fn save<Q: AsRef<Path>>(&self, path: Q) -> Result<()> {
        let path = path.as_ref();
        std::fs::write(path, self.to_json_string()?).map_err(|e| EnsembleError::io(path, e))
    }
}
