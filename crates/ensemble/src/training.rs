//! Random-forest training (CART, Gini impurity).
//!
//! Aggregators never train submodels directly: they ask a [`Trainer`] for a
//! fitted model given a row slice and a seed. [`ForestTrainer`] is the stock
//! implementation and mirrors the usual random-forest recipe:
//!
//! 1. Draw a bootstrap sample per tree (`StdRng` seeded `seed + tree_index`)
//! 2. At each node, search `sqrt(n_features)` random features for the split
//!    with the lowest weighted Gini impurity (midpoint thresholds), looking
//!    further only when none of them separates anything
//! 3. Stop on purity, `max_depth`, or fewer than `min_samples_split` rows
//! 4. Leaves store class frequencies; impurity decrease feeds importances
//!
//! Trees are grown independently through [`parallel::map_indices`], so the
//! result is identical with or without the `parallel` feature.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use smallvec::SmallVec;
use tracing::debug;
use types::{ClassId, FeatureMatrix, LabelSet};

use crate::decision_tree::{DecisionTree, TreeNode};
use crate::{EnsembleError, MlModel, RandomForest, Result};

/// Per-class counts; crop label sets fit inline.
type ClassCounts = SmallVec<[usize; 32]>;

/// Something that can fit a submodel on a slice of training rows.
pub trait Trainer: Send + Sync {
    type Model: MlModel;

    /// Fit a model on `x`/`y`. The model's classes are the labels present in `y`.
    fn train(&self, x: &FeatureMatrix, y: &[ClassId], seed: u64) -> Result<Self::Model>;
}

impl<T: Trainer + ?Sized> Trainer for &T {
    type Model = T::Model;

    fn train(&self, x: &FeatureMatrix, y: &[ClassId], seed: u64) -> Result<Self::Model> {
        (**self).train(x, y, seed)
    }
}

/// Random forest hyperparameters.
#[derive(Debug, Clone)]
pub struct ForestConfig {
    /// Name stored in the fitted forest (`RandomForest_{model_name}`).
    pub model_name: String,
    pub n_estimators: usize,
    /// None grows until leaves are pure.
    pub max_depth: Option<usize>,
    pub min_samples_split: usize,
    /// Features tried per split. None means `sqrt(n_features)`.
    pub max_features: Option<usize>,
    pub bootstrap: bool,
    /// Grow trees on the calling thread only.
    pub force_sequential: bool,
}

impl Default for ForestConfig {
    fn default() -> Self {
        Self {
            model_name: "forest".to_string(),
            n_estimators: 100,
            max_depth: None,
            min_samples_split: 2,
            max_features: None,
            bootstrap: true,
            force_sequential: false,
        }
    }
}

impl ForestConfig {
    pub fn model_name(mut self, name: impl Into<String>) -> Self {
        self.model_name = name.into();
        self
    }

    pub fn n_estimators(mut self, n: usize) -> Self {
        self.n_estimators = n;
        self
    }

    pub fn max_depth(mut self, depth: usize) -> Self {
        self.max_depth = Some(depth);
        self
    }

    pub fn min_samples_split(mut self, n: usize) -> Self {
        self.min_samples_split = n;
        self
    }

    pub fn max_features(mut self, n: usize) -> Self {
        self.max_features = Some(n);
        self
    }

    pub fn bootstrap(mut self, enabled: bool) -> Self {
        self.bootstrap = enabled;
        self
    }

    pub fn force_sequential(mut self, sequential: bool) -> Self {
        self.force_sequential = sequential;
        self
    }
}

/// Trains [`RandomForest`]s.
#[derive(Debug, Clone, Default)]
pub struct ForestTrainer {
    config: ForestConfig,
}

impl ForestTrainer {
    pub fn new(config: ForestConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ForestConfig {
        &self.config
    }
}

impl Trainer for ForestTrainer {
    type Model = RandomForest;

    fn train(&self, x: &FeatureMatrix, y: &[ClassId], seed: u64) -> Result<RandomForest> {
        check_training_data(x, y)?;
        if self.config.n_estimators == 0 {
            return Err(EnsembleError::InvalidInput(
                "n_estimators must be at least 1".into(),
            ));
        }

        let labels = LabelSet::from_targets(y);
        let y_idx: Vec<usize> = y
            .iter()
            .filter_map(|c| labels.index_of(*c))
            .collect();
        let n_features = x.n_cols();
        let max_features = self
            .config
            .max_features
            .unwrap_or_else(|| (n_features as f64).sqrt() as usize)
            .clamp(1, n_features.max(1));

        debug!(
            model = %self.config.model_name,
            rows = x.n_rows(),
            classes = labels.len(),
            trees = self.config.n_estimators,
            "training forest"
        );

        let grown = parallel::map_indices(
            self.config.n_estimators,
            |t| {
                let rng = StdRng::seed_from_u64(seed.wrapping_add(t as u64));
                TreeGrower::new(x, &y_idx, labels.len(), max_features, &self.config, rng)
                    .grow_tree()
            },
            self.config.force_sequential,
        );

        let mut importances = vec![0.0; n_features];
        let mut trees = Vec::with_capacity(grown.len());
        for (tree, tree_importances) in grown {
            for (acc, v) in importances.iter_mut().zip(&tree_importances) {
                *acc += v;
            }
            trees.push(tree);
        }
        let n_trees = trees.len() as f64;
        importances.iter_mut().for_each(|v| *v /= n_trees);

        Ok(RandomForest::new(
            self.config.model_name.clone(),
            n_features,
            labels.as_slice().to_vec(),
            trees,
        )?
        .with_feature_importances(importances))
    }
}

/// Reject empty or mismatched training data.
pub(crate) fn check_training_data(x: &FeatureMatrix, y: &[ClassId]) -> Result<()> {
    if x.n_rows() != y.len() {
        return Err(EnsembleError::InvalidInput(format!(
            "{} feature rows but {} targets",
            x.n_rows(),
            y.len()
        )));
    }
    if y.is_empty() {
        return Err(EnsembleError::InvalidInput("no training samples".into()));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
struct Split {
    feature: usize,
    threshold: f64,
    /// `n_left * gini_left + n_right * gini_right`
    weighted_impurity: f64,
}

/// Grows one tree in pre-order, so children always follow their parent.
struct TreeGrower<'a> {
    x: &'a FeatureMatrix,
    y: &'a [usize],
    n_classes: usize,
    max_features: usize,
    config: &'a ForestConfig,
    rng: StdRng,
    nodes: Vec<TreeNode>,
    importances: Vec<f64>,
}

impl<'a> TreeGrower<'a> {
    fn new(
        x: &'a FeatureMatrix,
        y: &'a [usize],
        n_classes: usize,
        max_features: usize,
        config: &'a ForestConfig,
        rng: StdRng,
    ) -> Self {
        Self {
            x,
            y,
            n_classes,
            max_features,
            config,
            rng,
            nodes: Vec::new(),
            importances: vec![0.0; x.n_cols()],
        }
    }

    /// Grow the tree; returns it with importances normalized to sum to 1.
    fn grow_tree(mut self) -> (DecisionTree, Vec<f64>) {
        let n = self.y.len();
        let mut samples: Vec<usize> = if self.config.bootstrap {
            (0..n).map(|_| self.rng.r#gen_range(0..n)).collect()
        } else {
            (0..n).collect()
        };
        self.grow(&mut samples, 0);

        let total: f64 = self.importances.iter().sum();
        if total > 0.0 {
            self.importances.iter_mut().for_each(|v| *v /= total);
        }
        (DecisionTree::new(self.nodes), self.importances)
    }

    fn grow(&mut self, samples: &mut [usize], depth: usize) -> usize {
        let idx = self.nodes.len();
        let counts = self.class_counts(samples);
        let n = samples.len();
        let impurity = gini(&counts, n);

        let splittable = impurity > 0.0
            && n >= self.config.min_samples_split.max(2)
            && self.config.max_depth.is_none_or(|d| depth < d);

        if splittable {
            if let Some(split) = self.best_split(samples, impurity) {
                self.nodes
                    .push(TreeNode::split(split.feature, split.threshold, 0, 0));
                self.importances[split.feature] += n as f64 * impurity - split.weighted_impurity;

                let x = self.x;
                let mid = partition(samples, |s| x.row(s)[split.feature] <= split.threshold);
                let (left, right) = samples.split_at_mut(mid);
                let l = self.grow(left, depth + 1);
                let r = self.grow(right, depth + 1);
                self.nodes[idx].left = l as i32;
                self.nodes[idx].right = r as i32;
                return idx;
            }
        }

        let value = counts.iter().map(|&c| c as f64 / n as f64).collect();
        self.nodes.push(TreeNode::leaf(value));
        idx
    }

    fn class_counts(&self, samples: &[usize]) -> ClassCounts {
        let mut counts: ClassCounts = SmallVec::from_elem(0, self.n_classes);
        for &s in samples {
            counts[self.y[s]] += 1;
        }
        counts
    }

    /// Best impurity-reducing split, if any.
    ///
    /// Features are visited in random order. The search stops after
    /// `max_features` of them once some split has been found, and keeps going
    /// past that until one is.
    fn best_split(&mut self, samples: &[usize], impurity: f64) -> Option<Split> {
        let n = samples.len();
        let parent = n as f64 * impurity - 1e-12;
        let n_cols = self.x.n_cols();
        let order = rand::seq::index::sample(&mut self.rng, n_cols, n_cols);

        let mut best: Option<Split> = None;
        let mut column: Vec<(f64, usize)> = Vec::with_capacity(n);
        for (visited, f) in order.iter().enumerate() {
            if visited >= self.max_features && best.is_some() {
                break;
            }
            column.clear();
            column.extend(samples.iter().map(|&s| (self.x.row(s)[f], self.y[s])));
            column.sort_by(|a, b| a.0.total_cmp(&b.0));

            let mut left: ClassCounts = SmallVec::from_elem(0, self.n_classes);
            let mut right = self.class_counts(samples);
            for i in 0..n - 1 {
                let (v, c) = column[i];
                left[c] += 1;
                right[c] -= 1;
                let next = column[i + 1].0;
                if !(v < next) {
                    continue;
                }
                let n_left = i + 1;
                let n_right = n - n_left;
                let weighted =
                    n_left as f64 * gini(&left, n_left) + n_right as f64 * gini(&right, n_right);
                if weighted < parent && best.is_none_or(|b| weighted < b.weighted_impurity) {
                    let mut threshold = v + (next - v) / 2.0;
                    if threshold >= next {
                        threshold = v;
                    }
                    best = Some(Split {
                        feature: f,
                        threshold,
                        weighted_impurity: weighted,
                    });
                }
            }
        }

        best
    }
}

/// Gini impurity `1 - Σ p²` of a count vector.
fn gini(counts: &[usize], n: usize) -> f64 {
    if n == 0 {
        return 0.0;
    }
    let n = n as f64;
    1.0 - counts
        .iter()
        .map(|&c| {
            let p = c as f64 / n;
            p * p
        })
        .sum::<f64>()
}

/// Move rows satisfying `goes_left` to the front; returns how many did.
fn partition(samples: &mut [usize], goes_left: impl Fn(usize) -> bool) -> usize {
    let mut mid = 0;
    for i in 0..samples.len() {
        if goes_left(samples[i]) {
            samples.swap(i, mid);
            mid += 1;
        }
    }
    mid
}
