//! Unsupervised row partitioning for the hierarchical aggregator.
//!
//! The partitioner is fit once on the training matrix and then only ever
//! asked to [`assign`](Partitioner::assign) rows. Cluster boundaries never
//! move after fit, so a row lands in the same cluster at every inference.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;
use types::FeatureMatrix;

use crate::{EnsembleError, Result, check_n_features};

/// Maps each row of a feature matrix to a cluster id in `0..n_clusters()`.
pub trait Partitioner: Send + Sync {
    fn n_clusters(&self) -> usize;

    /// Cluster id per row.
    ///
    /// # Errors
    /// [`EnsembleError::ShapeMismatch`] if the width differs from fit time.
    fn assign(&self, x: &FeatureMatrix) -> Result<Vec<usize>>;
}

/// K-means hyperparameters.
#[derive(Debug, Clone)]
pub struct KMeansConfig {
    pub n_clusters: usize,
    /// Independent k-means++ restarts; the lowest inertia wins.
    pub n_init: usize,
    pub max_iter: usize,
    /// Convergence threshold, relative to the mean per-feature variance.
    pub tol: f64,
    pub random_state: u64,
}

impl Default for KMeansConfig {
    fn default() -> Self {
        Self {
            n_clusters: 3,
            n_init: 10,
            max_iter: 300,
            tol: 1e-4,
            random_state: 42,
        }
    }
}

impl KMeansConfig {
    pub fn n_clusters(mut self, k: usize) -> Self {
        self.n_clusters = k;
        self
    }

    pub fn n_init(mut self, n: usize) -> Self {
        self.n_init = n;
        self
    }

    pub fn max_iter(mut self, n: usize) -> Self {
        self.max_iter = n;
        self
    }

    pub fn random_state(mut self, seed: u64) -> Self {
        self.random_state = seed;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct KMeansJson {
    centroids: Vec<Vec<f64>>,
}

/// Fitted k-means model (centroids only).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "KMeansJson", into = "KMeansJson")]
pub struct KMeans {
    centroids: Vec<Vec<f64>>,
    n_features: usize,
}

impl KMeans {
    /// Build from known centroids.
    ///
    /// # Errors
    /// [`EnsembleError::InvalidModel`] if there are no centroids or they
    /// differ in width.
    pub fn from_centroids(centroids: Vec<Vec<f64>>) -> Result<Self> {
        let Some(first) = centroids.first() else {
            return Err(EnsembleError::InvalidModel("k-means has no centroids".into()));
        };
        let n_features = first.len();
        if let Some(i) = centroids.iter().position(|c| c.len() != n_features) {
            return Err(EnsembleError::InvalidModel(format!(
                "centroid {i} has {} features, expected {n_features}",
                centroids[i].len()
            )));
        }
        Ok(Self {
            centroids,
            n_features,
        })
    }

    /// Fit with k-means++ seeding and Lloyd iterations.
    ///
    /// Restart `r` seeds its RNG with `random_state + r`.
    pub fn fit(x: &FeatureMatrix, config: &KMeansConfig) -> Result<Self> {
        let k = config.n_clusters;
        if k == 0 {
            return Err(EnsembleError::InvalidInput(
                "n_clusters must be at least 1".into(),
            ));
        }
        if x.n_rows() < k {
            return Err(EnsembleError::InvalidInput(format!(
                "{} rows is fewer than {k} clusters",
                x.n_rows()
            )));
        }

        let tol = config.tol * mean_variance(x);
        let runs = parallel::map_indices(
            config.n_init.max(1),
            |r| {
                let mut rng = StdRng::seed_from_u64(config.random_state.wrapping_add(r as u64));
                lloyd(x, init_plus_plus(x, k, &mut rng), config.max_iter, tol)
            },
            false,
        );

        // First run wins ties
        let mut best: Option<(Vec<Vec<f64>>, f64)> = None;
        for (centroids, inertia) in runs {
            if best.as_ref().is_none_or(|(_, b)| inertia < *b) {
                best = Some((centroids, inertia));
            }
        }
        let Some((centroids, inertia)) = best else {
            return Err(EnsembleError::InvalidInput("k-means produced no runs".into()));
        };
        debug!(k, inertia, "k-means fitted");
        Self::from_centroids(centroids)
    }

    pub fn centroids(&self) -> &[Vec<f64>] {
        &self.centroids
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    /// Sum of squared distances from each row to its centroid.
    pub fn inertia(&self, x: &FeatureMatrix) -> Result<f64> {
        check_n_features(x, self.n_features)?;
        Ok(x.rows().map(|row| nearest(&self.centroids, row).1).sum())
    }
}

impl Partitioner for KMeans {
    fn n_clusters(&self) -> usize {
        self.centroids.len()
    }

    fn assign(&self, x: &FeatureMatrix) -> Result<Vec<usize>> {
        check_n_features(x, self.n_features)?;
        Ok(x.rows().map(|row| nearest(&self.centroids, row).0).collect())
    }
}

impl TryFrom<KMeansJson> for KMeans {
    type Error = EnsembleError;

    fn try_from(json: KMeansJson) -> Result<Self> {
        Self::from_centroids(json.centroids)
    }
}

impl From<KMeans> for KMeansJson {
    fn from(model: KMeans) -> Self {
        Self {
            centroids: model.centroids,
        }
    }
}

#[inline]
fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Nearest centroid index and squared distance (lowest index wins ties).
fn nearest(centroids: &[Vec<f64>], row: &[f64]) -> (usize, f64) {
    let mut best = (0, f64::INFINITY);
    for (c, centroid) in centroids.iter().enumerate() {
        let d = squared_distance(centroid, row);
        if d < best.1 {
            best = (c, d);
        }
    }
    best
}

fn mean_variance(x: &FeatureMatrix) -> f64 {
    let n = x.n_rows() as f64;
    if x.n_cols() == 0 || n == 0.0 {
        return 0.0;
    }
    let mut total = 0.0;
    for j in 0..x.n_cols() {
        let mean = x.rows().map(|r| r[j]).sum::<f64>() / n;
        total += x.rows().map(|r| (r[j] - mean).powi(2)).sum::<f64>() / n;
    }
    total / x.n_cols() as f64
}

/// k-means++: each next centroid is drawn with probability proportional to
/// its squared distance from the nearest centroid chosen so far.
fn init_plus_plus(x: &FeatureMatrix, k: usize, rng: &mut StdRng) -> Vec<Vec<f64>> {
    let n = x.n_rows();
    let mut centroids = vec![x.row(rng.r#gen_range(0..n)).to_vec()];
    let mut d2: Vec<f64> = x
        .rows()
        .map(|row| squared_distance(row, &centroids[0]))
        .collect();

    while centroids.len() < k {
        let total: f64 = d2.iter().sum();
        let pick = if total > 0.0 {
            let target = rng.r#gen::<f64>() * total;
            let mut acc = 0.0;
            d2.iter()
                .position(|&d| {
                    acc += d;
                    acc > target
                })
                .unwrap_or(n - 1)
        } else {
            rng.r#gen_range(0..n)
        };
        let centroid = x.row(pick).to_vec();
        for (d, row) in d2.iter_mut().zip(x.rows()) {
            *d = d.min(squared_distance(row, &centroid));
        }
        centroids.push(centroid);
    }
    centroids
}

/// Lloyd iterations from `centroids`; returns final centroids and inertia.
fn lloyd(
    x: &FeatureMatrix,
    mut centroids: Vec<Vec<f64>>,
    max_iter: usize,
    tol: f64,
) -> (Vec<Vec<f64>>, f64) {
    let k = centroids.len();
    let d = x.n_cols();
    for _ in 0..max_iter {
        let mut sums = vec![vec![0.0; d]; k];
        let mut counts = vec![0usize; k];
        for row in x.rows() {
            let c = nearest(&centroids, row).0;
            counts[c] += 1;
            for (s, v) in sums[c].iter_mut().zip(row) {
                *s += v;
            }
        }

        let mut shift = 0.0;
        for c in 0..k {
            // Empty clusters keep their previous centroid
            if counts[c] == 0 {
                continue;
            }
            let updated: Vec<f64> = sums[c].iter().map(|s| s / counts[c] as f64).collect();
            shift += squared_distance(&updated, &centroids[c]);
            centroids[c] = updated;
        }
        if shift <= tol {
            break;
        }
    }
    let inertia = x.rows().map(|row| nearest(&centroids, row).1).sum();
    (centroids, inertia)
}
