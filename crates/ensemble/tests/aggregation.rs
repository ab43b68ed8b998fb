//! Integration tests for cascade and hierarchical aggregation.
//!
//! Mock submodels pin down the blending arithmetic exactly; the stock forest
//! trainer covers the end-to-end invariants on synthetic data.

use std::collections::BTreeMap;
use std::sync::Mutex;

use ensemble::{
    CascadeAggregator, CascadeBuilder, CascadeConfig, EnsembleError, GLOBAL_WEIGHT,
    HierarchicalAggregator, HierarchicalBuilder, HierarchicalConfig, LOCAL_WEIGHT, MlModel,
    Partitioner, Result, Trainer, align,
};
use types::{ClassId, FeatureMatrix, LabelSet, ProbabilityMatrix};

// =============================================================================
// Mocks
// =============================================================================

/// Returns the same distribution for every row.
#[derive(Debug)]
struct ConstModel {
    name: String,
    classes: Vec<ClassId>,
    probs: Vec<f64>,
    /// Answers at most this many rows.
    max_rows: usize,
}

impl ConstModel {
    fn new(name: &str, classes: &[i32], probs: &[f64]) -> Self {
        Self {
            name: name.to_string(),
            classes: ids(classes),
            probs: probs.to_vec(),
            max_rows: usize::MAX,
        }
    }

    fn truncated(mut self, max_rows: usize) -> Self {
        self.max_rows = max_rows;
        self
    }
}

impl MlModel for ConstModel {
    fn predict_proba(&self, x: &FeatureMatrix) -> Result<ProbabilityMatrix> {
        let n = x.n_rows().min(self.max_rows);
        let mut out = ProbabilityMatrix::zeros(n, self.probs.len());
        for i in 0..n {
            out.row_mut(i).copy_from_slice(&self.probs);
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
        1
    }
}

/// Trains a [`ConstModel`] holding the class frequencies of its slice, so it
/// always predicts the majority class. Records every call.
#[derive(Default)]
struct MajorityTrainer {
    calls: Mutex<Vec<(usize, u64)>>,
}

impl MajorityTrainer {
    fn calls(&self) -> Vec<(usize, u64)> {
        self.calls.lock().unwrap().clone()
    }
}

impl Trainer for MajorityTrainer {
    type Model = ConstModel;

    fn train(&self, _x: &FeatureMatrix, y: &[ClassId], seed: u64) -> Result<ConstModel> {
        self.calls.lock().unwrap().push((y.len(), seed));
        let labels = LabelSet::from_targets(y);
        let mut probs = vec![0.0; labels.len()];
        for c in y {
            probs[labels.index_of(*c).unwrap()] += 1.0 / y.len() as f64;
        }
        Ok(ConstModel {
            name: format!("majority_{seed}"),
            classes: labels.as_slice().to_vec(),
            probs,
            max_rows: usize::MAX,
        })
    }
}

/// Remembers its training rows and predicts their labels one-hot.
#[derive(Debug)]
struct LookupModel {
    rows: Vec<(Vec<f64>, usize)>,
    classes: Vec<ClassId>,
}

impl MlModel for LookupModel {
    fn predict_proba(&self, x: &FeatureMatrix) -> Result<ProbabilityMatrix> {
        let mut out = ProbabilityMatrix::zeros(x.n_rows(), self.classes.len());
        for (i, row) in x.rows().enumerate() {
            if let Some((_, c)) = self.rows.iter().find(|(r, _)| r.as_slice() == row) {
                out.row_mut(i)[*c] = 1.0;
            }
        }
        Ok(out)
    }

    fn classes(&self) -> &[ClassId] {
        &self.classes
    }

    fn name(&self) -> &str {
        "lookup"
    }

    fn n_features(&self) -> usize {
        2
    }
}

struct LookupTrainer;

impl Trainer for LookupTrainer {
    type Model = LookupModel;

    fn train(&self, x: &FeatureMatrix, y: &[ClassId], _seed: u64) -> Result<LookupModel> {
        let labels = LabelSet::from_targets(y);
        let rows = x
            .rows()
            .zip(y)
            .map(|(r, c)| (r.to_vec(), labels.index_of(*c).unwrap()))
            .collect();
        Ok(LookupModel {
            rows,
            classes: labels.as_slice().to_vec(),
        })
    }
}

/// Cluster id is feature 0, truncated.
#[derive(Debug)]
struct ColumnPartitioner {
    k: usize,
}

impl Partitioner for ColumnPartitioner {
    fn n_clusters(&self) -> usize {
        self.k
    }

    fn assign(&self, x: &FeatureMatrix) -> Result<Vec<usize>> {
        Ok(x.rows().map(|r| r[0] as usize).collect())
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn ids(raw: &[i32]) -> Vec<ClassId> {
    raw.iter().copied().map(ClassId).collect()
}

fn labels(raw: &[i32]) -> LabelSet {
    LabelSet::new(ids(raw)).unwrap()
}

/// Three noisy blobs, one per class, 30 rows each.
fn blobs() -> (FeatureMatrix, Vec<ClassId>) {
    let centers = [(0.0, 0.0), (6.0, 0.0), (3.0, 5.0)];
    let mut rows = Vec::new();
    let mut y = Vec::new();
    for (c, (cx, cy)) in centers.iter().enumerate() {
        for i in 0..30 {
            let dx = ((i * 7) % 11) as f64 / 5.0 - 1.0;
            let dy = ((i * 5) % 13) as f64 / 6.0 - 1.0;
            rows.push([cx + dx, cy + dy]);
            y.push(ClassId(c as i32 * 10));
        }
    }
    (FeatureMatrix::from_rows(&rows).unwrap(), y)
}

fn small_cascade() -> CascadeConfig {
    CascadeConfig::default()
        .n_estimators_per_layer(8)
        .max_depth(6)
}

fn small_hierarchical() -> HierarchicalConfig {
    HierarchicalConfig::default()
        .n_estimators_global(8)
        .n_estimators_local(5)
        .max_depth(6)
}

fn assert_row_stochastic(proba: &ProbabilityMatrix) {
    for (i, sum) in proba.row_sums().into_iter().enumerate() {
        assert!((sum - 1.0).abs() < 1e-9, "row {i} sums to {sum}");
    }
}

// =============================================================================
// Invariants
// =============================================================================

#[test]
fn test_cascade_rows_are_stochastic() {
    let (x, y) = blobs();
    let cascade = CascadeBuilder::new(small_cascade()).fit(&x, &y).unwrap();
    assert_row_stochastic(&cascade.predict_proba(&x).unwrap());
}

#[test]
fn test_hierarchical_rows_are_stochastic() {
    let (x, y) = blobs();
    let model = HierarchicalBuilder::new(small_hierarchical())
        .fit(&x, &y)
        .unwrap();
    assert_row_stochastic(&model.predict_proba(&x).unwrap());
}

#[test]
fn test_absent_labels_are_exactly_zero_before_normalization() {
    let layers = vec![
        ConstModel::new("a", &[3, 1], &[0.6, 0.4]),
        ConstModel::new("b", &[1], &[1.0]),
    ];
    let cascade = CascadeAggregator::new("t", labels(&[0, 1, 2, 3]), layers).unwrap();
    let raw = cascade.accumulate(&FeatureMatrix::zeros(2, 1)).unwrap();
    for row in raw.rows() {
        assert_eq!(row[0], 0.0);
        assert_eq!(row[2], 0.0);
        assert!(row[1] > 0.0 && row[3] > 0.0);
    }
}

#[test]
fn test_three_layer_weights_are_four_two_one() {
    let layers = (0..3)
        .map(|i| ConstModel::new(&format!("l{i}"), &[0], &[1.0]))
        .collect();
    let cascade = CascadeAggregator::new("t", labels(&[0]), layers).unwrap();
    let w = cascade.layer_weights();
    assert_eq!(w.len(), 3);
    assert!((w[0] - 4.0 / 7.0).abs() < 1e-12);
    assert!((w[1] - 2.0 / 7.0).abs() < 1e-12);
    assert!((w[2] - 1.0 / 7.0).abs() < 1e-12);
}

#[test]
fn test_hierarchical_local_to_global_mass_is_three_to_one() {
    // Global and local put all mass on different labels, so the raw row
    // separates the two contributions.
    let global = ConstModel::new("g", &[0, 1], &[1.0, 0.0]);
    let mut locals = BTreeMap::new();
    locals.insert(0, ConstModel::new("l0", &[1], &[1.0]));
    let model = HierarchicalAggregator::new(
        "t",
        labels(&[0, 1]),
        ColumnPartitioner { k: 1 },
        global,
        locals,
    )
    .unwrap();

    let raw = model.accumulate(&FeatureMatrix::zeros(3, 1)).unwrap();
    for row in raw.rows() {
        assert_eq!(row[0], GLOBAL_WEIGHT);
        assert_eq!(row[1], LOCAL_WEIGHT);
        assert_eq!(row[1] / row[0], 3.0);
    }
}

#[test]
fn test_predict_is_argmax_of_predict_proba() {
    let (x, y) = blobs();
    let cascade = CascadeBuilder::new(small_cascade()).fit(&x, &y).unwrap();
    let hierarchical = HierarchicalBuilder::new(small_hierarchical())
        .fit(&x, &y)
        .unwrap();

    for model in [&cascade as &dyn MlModel, &hierarchical] {
        let proba = model.predict_proba(&x).unwrap();
        let predicted = model.predict(&x).unwrap();
        for (i, row) in proba.rows().enumerate() {
            assert_eq!(predicted[i], model.classes()[align::argmax(row)]);
        }
    }
}

#[test]
fn test_ties_resolve_to_lowest_label_index() {
    let layers = vec![ConstModel::new("tie", &[4, 2, 9], &[0.4, 0.4, 0.2])];
    let cascade = CascadeAggregator::new("t", labels(&[4, 2, 9]), layers).unwrap();
    assert_eq!(
        cascade.predict(&FeatureMatrix::zeros(1, 1)).unwrap(),
        ids(&[4])
    );
}

#[test]
fn test_predict_proba_is_reproducible() {
    let (x, y) = blobs();
    let cascade = CascadeBuilder::new(small_cascade()).fit(&x, &y).unwrap();
    let first = cascade.predict_proba(&x).unwrap();
    let second = cascade.predict_proba(&x).unwrap();
    assert_eq!(first.as_slice(), second.as_slice());

    let refit = CascadeBuilder::new(small_cascade()).fit(&x, &y).unwrap();
    assert_eq!(refit.predict_proba(&x).unwrap(), first);
}

#[test]
fn test_fitted_models_predict_training_blobs() {
    let (x, y) = blobs();
    let cascade = CascadeBuilder::new(small_cascade()).fit(&x, &y).unwrap();
    let predicted = cascade.predict(&x).unwrap();
    assert!(ensemble::accuracy(&predicted, &y) > 0.9);
}

// =============================================================================
// Scenarios
// =============================================================================

#[test]
fn test_cascade_stops_after_perfect_first_layer() {
    let (x, y) = blobs();
    let cascade = CascadeBuilder::with_trainer(CascadeConfig::default(), LookupTrainer)
        .fit(&x, &y)
        .unwrap();
    assert_eq!(cascade.n_layers(), 1);
    assert_eq!(cascade.layer_weights(), &[1.0]);
}

#[test]
fn test_cascade_routes_residuals_and_stops_below_threshold() {
    // 30 × class 0, 15 × class 1, 5 × class 2
    let mut y = vec![ClassId(0); 30];
    y.extend(vec![ClassId(1); 15]);
    y.extend(vec![ClassId(2); 5]);
    let x = FeatureMatrix::zeros(y.len(), 1);

    let trainer = MajorityTrainer::default();
    let builder = CascadeBuilder::with_trainer(CascadeConfig::default().random_state(42), trainer);
    let cascade = builder.fit(&x, &y).unwrap();

    // Layer 0 predicts class 0 and misses 20 rows; layer 1 trains on them,
    // predicts class 1 and misses 5, which is under the threshold of 10.
    assert_eq!(cascade.n_layers(), 2);
    assert_eq!(cascade.layers()[1].classes(), ids(&[1, 2]).as_slice());
    assert_eq!(cascade.labels().as_slice(), ids(&[0, 1, 2]).as_slice());
}

#[test]
fn test_cascade_layer_seeds_and_slices() {
    let mut y = vec![ClassId(0); 30];
    y.extend(vec![ClassId(1); 15]);
    y.extend(vec![ClassId(2); 5]);
    let x = FeatureMatrix::zeros(y.len(), 1);

    let trainer = MajorityTrainer::default();
    CascadeBuilder::with_trainer(CascadeConfig::default().random_state(7), &trainer)
        .fit(&x, &y)
        .unwrap();
    assert_eq!(trainer.calls(), vec![(50, 7), (20, 8)]);
}

#[test]
fn test_hierarchical_skips_small_cluster() {
    // Clusters 0..4 get 12 rows each, cluster 4 only 3.
    let mut rows = Vec::new();
    let mut y = Vec::new();
    for c in 0..5 {
        let n = if c == 4 { 3 } else { 12 };
        for i in 0..n {
            rows.push([c as f64, i as f64]);
            y.push(ClassId(((c + i) % 3) as i32));
        }
    }
    let x = FeatureMatrix::from_rows(&rows).unwrap();

    let config = HierarchicalConfig::default().n_clusters(5).random_state(100);
    let trainer = MajorityTrainer::default();
    let model = HierarchicalBuilder::with_trainers(config, &trainer, &trainer)
        .fit_with_partitioner(&x, &y, ColumnPartitioner { k: 5 })
        .unwrap();

    assert_eq!(model.cluster_ids(), vec![0, 1, 2, 3]);
    assert!(!model.has_local_model(4));

    // Global seeded with random_state, cluster c with random_state + c.
    let mut seeds: Vec<u64> = trainer.calls().into_iter().map(|(_, s)| s).collect();
    seeds.sort_unstable();
    assert_eq!(seeds, vec![100, 100, 101, 102, 103]);

    // Rows of cluster 4 get the global distribution alone, renormalized.
    let probe = FeatureMatrix::from_rows(&[[4.0, 0.0]]).unwrap();
    let proba = model.predict_proba(&probe).unwrap();
    let global = model.global_model().predict_proba(&probe).unwrap();
    let mut expected = align::reproject(model.labels(), model.global_model().classes(), &global);
    align::normalize_rows(&mut expected);
    for (a, b) in proba.row(0).iter().zip(expected.row(0)) {
        assert!((a - b).abs() < 1e-12);
    }
}

#[test]
fn test_zero_mass_row_stays_zero() {
    let layers = vec![ConstModel::new("void", &[0, 1], &[0.0, 0.0])];
    let cascade = CascadeAggregator::new("t", labels(&[0, 1]), layers).unwrap();
    let proba = cascade.predict_proba(&FeatureMatrix::zeros(2, 1)).unwrap();
    assert_eq!(proba.as_slice(), &[0.0; 4]);
    assert!(proba.as_slice().iter().all(|p| p.is_finite()));
}

#[test]
fn test_unfitted_artifacts_are_rejected() {
    let json = r#"{"model_type": "cascade_random_forest", "model_name": "crop", "classes": null, "layers": null}"#;
    let err = CascadeAggregator::from_json_str(json).unwrap_err();
    assert!(matches!(
        err,
        EnsembleError::NotFitted {
            attribute: "classes",
            ..
        }
    ));

    let json = r#"{"model_type": "hierarchical_random_forest", "model_name": "crop", "classes": [0]}"#;
    let err = HierarchicalAggregator::from_json_str(json).unwrap_err();
    assert!(matches!(
        err,
        EnsembleError::NotFitted {
            attribute: "kmeans",
            ..
        }
    ));
}

#[test]
fn test_shape_mismatch_propagates() {
    let (x, y) = blobs();
    let cascade = CascadeBuilder::new(small_cascade()).fit(&x, &y).unwrap();
    let err = cascade.predict_proba(&FeatureMatrix::zeros(1, 5)).unwrap_err();
    assert!(matches!(
        err,
        EnsembleError::ShapeMismatch {
            expected: 2,
            found: 5
        }
    ));
}

#[test]
fn test_short_submodel_output_is_an_error() {
    let x = FeatureMatrix::zeros(3, 1);

    let layers = vec![
        ConstModel::new("full", &[0, 1], &[0.5, 0.5]),
        ConstModel::new("short", &[0, 1], &[0.5, 0.5]).truncated(1),
    ];
    let cascade = CascadeAggregator::new("t", labels(&[0, 1]), layers).unwrap();
    let err = cascade.predict_proba(&x).unwrap_err();
    assert!(matches!(
        err,
        EnsembleError::RowCountMismatch {
            ref model,
            expected: 3,
            found: 1
        } if model == "short"
    ));

    let mut locals = BTreeMap::new();
    locals.insert(0, ConstModel::new("l0", &[1], &[1.0]).truncated(2));
    let hierarchical = HierarchicalAggregator::new(
        "t",
        labels(&[0, 1]),
        ColumnPartitioner { k: 1 },
        ConstModel::new("g", &[0, 1], &[1.0, 0.0]),
        locals,
    )
    .unwrap();
    let err = hierarchical.predict_proba(&x).unwrap_err();
    assert!(matches!(
        err,
        EnsembleError::RowCountMismatch {
            expected: 3,
            found: 2,
            ..
        }
    ));
}
