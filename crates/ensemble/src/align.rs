//! Probability alignment and shared row math.
//!
//! Every submodel reports probabilities over its own label subset, in its own
//! column order. Before two submodels can be blended their outputs have to be
//! re-projected into the master [`LabelSet`] order; labels a submodel never
//! saw contribute exactly zero.

use tracing::warn;
use types::{ClassId, LabelSet, ProbabilityMatrix};

/// For each column of `subset`, its position in `master` (None if absent).
pub fn column_map(master: &LabelSet, subset: &[ClassId]) -> Vec<Option<usize>> {
    subset.iter().map(|c| master.index_of(*c)).collect()
}

/// Re-project `proba` (columns in `subset` order) into `master` column order.
///
/// Master labels missing from `subset` are zero-filled. Subset labels outside
/// the master set are dropped; aggregators reject those at construction, so
/// this only matters for ad-hoc callers.
pub fn reproject(
    master: &LabelSet,
    subset: &[ClassId],
    proba: &ProbabilityMatrix,
) -> ProbabilityMatrix {
    let map = column_map(master, subset);
    let mut out = ProbabilityMatrix::zeros(proba.n_rows(), master.len());
    for (i, row) in proba.rows().enumerate() {
        let dst = out.row_mut(i);
        for (j, &p) in row.iter().enumerate() {
            if let Some(Some(k)) = map.get(j) {
                dst[*k] = p;
            }
        }
    }
    out
}

/// Add `weight * src` into `dst` row by row.
pub(crate) fn add_scaled(dst: &mut ProbabilityMatrix, src: &ProbabilityMatrix, weight: f64) {
    for i in 0..dst.n_rows() {
        for (d, s) in dst.row_mut(i).iter_mut().zip(src.row(i)) {
            *d += weight * s;
        }
    }
}

/// Divide every row by its sum.
///
/// A row summing to exactly zero is divided by 1 instead, so it stays all-zero
/// rather than turning into NaN. Returns how many such rows were seen and logs
/// a warning when there were any: a zero row means no submodel put mass on any
/// master label, which points at an alignment bug upstream.
pub fn normalize_rows(proba: &mut ProbabilityMatrix) -> usize {
    let mut degenerate = 0;
    for i in 0..proba.n_rows() {
        let row = proba.row_mut(i);
        let mut sum: f64 = row.iter().sum();
        if sum == 0.0 {
            degenerate += 1;
            sum = 1.0;
        }
        for p in row.iter_mut() {
            *p /= sum;
        }
    }
    if degenerate > 0 {
        warn!(
            rows = degenerate,
            total = proba.n_rows(),
            "degenerate probability rows: zero mass on every label"
        );
    }
    degenerate
}

/// Index of the first maximal element (lowest index wins ties).
///
/// Returns 0 for an empty row.
#[inline]
pub fn argmax(row: &[f64]) -> usize {
    let mut best = 0;
    for (i, &p) in row.iter().enumerate().skip(1) {
        if p > row[best] {
            best = i;
        }
    }
    best
}

/// Normalized cascade layer weights: layer `i` of `n` gets `2^(n-i-1)`.
pub fn cascade_weights(n_layers: usize) -> Vec<f64> {
    let raw: Vec<f64> = (0..n_layers)
        .map(|i| 2f64.powi((n_layers - i - 1) as i32))
        .collect();
    let total: f64 = raw.iter().sum();
    raw.into_iter().map(|w| w / total).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(raw: &[i32]) -> LabelSet {
        LabelSet::new(raw.iter().copied().map(ClassId).collect()).unwrap()
    }

    #[test]
    fn test_reproject_zero_fills_absent_labels() {
        let master = labels(&[0, 1, 2, 3]);
        let subset = [ClassId(3), ClassId(1)];
        let proba = ProbabilityMatrix::from_rows(&[[0.7, 0.3], [0.1, 0.9]]).unwrap();

        let out = reproject(&master, &subset, &proba);
        assert_eq!(out.row(0), &[0.0, 0.3, 0.0, 0.7]);
        assert_eq!(out.row(1), &[0.0, 0.9, 0.0, 0.1]);
    }

    #[test]
    fn test_reproject_drops_foreign_labels() {
        let master = labels(&[0, 1]);
        let subset = [ClassId(1), ClassId(9)];
        let proba = ProbabilityMatrix::from_rows(&[[0.4, 0.6]]).unwrap();
        let out = reproject(&master, &subset, &proba);
        assert_eq!(out.row(0), &[0.0, 0.4]);
    }

    #[test]
    fn test_normalize_rows_guards_zero_sum() {
        let mut m = ProbabilityMatrix::from_rows(&[[1.0, 3.0], [0.0, 0.0]]).unwrap();
        let degenerate = normalize_rows(&mut m);
        assert_eq!(degenerate, 1);
        assert_eq!(m.row(0), &[0.25, 0.75]);
        assert_eq!(m.row(1), &[0.0, 0.0]);
        assert!(m.as_slice().iter().all(|p| p.is_finite()));
    }

    #[test]
    fn test_argmax_lowest_index_wins() {
        assert_eq!(argmax(&[0.2, 0.4, 0.4]), 1);
        assert_eq!(argmax(&[0.0, 0.0]), 0);
        assert_eq!(argmax(&[0.1, 0.2, 0.7]), 2);
        assert_eq!(argmax(&[]), 0);
    }

    #[test]
    fn test_cascade_weights_halve_per_layer() {
        let w = cascade_weights(3);
        assert!((w[0] - 4.0 / 7.0).abs() < 1e-12);
        assert!((w[1] - 2.0 / 7.0).abs() < 1e-12);
        assert!((w[2] - 1.0 / 7.0).abs() < 1e-12);
        assert_eq!(cascade_weights(1), vec![1.0]);
        assert!(cascade_weights(0).is_empty());
    }

    #[test]
    fn test_add_scaled() {
        let mut acc = ProbabilityMatrix::zeros(1, 2);
        let src = ProbabilityMatrix::from_rows(&[[0.4, 0.6]]).unwrap();
        add_scaled(&mut acc, &src, 0.5);
        add_scaled(&mut acc, &src, 0.5);
        assert!((acc.row(0)[0] - 0.4).abs() < 1e-12);
        assert!((acc.row(0)[1] - 0.6).abs() < 1e-12);
    }
}
