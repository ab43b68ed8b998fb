//! Top prediction plus ranked alternatives.

use serde::Serialize;
use types::{ClassId, FeatureMatrix};

use crate::{MlModel, Result};

/// Best class for one row and the runners-up.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub class: ClassId,
    pub confidence: f64,
    /// Next most probable classes, most probable first.
    pub alternatives: Vec<(ClassId, f64)>,
}

/// The `k` most probable classes of `row`, most probable first.
///
/// Equal probabilities keep column order, so the result agrees with
/// [`align::argmax`](crate::align::argmax) on the first entry.
pub fn top_k(row: &[f64], classes: &[ClassId], k: usize) -> Vec<(ClassId, f64)> {
    let mut ranked: Vec<(ClassId, f64)> = classes
        .iter()
        .copied()
        .zip(row.iter().copied())
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    ranked.truncate(k);
    ranked
}

/// One recommendation per row of `x`, with up to `k - 1` alternatives.
pub fn recommend(model: &dyn MlModel, x: &FeatureMatrix, k: usize) -> Result<Vec<Recommendation>> {
    let proba = model.predict_proba(x)?;
    let classes = model.classes();
    Ok(proba
        .rows()
        .filter_map(|row| {
            let mut ranked = top_k(row, classes, k.max(1)).into_iter();
            ranked.next().map(|(class, confidence)| Recommendation {
                class,
                confidence,
                alternatives: ranked.collect(),
            })
        })
        .collect())
}
