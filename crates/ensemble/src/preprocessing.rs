//! Feature preparation: categorical encoding and standard scaling.
//!
//! Training and serving must feed models identical column orders and
//! encodings, so the [`Preprocessor`] fitted during training is saved into the
//! model bundle and loaded back verbatim at inference.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;
use types::{ClassId, FeatureMatrix, schema};

use crate::{EnsembleError, Result, check_n_features};

/// File name of the preprocessor inside a model bundle.
pub const PREPROCESSOR_FILE: &str = "preprocessor.json";

/// One raw input row: column name → cell text.
pub type Record = HashMap<String, String>;

// =============================================================================
// LabelEncoder
// =============================================================================

/// Maps strings to dense integer codes in sorted order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelEncoder {
    classes: Vec<String>,
}

impl LabelEncoder {
    /// Sorted unique values become codes `0..n`.
    pub fn fit<'a>(values: impl IntoIterator<Item = &'a str>) -> Self {
        let mut classes: Vec<String> = values.into_iter().map(str::to_string).collect();
        classes.sort_unstable();
        classes.dedup();
        Self { classes }
    }

    pub fn encode(&self, value: &str) -> Option<ClassId> {
        self.classes
            .binary_search_by(|c| c.as_str().cmp(value))
            .ok()
            .map(|i| ClassId(i as i32))
    }

    pub fn decode(&self, code: ClassId) -> Option<&str> {
        usize::try_from(code.0)
            .ok()
            .and_then(|i| self.classes.get(i))
            .map(String::as_str)
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

// =============================================================================
// StandardScaler
// =============================================================================

/// Per-column `(x - mean) / std`, with population std.
///
/// Constant columns get scale 1 so they map to 0 instead of NaN.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    mean: Vec<f64>,
    scale: Vec<f64>,
}

impl StandardScaler {
    pub fn fit(x: &FeatureMatrix) -> Self {
        let n = x.n_rows().max(1) as f64;
        let mut mean = vec![0.0; x.n_cols()];
        for row in x.rows() {
            for (m, v) in mean.iter_mut().zip(row) {
                *m += v / n;
            }
        }
        let mut var = vec![0.0; x.n_cols()];
        for row in x.rows() {
            for ((s, v), m) in var.iter_mut().zip(row).zip(&mean) {
                *s += (v - m) * (v - m) / n;
            }
        }
        let scale = var
            .into_iter()
            .map(|v| if v > 0.0 { v.sqrt() } else { 1.0 })
            .collect();
        Self { mean, scale }
    }

    pub fn transform(&self, x: &FeatureMatrix) -> Result<FeatureMatrix> {
        check_n_features(x, self.mean.len())?;
        let mut out = x.clone();
        for i in 0..out.n_rows() {
            for ((v, m), s) in out.row_mut(i).iter_mut().zip(&self.mean).zip(&self.scale) {
                *v = (*v - m) / s;
            }
        }
        Ok(out)
    }

    pub fn mean(&self) -> &[f64] {
        &self.mean
    }

    pub fn scale(&self) -> &[f64] {
        &self.scale
    }
}

// =============================================================================
// Preprocessor
// =============================================================================

/// Everything needed to turn raw records into model-ready features.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preprocessor {
    /// Matrix column order.
    feature_columns: Vec<String>,
    target_column: String,
    /// Encoders for categorical feature columns.
    encoders: BTreeMap<String, LabelEncoder>,
    scaler: StandardScaler,
    target_encoder: LabelEncoder,
}

impl Preprocessor {
    /// Fit encoders, the scaler and the target encoder on training records.
    ///
    /// A column is categorical if the crop schema says so or any of its
    /// non-empty cells is not a number.
    ///
    /// # Errors
    /// [`EnsembleError::InvalidInput`] if there are no records or a record has
    /// no target value.
    pub fn fit(records: &[Record], feature_columns: &[String], target: &str) -> Result<Self> {
        if records.is_empty() {
            return Err(EnsembleError::InvalidInput("no training records".into()));
        }

        let mut encoders = BTreeMap::new();
        for column in feature_columns {
            let cells = || {
                records
                    .iter()
                    .filter_map(|r| r.get(column))
                    .map(|v| v.trim())
                    .filter(|v| !v.is_empty())
            };
            let categorical =
                schema::is_categorical(column) || cells().any(|v| v.parse::<f64>().is_err());
            if categorical {
                encoders.insert(column.clone(), LabelEncoder::fit(cells()));
            }
        }

        let mut targets = Vec::with_capacity(records.len());
        for (i, record) in records.iter().enumerate() {
            match record.get(target).map(|v| v.trim()) {
                Some(v) if !v.is_empty() => targets.push(v),
                _ => {
                    return Err(EnsembleError::InvalidInput(format!(
                        "record {i} has no `{target}` value"
                    )));
                }
            }
        }

        let mut preprocessor = Self {
            feature_columns: feature_columns.to_vec(),
            target_column: target.to_string(),
            encoders,
            scaler: StandardScaler::default(),
            target_encoder: LabelEncoder::fit(targets),
        };
        let raw = preprocessor.encode(records)?;
        preprocessor.scaler = StandardScaler::fit(&raw);
        debug!(
            columns = preprocessor.feature_columns.len(),
            categorical = preprocessor.encoders.len(),
            classes = preprocessor.target_encoder.len(),
            "preprocessor fitted"
        );
        Ok(preprocessor)
    }

    /// Encoded, unscaled feature matrix.
    ///
    /// Missing cells, non-finite numbers (`NaN`, `inf`) and unknown
    /// categories become 0.
    fn encode(&self, records: &[Record]) -> Result<FeatureMatrix> {
        let mut data = Vec::with_capacity(records.len() * self.feature_columns.len());
        for (i, record) in records.iter().enumerate() {
            for column in &self.feature_columns {
                let cell = record.get(column).map(|v| v.trim()).unwrap_or("");
                let value = match self.encoders.get(column) {
                    Some(encoder) => encoder.encode(cell).map_or(0.0, |c| c.0 as f64),
                    None if cell.is_empty() => 0.0,
                    None => match cell.parse::<f64>() {
                        Ok(v) if v.is_finite() => v,
                        Ok(_) => 0.0,
                        Err(_) => {
                            return Err(EnsembleError::InvalidInput(format!(
                                "record {i}: `{column}` is not a number: {cell:?}"
                            )));
                        }
                    },
                };
                data.push(value);
            }
        }
        Ok(FeatureMatrix::new(self.feature_columns.len(), data)?)
    }

    /// Encode and scale records into the fitted column order.
    pub fn transform(&self, records: &[Record]) -> Result<FeatureMatrix> {
        self.scaler.transform(&self.encode(records)?)
    }

    /// Target codes for training records.
    pub fn encode_targets(&self, records: &[Record]) -> Result<Vec<ClassId>> {
        records
            .iter()
            .enumerate()
            .map(|(i, r)| {
                r.get(&self.target_column)
                    .and_then(|v| self.target_encoder.encode(v.trim()))
                    .ok_or_else(|| {
                        EnsembleError::InvalidInput(format!(
                            "record {i} has an unknown `{}` value",
                            self.target_column
                        ))
                    })
            })
            .collect()
    }

    /// Human-readable class name for a predicted code.
    pub fn decode_label(&self, code: ClassId) -> String {
        self.target_encoder
            .decode(code)
            .map_or_else(|| code.to_string(), str::to_string)
    }

    pub fn feature_columns(&self) -> &[String] {
        &self.feature_columns
    }

    pub fn target_column(&self) -> &str {
        &self.target_column
    }

    pub fn target_encoder(&self) -> &LabelEncoder {
        &self.target_encoder
    }

    pub fn is_categorical(&self, column: &str) -> bool {
        self.encoders.contains_key(column)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|e| EnsembleError::io(path, e))?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(|e| EnsembleError::io(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pairs: &[(&str, &str)]) -> Record {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn training_records() -> Vec<Record> {
        vec![
            record(&[("Season", "Kharif"), ("Area", "10"), ("Crop Name", "rice")]),
            record(&[("Season", "Rabi"), ("Area", "20"), ("Crop Name", "wheat")]),
            record(&[("Season", "Kharif"), ("Area", "30"), ("Crop Name", "rice")]),
        ]
    }

    fn columns() -> Vec<String> {
        vec!["Season".to_string(), "Area".to_string()]
    }

    #[test]
    fn test_label_encoder_sorted_codes() {
        let enc = LabelEncoder::fit(["wheat", "rice", "maize", "rice"]);
        assert_eq!(enc.classes(), &["maize", "rice", "wheat"]);
        assert_eq!(enc.encode("rice"), Some(ClassId(1)));
        assert_eq!(enc.encode("barley"), None);
        assert_eq!(enc.decode(ClassId(2)), Some("wheat"));
        assert_eq!(enc.decode(ClassId(-1)), None);
    }

    #[test]
    fn test_scaler_population_std() {
        let x = FeatureMatrix::from_rows(&[[1.0, 5.0], [3.0, 5.0]]).unwrap();
        let scaler = StandardScaler::fit(&x);
        assert_eq!(scaler.mean(), &[2.0, 5.0]);
        assert_eq!(scaler.scale(), &[1.0, 1.0]);
        let out = scaler.transform(&x).unwrap();
        assert_eq!(out.to_rows(), vec![vec![-1.0, 0.0], vec![1.0, 0.0]]);
    }

    #[test]
    fn test_fit_and_transform() {
        let pre = Preprocessor::fit(&training_records(), &columns(), "Crop Name").unwrap();
        assert!(pre.is_categorical("Season"));
        assert!(!pre.is_categorical("Area"));

        let x = pre.transform(&training_records()).unwrap();
        assert_eq!(x.n_cols(), 2);
        // Area mean 20, population std sqrt(200/3)
        let std = (200.0f64 / 3.0).sqrt();
        assert!((x.row(0)[1] + 10.0 / std).abs() < 1e-12);

        let y = pre.encode_targets(&training_records()).unwrap();
        assert_eq!(y, vec![ClassId(0), ClassId(1), ClassId(0)]);
        assert_eq!(pre.decode_label(ClassId(1)), "wheat");
        assert_eq!(pre.decode_label(ClassId(9)), "Class(9)");
    }

    #[test]
    fn test_missing_and_unknown_cells_encode_as_zero() {
        let pre = Preprocessor::fit(&training_records(), &columns(), "Crop Name").unwrap();
        let raw = pre
            .encode(&[record(&[("Season", "Zaid")]), record(&[])])
            .unwrap();
        assert_eq!(raw.to_rows(), vec![vec![0.0, 0.0], vec![0.0, 0.0]]);
    }

    #[test]
    fn test_non_finite_cells_treated_as_missing() {
        let records = vec![
            record(&[("Area", "10"), ("Crop Name", "rice")]),
            record(&[("Area", "NaN"), ("Crop Name", "wheat")]),
            record(&[("Area", "30"), ("Crop Name", "rice")]),
            record(&[("Area", "-inf"), ("Crop Name", "wheat")]),
        ];
        let area = vec!["Area".to_string()];
        let pre = Preprocessor::fit(&records, &area, "Crop Name").unwrap();
        assert!(!pre.is_categorical("Area"));
        assert!(pre.scaler.mean().iter().all(|m| m.is_finite()));
        assert!(pre.scaler.scale().iter().all(|s| s.is_finite()));

        let clean = pre.transform(&[record(&[("Area", "10")])]).unwrap();
        assert!(clean.row(0)[0].is_finite());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PREPROCESSOR_FILE);
        pre.save(&path).unwrap();
        let back = Preprocessor::load(&path).unwrap();
        assert_eq!(back.transform(&records).unwrap(), pre.transform(&records).unwrap());
    }

    #[test]
    fn test_bad_number_is_invalid_input() {
        let pre = Preprocessor::fit(&training_records(), &columns(), "Crop Name").unwrap();
        let err = pre
            .transform(&[record(&[("Season", "Rabi"), ("Area", "lots")])])
            .unwrap_err();
        assert!(matches!(err, EnsembleError::InvalidInput(_)));
    }

    #[test]
    fn test_missing_target_rejected() {
        let mut records = training_records();
        records[1].remove("Crop Name");
        let err = Preprocessor::fit(&records, &columns(), "Crop Name").unwrap_err();
        assert!(err.to_string().contains("record 1"));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PREPROCESSOR_FILE);
        let pre = Preprocessor::fit(&training_records(), &columns(), "Crop Name").unwrap();
        pre.save(&path).unwrap();

        let back = Preprocessor::load(&path).unwrap();
        assert_eq!(back.feature_columns(), pre.feature_columns());
        assert_eq!(
            back.transform(&training_records()).unwrap(),
            pre.transform(&training_records()).unwrap()
        );
    }
}
