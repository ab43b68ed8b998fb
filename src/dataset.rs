//! CSV datasets and the raw-record feature pipeline.
//!
//! Rows are read as string records so the preprocessor can decide which
//! columns are categorical. Live telemetry rows (`temperature`, `humidity`,
//! `soilMoisture`) are mapped onto the crop schema, and the derived columns
//! are computed wherever their inputs exist.

use std::path::Path;

use anyhow::{Context, Result};
use ensemble::Record;
use types::schema::{self, derived};

use crate::config::AdvisorConfig;

/// Records read from a CSV file, plus the column names they carry.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    /// Header columns followed by any columns added while preparing rows.
    pub columns: Vec<String>,
    pub records: Vec<Record>,
}

impl Dataset {
    /// Read a CSV file with a header row. Cells are trimmed.
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        Self::from_reader(reader).with_context(|| format!("failed to read {}", path.display()))
    }

    fn from_reader<R: std::io::Read>(mut reader: csv::Reader<R>) -> Result<Self> {
        let columns: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        let mut records = Vec::new();
        for row in reader.records() {
            let row = row?;
            records.push(
                columns
                    .iter()
                    .cloned()
                    .zip(row.iter().map(str::to_string))
                    .collect(),
            );
        }
        Ok(Self { columns, records })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Map telemetry fields and compute derived features on every row.
    pub fn prepare(&mut self, config: &AdvisorConfig) {
        for record in &mut self.records {
            map_telemetry(record, config);
            add_derived_features(record);
        }
        for (_, column) in schema::TELEMETRY_COLUMNS {
            self.add_column(column);
        }
        for column in [
            derived::TEMP_RANGE,
            derived::HUMIDITY_RANGE,
            derived::TEMP_HUMIDITY_INDEX,
        ] {
            self.add_column(column);
        }
    }

    fn add_column(&mut self, column: &str) {
        if !self.columns.iter().any(|c| c == column)
            && self.records.iter().any(|r| r.contains_key(column))
        {
            self.columns.push(column.to_string());
        }
    }

    /// Feature columns for training.
    ///
    /// The crop schema columns present in the data, in schema order. Data
    /// that shares no column with the schema uses every non-target column in
    /// header order instead.
    pub fn feature_columns(&self, target: &str) -> Vec<String> {
        let known: Vec<String> = schema::FEATURE_COLUMNS
            .iter()
            .filter(|c| self.columns.iter().any(|h| h == *c))
            .map(|c| c.to_string())
            .collect();
        if !known.is_empty() {
            return known;
        }
        self.columns
            .iter()
            .filter(|c| *c != target && !is_telemetry_field(c))
            .cloned()
            .collect()
    }
}

fn is_telemetry_field(column: &str) -> bool {
    schema::TELEMETRY_COLUMNS.iter().any(|(f, _)| *f == column)
}

/// Copy telemetry fields onto their schema columns.
///
/// Only rows carrying at least one telemetry field are touched; the fields
/// they lack take the configured defaults. A schema column the row already
/// fills keeps its own value.
pub fn map_telemetry(record: &mut Record, config: &AdvisorConfig) {
    if !schema::TELEMETRY_COLUMNS
        .iter()
        .any(|(field, _)| record.contains_key(*field))
    {
        return;
    }
    let defaults = [
        config.default_temperature,
        config.default_humidity,
        config.default_soil_moisture,
    ];
    for ((field, column), default) in schema::TELEMETRY_COLUMNS.iter().zip(defaults) {
        let reading = record.remove(*field);
        if record.get(*column).is_some_and(|v| !v.trim().is_empty()) {
            continue;
        }
        let value = match reading {
            Some(v) if !v.trim().is_empty() => v,
            _ => default.to_string(),
        };
        record.insert(column.to_string(), value);
    }
}

/// Compute derived columns whose inputs parse as numbers. Existing values
/// are overwritten.
pub fn add_derived_features(record: &mut Record) {
    let num = |r: &Record, column: &str| r.get(column).and_then(|v| v.trim().parse::<f64>().ok());

    if let (Some(max), Some(min)) = (num(record, "Max Temp"), num(record, "Min Temp")) {
        record.insert(derived::TEMP_RANGE.to_string(), (max - min).to_string());
    }
    if let (Some(max), Some(min)) = (
        num(record, "Max Relative Humidity"),
        num(record, "Min Relative Humidity"),
    ) {
        record.insert(derived::HUMIDITY_RANGE.to_string(), (max - min).to_string());
    }
    if let (Some(temp), Some(humidity)) = (num(record, "Avg Temp"), num(record, "Avg Humidity")) {
        record.insert(
            derived::TEMP_HUMIDITY_INDEX.to_string(),
            (temp * humidity / 100.0).to_string(),
        );
    }
}
