//! Crop dataset schema shared by training and inference.
//!
//! The feature order here is the default column order of the model bundle.
//! A bundle records its own order at fit time; callers must build feature
//! matrices in that recorded order, never in an ad-hoc one.

/// Target column holding the crop name.
pub const TARGET_COLUMN: &str = "Crop Name";

/// Default feature columns, in matrix column order.
pub const FEATURE_COLUMNS: &[&str] = &[
    "District",
    "Season",
    "Area",
    "AP Ratio",
    "Production",
    "Total Rainfall",
    "pH Level",
    "Max Temp",
    "Min Temp",
    "Avg Temp",
    "Max Relative Humidity",
    "Min Relative Humidity",
    "Avg Humidity",
    "Soil Moisture",
    "Transplant",
    "Growth",
    "Harvest",
    "Temp_Range",
    "Humidity_Range",
    "Temp_Humidity_Index",
];

/// Number of default feature columns.
pub const N_FEATURES: usize = 20;

/// Columns holding category strings rather than numbers.
pub const CATEGORICAL_COLUMNS: &[&str] = &["District", "Season"];

/// Telemetry field → feature column, for live sensor readings.
pub const TELEMETRY_COLUMNS: &[(&str, &str)] = &[
    ("temperature", "Avg Temp"),
    ("humidity", "Avg Humidity"),
    ("soilMoisture", "Soil Moisture"),
];

/// Derived column names.
pub mod derived {
    /// `Max Temp - Min Temp`.
    pub const TEMP_RANGE: &str = "Temp_Range";
    /// `Max Relative Humidity - Min Relative Humidity`.
    pub const HUMIDITY_RANGE: &str = "Humidity_Range";
    /// `Avg Temp * Avg Humidity / 100`.
    pub const TEMP_HUMIDITY_INDEX: &str = "Temp_Humidity_Index";
}

/// Whether a column is categorical in the default schema.
pub fn is_categorical(column: &str) -> bool {
    CATEGORICAL_COLUMNS.contains(&column)
}
