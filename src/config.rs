//! Central configuration for the crop advisor.
//!
//! Training hyperparameters and serving defaults are defined here for easy
//! tuning; CLI flags override a subset of them.

use std::path::PathBuf;

use ensemble::{CascadeConfig, ForestConfig, HierarchicalConfig};
use types::schema;

/// Master configuration for training and prediction.
#[derive(Debug, Clone)]
pub struct AdvisorConfig {
    // ─────────────────────────────────────────────────────────────────────────
    // Bundle & Serving
    // ─────────────────────────────────────────────────────────────────────────
    /// Directory holding model files and the preprocessor.
    pub models_dir: PathBuf,
    /// Column holding the crop name in training data.
    pub target_column: String,
    /// Crops reported per row (best plus alternatives).
    pub top_k: usize,
    /// Score registry models in parallel.
    pub parallel: bool,

    // ─────────────────────────────────────────────────────────────────────────
    // Training
    // ─────────────────────────────────────────────────────────────────────────
    /// Seed shared by every model.
    pub random_state: u64,
    /// Trees in the standard forest.
    pub standard_estimators: usize,
    /// Depth limit for every forest.
    pub max_depth: usize,
    pub cascade_layers: usize,
    pub cascade_estimators_per_layer: usize,
    pub hierarchical_clusters: usize,
    pub hierarchical_global_estimators: usize,
    pub hierarchical_local_estimators: usize,

    // ─────────────────────────────────────────────────────────────────────────
    // Telemetry Defaults
    // ─────────────────────────────────────────────────────────────────────────
    /// Used when a telemetry row lacks `temperature`.
    pub default_temperature: f64,
    /// Used when a telemetry row lacks `humidity`.
    pub default_humidity: f64,
    /// Used when a telemetry row lacks `soilMoisture`.
    pub default_soil_moisture: f64,
}

impl Default for AdvisorConfig {
    fn default() -> Self {
        Self {
            // Bundle & Serving
            models_dir: PathBuf::from("models"),
            target_column: schema::TARGET_COLUMN.to_string(),
            top_k: 3,
            parallel: false,

            // Training
            random_state: 42,
            standard_estimators: 100,
            max_depth: 15,
            cascade_layers: 3,
            cascade_estimators_per_layer: 50,
            hierarchical_clusters: 5,
            hierarchical_global_estimators: 80,
            hierarchical_local_estimators: 60,

            // Telemetry Defaults
            default_temperature: 25.0,
            default_humidity: 70.0,
            default_soil_moisture: 35.0,
        }
    }
}

impl AdvisorConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder-style setters for fluent configuration
    // ─────────────────────────────────────────────────────────────────────────

    pub fn models_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.models_dir = dir.into();
        self
    }

    pub fn target_column(mut self, column: impl Into<String>) -> Self {
        self.target_column = column.into();
        self
    }

    pub fn top_k(mut self, k: usize) -> Self {
        self.top_k = k.max(1);
        self
    }

    pub fn parallel(mut self, enabled: bool) -> Self {
        self.parallel = enabled;
        self
    }

    pub fn random_state(mut self, seed: u64) -> Self {
        self.random_state = seed;
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Model configs
    // ─────────────────────────────────────────────────────────────────────────

    pub fn standard_forest(&self) -> ForestConfig {
        ForestConfig::default()
            .model_name("standard")
            .n_estimators(self.standard_estimators)
            .max_depth(self.max_depth)
    }

    pub fn cascade(&self) -> CascadeConfig {
        CascadeConfig::default()
            .n_layers(self.cascade_layers)
            .n_estimators_per_layer(self.cascade_estimators_per_layer)
            .max_depth(self.max_depth)
            .random_state(self.random_state)
    }

    pub fn hierarchical(&self) -> HierarchicalConfig {
        HierarchicalConfig::default()
            .n_clusters(self.hierarchical_clusters)
            .n_estimators_global(self.hierarchical_global_estimators)
            .n_estimators_local(self.hierarchical_local_estimators)
            .max_depth(self.max_depth)
            .random_state(self.random_state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_bundle_recipe() {
        let config = AdvisorConfig::default();
        assert_eq!(config.target_column, "Crop Name");

        let cascade = config.cascade();
        assert_eq!(cascade.n_layers, 3);
        assert_eq!(cascade.n_estimators_per_layer, 50);
        assert_eq!(cascade.max_depth, 15);
        assert_eq!(cascade.min_residual_samples, 10);

        let hierarchical = config.hierarchical();
        assert_eq!(hierarchical.n_clusters, 5);
        assert_eq!(hierarchical.n_estimators_global, 80);
        assert_eq!(hierarchical.n_estimators_local, 60);
        assert_eq!(hierarchical.max_depth, 15);

        let standard = config.standard_forest();
        assert_eq!(standard.n_estimators, 100);
        assert_eq!(standard.max_depth, Some(15));
    }

    #[test]
    fn test_builder_setters() {
        let config = AdvisorConfig::new()
            .models_dir("bundle")
            .top_k(0)
            .random_state(7);
        assert_eq!(config.models_dir, PathBuf::from("bundle"));
        assert_eq!(config.top_k, 1);
        assert_eq!(config.cascade().random_state, 7);
        assert_eq!(config.hierarchical().random_state, 7);
    }
}
