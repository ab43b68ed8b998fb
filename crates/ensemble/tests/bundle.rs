//! Integration tests for model bundles on disk.
//!
//! A bundle is a directory of model JSON files plus `preprocessor.json`; the
//! registry must load it back into models that predict exactly like the ones
//! that were saved.

use ensemble::{
    CascadeAggregator, CascadeBuilder, CascadeConfig, ForestConfig, ForestTrainer,
    HierarchicalAggregator, HierarchicalBuilder, HierarchicalConfig, MlModel, ModelRegistry,
    PREPROCESSOR_FILE, Preprocessor, RandomForest, Record, Trainer, load_model_file, recommend,
};
use types::{ClassId, FeatureMatrix};

fn blobs() -> (FeatureMatrix, Vec<ClassId>) {
    let mut rows = Vec::new();
    let mut y = Vec::new();
    for (c, center) in [-4.0, 0.0, 4.0].into_iter().enumerate() {
        for i in 0..25 {
            let jitter = (i % 5) as f64 * 0.3 - 0.6;
            rows.push([center + jitter, (i / 5) as f64]);
            y.push(ClassId(c as i32));
        }
    }
    (FeatureMatrix::from_rows(&rows).unwrap(), y)
}

fn forest(x: &FeatureMatrix, y: &[ClassId]) -> RandomForest {
    ForestTrainer::new(
        ForestConfig::default()
            .model_name("standard")
            .n_estimators(10)
            .max_depth(8),
    )
    .train(x, y, 42)
    .unwrap()
}

#[test]
fn test_saved_bundle_predicts_identically() {
    let (x, y) = blobs();
    let dir = tempfile::tempdir().unwrap();

    let standard = forest(&x, &y);
    let cascade = CascadeBuilder::new(CascadeConfig::default().n_estimators_per_layer(6))
        .model_name("crop")
        .fit(&x, &y)
        .unwrap();
    let hierarchical = HierarchicalBuilder::new(
        HierarchicalConfig::default()
            .n_estimators_global(6)
            .n_estimators_local(4),
    )
    .model_name("crop")
    .fit(&x, &y)
    .unwrap();

    standard.save(dir.path().join("standard.json")).unwrap();
    cascade.save(dir.path().join("cascade.json")).unwrap();
    hierarchical.save(dir.path().join("hierarchical.json")).unwrap();

    let registry = ModelRegistry::from_dir(dir.path()).unwrap();
    assert_eq!(
        registry.model_names(),
        vec![
            "CascadeRandomForest_crop",
            "HierarchicalRandomForest_crop",
            "RandomForest_standard"
        ]
    );

    let originals: [&dyn MlModel; 3] = [&cascade, &hierarchical, &standard];
    for (original, (name, loaded)) in originals.iter().zip(registry.predict_all(&x)) {
        assert_eq!(original.name(), name);
        assert_eq!(loaded.unwrap(), original.predict_proba(&x).unwrap());
    }
}

#[test]
fn test_typed_loaders_keep_structure() {
    let (x, y) = blobs();
    let dir = tempfile::tempdir().unwrap();

    let cascade = CascadeBuilder::new(CascadeConfig::default().n_estimators_per_layer(4))
        .fit(&x, &y)
        .unwrap();
    let path = dir.path().join("cascade.json");
    cascade.save(&path).unwrap();
    let back = CascadeAggregator::from_json(&path).unwrap();
    assert_eq!(back.n_layers(), cascade.n_layers());
    assert_eq!(back.layer_weights(), cascade.layer_weights());
    assert_eq!(back.feature_importances(), cascade.feature_importances());

    let hierarchical = HierarchicalBuilder::new(
        HierarchicalConfig::default()
            .n_estimators_global(4)
            .n_estimators_local(3),
    )
    .fit(&x, &y)
    .unwrap();
    let path = dir.path().join("hierarchical.json");
    hierarchical.save(&path).unwrap();
    let back = HierarchicalAggregator::from_json(&path).unwrap();
    assert_eq!(back.cluster_ids(), hierarchical.cluster_ids());
    assert_eq!(back.partitioner(), hierarchical.partitioner());
}

#[test]
fn test_registry_skips_preprocessor_file() {
    let (x, y) = blobs();
    let dir = tempfile::tempdir().unwrap();
    forest(&x, &y).save(dir.path().join("standard.json")).unwrap();

    let records: Vec<Record> = (0..4)
        .map(|i| {
            Record::from([
                ("Area".to_string(), i.to_string()),
                ("Crop Name".to_string(), format!("crop{}", i % 2)),
            ])
        })
        .collect();
    Preprocessor::fit(&records, &["Area".to_string()], "Crop Name")
        .unwrap()
        .save(dir.path().join(PREPROCESSOR_FILE))
        .unwrap();
    std::fs::write(dir.path().join("notes.txt"), "not a model").unwrap();

    let registry = ModelRegistry::from_dir(dir.path()).unwrap();
    assert_eq!(registry.model_names(), vec!["RandomForest_standard"]);
}

#[test]
fn test_missing_file_reports_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.json");
    let err = load_model_file(&path).err().unwrap();
    assert!(err.to_string().contains("absent.json"));
}

#[test]
fn test_recommend_ranks_alternatives() {
    let (x, y) = blobs();
    let model = forest(&x, &y);
    let recs = recommend(&model, &x, 3).unwrap();
    assert_eq!(recs.len(), x.n_rows());
    for rec in &recs {
        assert!(rec.alternatives.len() <= 2);
        assert!(rec.alternatives.iter().all(|(_, p)| *p <= rec.confidence));
    }
    assert_eq!(
        recs.iter().map(|r| r.class).collect::<Vec<_>>(),
        model.predict(&x).unwrap()
    );
}
