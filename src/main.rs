//! crop-advisor - Crop recommendation from field data
//!
//! Trains a bundle of three classifiers on a crop dataset and serves
//! recommendations from it:
//!
//! ```text
//! CSV ──► Dataset::prepare ──► Preprocessor ──► FeatureMatrix
//!                                                   │
//!                         ┌─────────────────────────┼──────────────────────┐
//!                         ▼                         ▼                      ▼
//!                  RandomForest             CascadeAggregator   HierarchicalAggregator
//!                 (standard.json)            (cascade.json)      (hierarchical.json)
//! ```
//!
//! `predict` loads every model in the bundle through the registry and prints
//! one JSON line per input row.

mod config;
mod dataset;

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, ensure};
use clap::{Parser, Subcommand};
use ensemble::{
    CascadeAggregator, CascadeBuilder, ForestTrainer, HierarchicalAggregator, HierarchicalBuilder,
    MlModel, ModelRegistry, PREPROCESSOR_FILE, Partitioner, Preprocessor, Trainer, accuracy, top_k,
};
use serde::Serialize;
use tracing::{info, warn};

pub use config::AdvisorConfig;
use dataset::Dataset;

/// Model file names inside a bundle directory.
const STANDARD_FILE: &str = "standard.json";
const CASCADE_FILE: &str = "cascade.json";
const HIERARCHICAL_FILE: &str = "hierarchical.json";

/// Name shared by the bundle's ensemble models.
const BUNDLE_MODEL_NAME: &str = "crop";

/// Feature importances shown per model by `inspect`.
const TOP_IMPORTANCES: usize = 5;

#[derive(Parser)]
#[command(name = "crop-advisor")]
#[command(about = "Crop recommendation with cascade and hierarchical random-forest ensembles")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train the model bundle from a labelled CSV dataset
    Train {
        /// Training data with a header row
        #[arg(short, long, value_name = "CSV")]
        data: PathBuf,

        /// Column holding the crop name
        #[arg(short, long, default_value = types::schema::TARGET_COLUMN)]
        target: String,

        /// Output bundle directory
        #[arg(short, long, env = "CROP_MODELS_DIR", default_value = "models")]
        out: PathBuf,

        /// Seed for every model
        #[arg(long, env = "CROP_SEED", default_value_t = 42)]
        seed: u64,
    },
    /// Recommend crops for each row of a CSV file
    Predict {
        /// Bundle directory
        #[arg(short, long, env = "CROP_MODELS_DIR", default_value = "models")]
        models: PathBuf,

        /// Rows to score (dataset columns or telemetry fields)
        #[arg(short, long, value_name = "CSV")]
        input: PathBuf,

        /// Crops reported per model (best plus alternatives)
        #[arg(short = 'k', long, env = "CROP_TOP_K", default_value_t = 3)]
        top_k: usize,

        /// Score the bundle's models in parallel
        #[arg(long, env = "CROP_PARALLEL")]
        parallel: bool,
    },
    /// Show the structure of a model bundle
    Inspect {
        /// Bundle directory
        #[arg(short, long, env = "CROP_MODELS_DIR", default_value = "models")]
        models: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train {
            data,
            target,
            out,
            seed,
        } => {
            let config = AdvisorConfig::new()
                .models_dir(out)
                .target_column(target)
                .random_state(seed);
            train(&data, &config)
        }
        Commands::Predict {
            models,
            input,
            top_k,
            parallel,
        } => {
            let config = AdvisorConfig::new()
                .models_dir(models)
                .top_k(top_k)
                .parallel(parallel);
            predict(&input, &config)
        }
        Commands::Inspect { models } => inspect(&AdvisorConfig::new().models_dir(models)),
    }
}

// =============================================================================
// Train
// =============================================================================

fn train(data: &Path, config: &AdvisorConfig) -> anyhow::Result<()> {
    info!("Loading training data: {}", data.display());
    let mut dataset = Dataset::from_csv(data)?;
    ensure!(!dataset.is_empty(), "{} has no rows", data.display());
    info!("Loaded {} rows", dataset.len());
    ensure!(
        dataset.columns.contains(&config.target_column),
        "{} has no `{}` column",
        data.display(),
        config.target_column
    );
    dataset.prepare(config);

    let columns = dataset.feature_columns(&config.target_column);
    let preprocessor = Preprocessor::fit(&dataset.records, &columns, &config.target_column)?;
    let x = preprocessor.transform(&dataset.records)?;
    let y = preprocessor.encode_targets(&dataset.records)?;
    info!(
        "Prepared {} rows x {} features, {} crops",
        x.n_rows(),
        x.n_cols(),
        preprocessor.target_encoder().len()
    );

    info!("Training standard forest");
    let standard =
        ForestTrainer::new(config.standard_forest()).train(&x, &y, config.random_state)?;
    report_accuracy(&standard, &x, &y)?;

    info!("Training cascade");
    let cascade = CascadeBuilder::new(config.cascade())
        .model_name(BUNDLE_MODEL_NAME)
        .fit(&x, &y)?;
    report_accuracy(&cascade, &x, &y)?;

    info!("Training hierarchical forest");
    let hierarchical = HierarchicalBuilder::new(config.hierarchical())
        .model_name(BUNDLE_MODEL_NAME)
        .fit(&x, &y)?;
    report_accuracy(&hierarchical, &x, &y)?;

    let out = &config.models_dir;
    std::fs::create_dir_all(out).with_context(|| format!("failed to create {}", out.display()))?;
    standard.save(out.join(STANDARD_FILE))?;
    cascade.save(out.join(CASCADE_FILE))?;
    hierarchical.save(out.join(HIERARCHICAL_FILE))?;
    preprocessor.save(out.join(PREPROCESSOR_FILE))?;
    info!("Bundle written to {}", out.display());
    Ok(())
}

fn report_accuracy(
    model: &dyn MlModel,
    x: &types::FeatureMatrix,
    y: &[types::ClassId],
) -> anyhow::Result<()> {
    let predicted = model.predict(x)?;
    info!(
        model = model.name(),
        "training accuracy {:.4}",
        accuracy(&predicted, y)
    );
    Ok(())
}

// =============================================================================
// Predict
// =============================================================================

#[derive(Debug, Serialize)]
struct CropScore {
    crop: String,
    confidence: f64,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum ModelOutput {
    Recommendation {
        crop: String,
        confidence: f64,
        alternatives: Vec<CropScore>,
    },
    Failed {
        error: String,
    },
}

#[derive(Debug, Serialize)]
struct RowOutput {
    row: usize,
    predictions: BTreeMap<String, ModelOutput>,
}

fn predict(input: &Path, config: &AdvisorConfig) -> anyhow::Result<()> {
    let dir = &config.models_dir;
    let preprocessor = Preprocessor::load(dir.join(PREPROCESSOR_FILE))?;
    let registry = ModelRegistry::from_dir(dir)?.with_parallel(config.parallel);
    ensure!(!registry.is_empty(), "no models in {}", dir.display());

    let mut dataset = Dataset::from_csv(input)?;
    dataset.prepare(config);
    let x = preprocessor.transform(&dataset.records)?;

    let mut rows: Vec<RowOutput> = (0..x.n_rows())
        .map(|row| RowOutput {
            row,
            predictions: BTreeMap::new(),
        })
        .collect();

    for (name, result) in registry.predict_all(&x) {
        let proba = match result {
            Ok(proba) => proba,
            Err(e) => {
                warn!(model = %name, "prediction failed: {e}");
                for row in &mut rows {
                    row.predictions.insert(
                        name.clone(),
                        ModelOutput::Failed {
                            error: e.to_string(),
                        },
                    );
                }
                continue;
            }
        };
        let Some(model) = registry.get(&name) else {
            continue;
        };
        for (row, probs) in rows.iter_mut().zip(proba.rows()) {
            let mut ranked = top_k(probs, model.classes(), config.top_k)
                .into_iter()
                .map(|(class, confidence)| CropScore {
                    crop: preprocessor.decode_label(class),
                    confidence,
                });
            if let Some(best) = ranked.next() {
                row.predictions.insert(
                    name.clone(),
                    ModelOutput::Recommendation {
                        crop: best.crop,
                        confidence: best.confidence,
                        alternatives: ranked.collect(),
                    },
                );
            }
        }
    }

    let mut stdout = std::io::stdout().lock();
    for row in &rows {
        serde_json::to_writer(&mut stdout, row)?;
        writeln!(stdout)?;
    }
    Ok(())
}

// =============================================================================
// Inspect
// =============================================================================

fn inspect(config: &AdvisorConfig) -> anyhow::Result<()> {
    let dir = &config.models_dir;
    let preprocessor_path = dir.join(PREPROCESSOR_FILE);
    let preprocessor = if preprocessor_path.exists() {
        Some(Preprocessor::load(&preprocessor_path)?)
    } else {
        None
    };
    let registry = ModelRegistry::from_dir(dir)?;

    println!("Bundle: {}", dir.display());
    if let Some(p) = &preprocessor {
        println!("  target column: {}", p.target_column());
        println!("  features ({}): {}", p.feature_columns().len(), p.feature_columns().join(", "));
    }

    for (name, model) in registry.models() {
        println!("\n{name}");
        println!("  n_features: {}", model.n_features());
        let classes: Vec<String> = model
            .classes()
            .iter()
            .map(|&c| match &preprocessor {
                Some(p) => p.decode_label(c),
                None => c.to_string(),
            })
            .collect();
        println!("  classes ({}): {}", classes.len(), classes.join(", "));
        if let Some(importances) = model.feature_importances() {
            let feature_names = preprocessor.as_ref().map(|p| p.feature_columns());
            println!("  top features:");
            for (feature, importance) in top_features(&importances, feature_names) {
                println!("    {feature:<28} {importance:.4}");
            }
        }
    }

    let cascade_path = dir.join(CASCADE_FILE);
    if cascade_path.exists() {
        let cascade: CascadeAggregator = CascadeAggregator::from_json(&cascade_path)?;
        let weights: Vec<String> = cascade
            .layer_weights()
            .iter()
            .map(|w| format!("{w:.4}"))
            .collect();
        println!(
            "\n{}: {} layers, weights [{}]",
            cascade.name(),
            cascade.n_layers(),
            weights.join(", ")
        );
    }

    let hierarchical_path = dir.join(HIERARCHICAL_FILE);
    if hierarchical_path.exists() {
        let hierarchical: HierarchicalAggregator =
            HierarchicalAggregator::from_json(&hierarchical_path)?;
        let n_clusters = hierarchical.partitioner().n_clusters();
        let local = hierarchical.cluster_ids();
        let global_only: Vec<usize> = (0..n_clusters)
            .filter(|c| !hierarchical.has_local_model(*c))
            .collect();
        println!(
            "\n{}: {} clusters, local models {:?}, global only {:?}",
            hierarchical.name(),
            n_clusters,
            local,
            global_only
        );
    }
    Ok(())
}

/// The most important features, highest first.
fn top_features(importances: &[f64], names: Option<&[String]>) -> Vec<(String, f64)> {
    let mut ranked: Vec<(String, f64)> = importances
        .iter()
        .enumerate()
        .map(|(i, &v)| {
            let name = names
                .and_then(|n| n.get(i))
                .cloned()
                .unwrap_or_else(|| format!("feature_{i}"));
            (name, v)
        })
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    ranked.truncate(TOP_IMPORTANCES);
    ranked
}
