use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::Parser;
use imprint::{
    BuiltinExtractor, EmbeddingProvider, ModelManager, OnnxImageEmbedder, RawImage, RetryPolicy, RuntimeConfig,
    TrainingConfig, Workspace,
};
use log::{info, warn};

#[derive(Parser)]
#[command(author, version, about = "Train an image classifier from example folders", long_about = None)]
struct Args {
    /// A class and the folder holding its examples, as NAME=DIR
    #[arg(short, long = "class", value_name = "NAME=DIR", value_parser = parse_class, required = true)]
    classes: Vec<(String, PathBuf)>,

    /// Images to classify once training is done
    #[arg(short, long, value_name = "IMAGE")]
    predict: Vec<PathBuf>,

    /// Write the trained model to this file
    #[arg(short, long, value_name = "PATH")]
    export: Option<PathBuf>,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    /// Fraction of samples held out for validation
    #[arg(long)]
    validation_split: Option<f32>,

    #[arg(long)]
    learning_rate: Option<f32>,

    /// Use a local ONNX feature extractor instead of downloading MobileNet v2
    #[arg(short, long, value_name = "PATH")]
    model: Option<PathBuf>,

    /// Force a fresh download of the extractor
    #[arg(short, long)]
    fresh: bool,
}

fn parse_class(value: &str) -> Result<(String, PathBuf), String> {
    match value.split_once('=') {
        Some((name, dir)) if !dir.is_empty() => Ok((name.to_string(), PathBuf::from(dir))),
        _ => Err(format!("expected NAME=DIR, got '{}'", value)),
    }
}

impl Args {
    fn training_config(&self) -> TrainingConfig {
        let mut config = TrainingConfig::default();
        if let Some(epochs) = self.epochs {
            config = config.with_epochs(epochs);
        }
        if let Some(batch_size) = self.batch_size {
            config = config.with_batch_size(batch_size);
        }
        if let Some(split) = self.validation_split {
            config = config.with_validation_split(split);
        }
        if let Some(rate) = self.learning_rate {
            config = config.with_learning_rate(rate);
        }
        config
    }
}

async fn load_extractor(args: &Args) -> Result<Arc<dyn EmbeddingProvider>> {
    let runtime = RuntimeConfig::default();
    let extractor = BuiltinExtractor::MobileNetV2;
    if let Some(path) = &args.model {
        info!("Loading extractor from {}", path.display());
        let embedder = OnnxImageEmbedder::from_file(path, extractor.characteristics(), &runtime)?;
        return Ok(Arc::new(embedder));
    }

    let manager = ModelManager::new_default()?;
    let model_info = extractor.get_model_info();
    if args.fresh {
        info!("Fresh download requested - removing any existing model files...");
        manager.remove_download(&model_info)?;
    }
    manager
        .ensure_model_downloaded_with_retry(&model_info, &RetryPolicy::default())
        .await
        .context("Failed to fetch the feature extractor")?;
    Ok(Arc::new(OnnxImageEmbedder::from_builtin(extractor, &manager, &runtime)?))
}

fn read_images(dir: &Path) -> Result<Vec<RawImage>> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("Cannot read {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file())
        .collect();
    paths.sort();

    let mut images = Vec::with_capacity(paths.len());
    for path in paths {
        match RawImage::from_path(&path) {
            Ok(image) => images.push(image),
            Err(e) => warn!("Skipping {}: {}", path.display(), e),
        }
    }
    Ok(images)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    info!("=== Starting Image Classifier ===");
    let start_time = Instant::now();
    let provider = load_extractor(&args).await?;
    let workspace = Workspace::with_store(
        imprint::SampleStore::with_class_names(provider, args.classes.iter().map(|(name, _)| name.clone()))?,
        imprint::Trainer::default(),
    )
    .with_training_config(args.training_config());

    let ids: Vec<_> = workspace.statistics().store.per_class.iter().map(|c| c.id).collect();
    for (id, (name, dir)) in ids.into_iter().zip(&args.classes) {
        let report = workspace.add_samples(id, read_images(dir)?)?;
        println!(
            "{}: {} images added, {} skipped, {} failed",
            name,
            report.added,
            report.skipped,
            report.failed.len()
        );
    }

    let stats = workspace.statistics();
    info!("Total classes: {}, total images: {}", stats.store.classes, stats.store.samples);
    if !workspace.ready_for_training() {
        bail!("At least two classes need example images");
    }

    let train_start = Instant::now();
    let report = workspace.train(|progress| {
        match progress.val_accuracy {
            Some(val) => info!(
                "Epoch {}/{}: accuracy {:.1}%, validation {:.1}%",
                progress.epoch,
                progress.epochs,
                progress.accuracy * 100.0,
                val * 100.0
            ),
            None => info!(
                "Epoch {}/{}: accuracy {:.1}%",
                progress.epoch,
                progress.epochs,
                progress.accuracy * 100.0
            ),
        }
        Ok(())
    })?;
    println!(
        "Trained in {:.2?}: accuracy {:.1}%, loss {:.4}",
        train_start.elapsed(),
        report.accuracy * 100.0,
        report.loss
    );

    for path in &args.predict {
        let image = RawImage::from_path(path).with_context(|| format!("Cannot read {}", path.display()))?;
        let ranked = workspace.predict(&image)?;
        println!("\n{}:", path.display());
        for prediction in ranked {
            println!("    {}: {:.1}%", prediction.class_name, prediction.confidence * 100.0);
        }
    }

    if let Some(path) = &args.export {
        workspace.export_to_path(path)?;
        println!("Model exported to {}", path.display());
    }

    info!("=== Done (took {:.2?}) ===", start_time.elapsed());
    Ok(())
}
