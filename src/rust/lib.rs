//! Interactive image classification: collect example images per class, embed
//! them with a pretrained feature extractor and train a small head on the
//! embeddings.
//!
//! # Basic Usage
//!
//! ```rust
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use std::sync::Arc;
//! use imprint::{Embedding, EmbeddingError, EmbeddingProvider, RawImage, TrainingConfig, Workspace};
//!
//! // Any extractor works; this one just echoes the image bytes.
//! struct Bytes;
//!
//! impl EmbeddingProvider for Bytes {
//!     fn ready(&self) -> bool {
//!         true
//!     }
//!
//!     fn embed(&self, image: &RawImage) -> Result<Embedding, EmbeddingError> {
//!         Ok(image.bytes().iter().map(|&b| b as f32 / 255.0).collect())
//!     }
//! }
//!
//! let workspace = Workspace::new(Arc::new(Bytes))
//!     .with_training_config(TrainingConfig::default().with_epochs(20).with_validation_split(0.0));
//! let classes: Vec<_> = workspace.statistics().store.per_class.iter().map(|c| c.id).collect();
//!
//! workspace.add_sample(classes[0], RawImage::new(vec![255, 0]))?;
//! workspace.add_sample(classes[1], RawImage::new(vec![0, 255]))?;
//! workspace.train(|progress| {
//!     println!("epoch {}: {:.0}%", progress.epoch, progress.accuracy * 100.0);
//!     Ok(())
//! })?;
//!
//! let ranked = workspace.predict(&RawImage::new(vec![250, 10]))?;
//! println!("{} ({:.1}%)", ranked[0].class_name, ranked[0].confidence * 100.0);
//! # Ok(())
//! # }
//! ```
//!
//! # Thread Safety
//!
//! [`Trainer`] and [`Classifier`] are cheap to clone and share their state.
//! Only one training run may be in flight; others are rejected with
//! [`TrainError::AlreadyTraining`]. Prediction keeps working while a run
//! replaces the model and reports the untrained sentinel in between.

pub mod capture;
pub mod classifier;
pub mod config;
pub mod dataset;
pub mod embedding;
pub mod error;
pub mod head;
pub mod model_manager;
pub mod models;
mod runtime;
pub mod store;
pub mod trainer;
mod utils;
pub mod workspace;

pub use capture::{CaptureSession, CaptureSource, LivePrediction};
pub use classifier::{Classifier, Prediction, UNTRAINED_LABEL};
pub use config::{CaptureConfig, RetryPolicy, TrainingConfig};
pub use dataset::{DatasetBuilder, TrainingSet};
pub use embedding::{Embedding, EmbeddingProvider, OnnxImageEmbedder, RawImage};
pub use error::{
    CaptureError, DatasetError, EmbeddingError, Error, ExportError, PredictError, Result, StoreError, TrainError,
    TrainingError, TrainingErrorCategory,
};
pub use head::{DenseHead, DenseModel, EpochProgress, FitReport, HeadModel, TrainableHead};
pub use model_manager::{ModelError, ModelManager};
pub use models::{BuiltinExtractor, ExtractorCharacteristics, ModelInfo};
pub use runtime::{create_session_builder, RuntimeConfig};
pub use store::{BatchReport, ClassId, ClassSlot, Sample, SampleStore, SharedStore, StoreStatistics};
pub use trainer::{TrainedModel, Trainer, TrainerState};
pub use workspace::{Workspace, WorkspaceStatistics};

pub fn init_logger() {
    env_logger::init();
}
