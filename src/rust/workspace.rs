use std::fmt;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use log::info;
use serde::Serialize;

use crate::capture::{CaptureSession, CaptureSource, LivePrediction};
use crate::classifier::{Classifier, Prediction};
use crate::config::{CaptureConfig, TrainingConfig};
use crate::dataset::{DatasetBuilder, TrainingSet};
use crate::embedding::{EmbeddingProvider, RawImage};
use crate::error::{Error, Result, StoreError, TrainingError};
use crate::head::{EpochProgress, FitReport, TrainableHead};
use crate::store::{BatchReport, ClassId, SampleStore, SharedStore, StoreStatistics};
use crate::trainer::{Trainer, TrainerState};
use crate::utils::lock;

/// Store statistics plus the trainer's view.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkspaceStatistics {
    #[serde(flatten)]
    pub store: StoreStatistics,
    pub trainer_state: TrainerState,
    /// Classes of the published model, in output order
    pub trained_classes: Option<Vec<String>>,
}

/// One interactive classifier-building session.
///
/// Owns the shared store, the trainer, the classifier and the configuration,
/// and exposes them as plain commands.
pub struct Workspace {
    store: SharedStore,
    trainer: Trainer,
    classifier: Classifier,
    training: TrainingConfig,
    capture: CaptureConfig,
}

impl fmt::Debug for Workspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workspace")
            .field("store", &*lock(&self.store))
            .field("trainer", &self.trainer)
            .field("training", &self.training)
            .finish()
    }
}

impl Workspace {
    /// A workspace with two empty classes and the default dense head.
    pub fn new(provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self::with_store(SampleStore::new(provider), Trainer::default())
    }

    pub fn with_head(provider: Arc<dyn EmbeddingProvider>, head: Arc<dyn TrainableHead>) -> Self {
        Self::with_store(SampleStore::new(provider), Trainer::new(head))
    }

    pub fn with_store(store: SampleStore, trainer: Trainer) -> Self {
        let classifier = Classifier::new(store.provider(), trainer.clone());
        Self {
            store: Arc::new(Mutex::new(store)),
            trainer,
            classifier,
            training: TrainingConfig::default(),
            capture: CaptureConfig::default(),
        }
    }

    pub fn with_training_config(mut self, config: TrainingConfig) -> Self {
        self.training = config;
        self
    }

    pub fn with_capture_config(mut self, config: CaptureConfig) -> Self {
        self.capture = config;
        self
    }

    pub fn training_config(&self) -> &TrainingConfig {
        &self.training
    }

    pub fn set_training_config(&mut self, config: TrainingConfig) {
        self.training = config;
    }

    pub fn capture_config(&self) -> &CaptureConfig {
        &self.capture
    }

    /// The shared store, for capture sessions and batch ingestion.
    ///
    /// Swap providers through [`Workspace::set_provider`]. Calling
    /// `SampleStore::set_provider` on this handle leaves the classifier on the
    /// old provider.
    pub fn store(&self) -> SharedStore {
        Arc::clone(&self.store)
    }

    pub fn trainer(&self) -> &Trainer {
        &self.trainer
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    /// Adds a class named like the next default, `Class N`.
    pub fn add_default_class(&self) -> ClassId {
        let mut store = lock(&self.store);
        let name = store.default_class_name();
        store.add_class(name)
    }

    pub fn add_class(&self, name: impl Into<String>) -> ClassId {
        lock(&self.store).add_class(name)
    }

    pub fn remove_class(&self, id: ClassId) -> Result<()> {
        Ok(lock(&self.store).remove_class(id)?)
    }

    pub fn rename_class(&self, id: ClassId, name: impl Into<String>) -> Result<()> {
        Ok(lock(&self.store).rename_class(id, name)?)
    }

    pub fn add_sample(&self, id: ClassId, image: RawImage) -> Result<usize> {
        Ok(lock(&self.store).add_sample(id, image)?)
    }

    pub fn add_samples(&self, id: ClassId, images: Vec<RawImage>) -> Result<BatchReport> {
        Ok(lock(&self.store).add_samples(id, images)?)
    }

    pub fn remove_sample(&self, id: ClassId, index: usize) -> Result<()> {
        lock(&self.store).remove_sample(id, index)?;
        Ok(())
    }

    pub fn ready_for_training(&self) -> bool {
        lock(&self.store).ready_for_training()
    }

    /// Swaps the extractor for the store and the prediction path.
    ///
    /// The published model stays; its input width no longer matching the new
    /// provider shows up as a prediction error.
    pub fn set_provider(&mut self, provider: Arc<dyn EmbeddingProvider>) {
        lock(&self.store).set_provider(Arc::clone(&provider));
        self.classifier = Classifier::new(provider, self.trainer.clone());
    }

    /// Snapshots the store into a training set.
    pub fn build_dataset(&self) -> Result<TrainingSet> {
        Ok(DatasetBuilder::build(&lock(&self.store))?)
    }

    /// Builds a training set from the current store and trains on it.
    ///
    /// The store lock is released before fitting, so captures may continue
    /// while the run is in progress. A dataset error leaves the trainer and
    /// any published model untouched.
    pub fn train<F>(&self, on_epoch: F) -> Result<FitReport>
    where
        F: FnMut(&EpochProgress) -> anyhow::Result<()>,
    {
        let set = self.build_dataset()?;
        Ok(self.trainer.train(&set, &self.training, on_epoch)?)
    }

    /// Like [`train`](Self::train) but fits on tokio's blocking pool.
    pub async fn train_async<F>(&self, on_epoch: F) -> Result<FitReport>
    where
        F: FnMut(&EpochProgress) -> anyhow::Result<()> + Send + 'static,
    {
        let set = self.build_dataset()?;
        let task = self.trainer.train_in_background(set, self.training.clone(), on_epoch)?;
        let report = task.await.map_err(|e| {
            Error::Train(TrainingError::unknown(format!("Training task failed: {}", e)).into())
        })??;
        Ok(report)
    }

    pub fn predict(&self, image: &RawImage) -> Result<Vec<Prediction>> {
        Ok(self.classifier.predict(image)?)
    }

    pub fn export(&self, writer: &mut dyn Write) -> Result<()> {
        Ok(self.trainer.export(writer)?)
    }

    pub fn export_to_path(&self, path: impl AsRef<Path>) -> Result<()> {
        Ok(self.trainer.export_to_path(path)?)
    }

    /// Opens a capture session feeding `class`.
    pub fn open_capture(&self, class: ClassId, source: impl CaptureSource + 'static) -> Result<CaptureSession> {
        if lock(&self.store).class(class).is_none() {
            return Err(StoreError::NotFound(class).into());
        }
        Ok(CaptureSession::open(source, self.store(), class)?)
    }

    /// Opens a capture session and starts auto-capture at the configured period.
    pub fn start_auto_capture(&self, class: ClassId, source: impl CaptureSource + 'static) -> Result<CaptureSession> {
        let mut session = self.open_capture(class, source)?;
        session.start_auto_capture(self.capture.auto_capture_period)?;
        Ok(session)
    }

    pub fn open_live_prediction(&self, source: impl CaptureSource + 'static) -> Result<LivePrediction> {
        Ok(LivePrediction::open(source, self.classifier.clone())?)
    }

    /// Opens live prediction and starts it at the configured period.
    pub fn start_live_prediction(&self, source: impl CaptureSource + 'static) -> Result<LivePrediction> {
        let mut live = self.open_live_prediction(source)?;
        live.start(self.capture.prediction_period)?;
        Ok(live)
    }

    pub fn statistics(&self) -> WorkspaceStatistics {
        let store = lock(&self.store).statistics();
        WorkspaceStatistics {
            store,
            trainer_state: self.trainer.state(),
            trained_classes: self.trainer.current_model().map(|m| m.class_names().to_vec()),
        }
    }

    /// Drops the trained model and returns the trainer to idle.
    pub fn reset_model(&self) {
        self.trainer.dispose();
        info!("Workspace model reset");
    }
}
