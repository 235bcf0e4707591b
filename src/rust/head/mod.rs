//! Trainable classification heads fitted on embeddings.
//!
//! A [`TrainableHead`] builds fresh, untrained models; a [`HeadModel`] is one
//! such model. Models are released by dropping them.

use std::io::Write;

use ndarray::{Array1, ArrayView1, ArrayView2};
use serde::Serialize;

use crate::config::TrainingConfig;
use crate::error::{ExportError, TrainingError};

mod dense;

pub use dense::{DenseHead, DenseModel};

/// Metrics reported after every epoch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpochProgress {
    /// 1-based epoch number
    pub epoch: usize,
    pub epochs: usize,
    pub loss: f32,
    /// Training accuracy in `[0, 1]`
    pub accuracy: f32,
    pub val_loss: Option<f32>,
    pub val_accuracy: Option<f32>,
}

/// Summary of a completed fit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FitReport {
    pub epochs: usize,
    pub loss: f32,
    pub accuracy: f32,
    pub val_loss: Option<f32>,
    pub val_accuracy: Option<f32>,
    pub train_samples: usize,
    pub validation_samples: usize,
}

/// Factory for untrained models.
pub trait TrainableHead: Send + Sync {
    /// Builds a model mapping `input_dim` features to `num_classes` probabilities.
    fn build(
        &self,
        input_dim: usize,
        num_classes: usize,
        config: &TrainingConfig,
    ) -> Result<Box<dyn HeadModel>, TrainingError>;
}

/// A classification model over fixed-length feature vectors.
pub trait HeadModel: Send + Sync {
    fn input_dim(&self) -> usize;

    fn num_classes(&self) -> usize;

    /// Fits on `features` (one row per sample) against one-hot `targets`.
    ///
    /// `on_epoch` runs after every epoch.
    fn fit(
        &mut self,
        features: ArrayView2<'_, f32>,
        targets: ArrayView2<'_, f32>,
        config: &TrainingConfig,
        on_epoch: &mut dyn FnMut(EpochProgress),
    ) -> Result<FitReport, TrainingError>;

    /// Class probabilities for one feature vector, summing to 1.
    fn predict(&self, input: ArrayView1<'_, f32>) -> Result<Array1<f32>, TrainingError>;

    /// Writes the model in its own serialization format.
    fn save(&self, class_names: &[String], writer: &mut dyn Write) -> Result<(), ExportError>;
}
