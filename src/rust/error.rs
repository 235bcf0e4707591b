use std::fmt;
use std::io;

use thiserror::Error;

use crate::store::ClassId;

/// Failures raised by an [`EmbeddingProvider`](crate::EmbeddingProvider).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EmbeddingError {
    /// The extractor has not finished loading
    #[error("Embedding provider is not ready")]
    NotReady,
    /// The input could not be decoded or the extractor failed on it
    #[error("Extraction error: {0}")]
    ExtractionError(String),
    /// The extractor itself could not be loaded
    #[error("Failed to load embedding model: {0}")]
    LoadError(String),
}

impl From<ort::Error> for EmbeddingError {
    fn from(err: ort::Error) -> Self {
        EmbeddingError::LoadError(err.to_string())
    }
}

/// Errors from [`SampleStore`](crate::SampleStore) operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Embedding provider is not ready")]
    NotReady,
    /// The operation would break a store invariant, e.g. the two-class floor
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
    #[error("Class {0} not found")]
    NotFound(ClassId),
    #[error("Sample index {index} out of range for class {class} ({len} samples)")]
    IndexOutOfRange {
        class: ClassId,
        index: usize,
        len: usize,
    },
    /// The sample was rejected; nothing was added
    #[error("Embedding failed: {0}")]
    EmbeddingFailed(#[source] EmbeddingError),
}

/// Errors from assembling a [`TrainingSet`](crate::TrainingSet).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DatasetError {
    #[error("At least 2 classes with samples are required, found {found}")]
    InsufficientClasses { found: usize },
    #[error("No valid samples left after shape validation")]
    NoValidSamples,
    #[error("Malformed training set: {0}")]
    Malformed(String),
}

/// Coarse failure category reported for a training run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingErrorCategory {
    /// Features, labels or model dimensions disagree
    DataShape,
    /// A model or optimizer resource could not be allocated
    Resource,
    Unknown,
}

impl fmt::Display for TrainingErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DataShape => write!(f, "data shape error"),
            Self::Resource => write!(f, "resource error"),
            Self::Unknown => write!(f, "unknown error"),
        }
    }
}

/// A failed build or fit.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("Training failed ({category}): {message}")]
pub struct TrainingError {
    pub category: TrainingErrorCategory,
    pub message: String,
}

impl TrainingError {
    pub fn new(category: TrainingErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }

    pub fn data_shape(message: impl Into<String>) -> Self {
        Self::new(TrainingErrorCategory::DataShape, message)
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Self::new(TrainingErrorCategory::Resource, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(TrainingErrorCategory::Unknown, message)
    }
}

/// Errors returned by [`Trainer::train`](crate::Trainer::train).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TrainError {
    /// Another run is building or fitting; the call was rejected, not queued
    #[error("A training run is already in progress")]
    AlreadyTraining,
    #[error(transparent)]
    Training(#[from] TrainingError),
}

/// Errors from exporting a trained model.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("No trained model to export")]
    Untrained,
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Invalid model artifact: {0}")]
    InvalidArtifact(String),
}

/// Errors from the prediction path. An untrained classifier is not an error.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PredictError {
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
    #[error(transparent)]
    Model(#[from] TrainingError),
}

/// Errors from capture and live prediction sessions.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Capture session is closed")]
    Closed,
    #[error("Capture source error: {0}")]
    Source(String),
    #[error("Timed capture requires a running tokio runtime")]
    NoRuntime,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Predict(#[from] PredictError),
}

/// Crate-level error for [`Workspace`](crate::Workspace) commands.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Train(#[from] TrainError),
    #[error(transparent)]
    Export(#[from] ExportError),
    #[error(transparent)]
    Predict(#[from] PredictError),
    #[error(transparent)]
    Capture(#[from] CaptureError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
