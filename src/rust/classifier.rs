use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use log::debug;
use serde::Serialize;

use crate::embedding::{Embedding, EmbeddingProvider, RawImage};
use crate::error::{PredictError, TrainingError};
use crate::trainer::Trainer;

/// Class name reported while no trained model exists.
pub const UNTRAINED_LABEL: &str = "untrained";

/// One ranked entry of a prediction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub class_name: String,
    /// Softmax probability in `[0, 1]`
    pub confidence: f32,
}

impl Prediction {
    /// The sentinel returned when nothing has been trained yet.
    pub fn untrained() -> Self {
        Self {
            class_name: UNTRAINED_LABEL.to_string(),
            confidence: 0.0,
        }
    }

    pub fn is_untrained(&self) -> bool {
        self.class_name == UNTRAINED_LABEL && self.confidence == 0.0
    }
}

/// The prediction path: embed one image, run the published model, rank.
///
/// Probabilities are paired with the class names frozen at training time, not
/// with the live store. An absent model, including one disposed while a
/// prediction was in flight, is reported as the untrained sentinel.
#[derive(Clone)]
pub struct Classifier {
    provider: Arc<dyn EmbeddingProvider>,
    trainer: Trainer,
}

impl fmt::Debug for Classifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Classifier")
            .field("trained", &self.trainer.is_trained())
            .finish()
    }
}

// Compile-time verification of thread-safety
const _: () = {
    fn assert_send_sync<T: Send + Sync>() {}
    fn verify_thread_safety() {
        assert_send_sync::<Classifier>();
    }
};

impl Classifier {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, trainer: Trainer) -> Self {
        Self { provider, trainer }
    }

    pub fn is_trained(&self) -> bool {
        self.trainer.is_trained()
    }

    /// Ranked predictions for `image`, highest confidence first.
    ///
    /// Returns `[Prediction::untrained()]` without touching the provider when
    /// there is no model.
    pub fn predict(&self, image: &RawImage) -> Result<Vec<Prediction>, PredictError> {
        if !self.trainer.is_trained() {
            return Ok(vec![Prediction::untrained()]);
        }
        let embedding = self.provider.embed(image)?;
        self.predict_embedding(&embedding)
    }

    /// Like [`predict`](Self::predict) for an already extracted embedding.
    pub fn predict_embedding(&self, embedding: &Embedding) -> Result<Vec<Prediction>, PredictError> {
        let Some(model) = self.trainer.current_model() else {
            return Ok(vec![Prediction::untrained()]);
        };
        let probabilities = model.predict(embedding.view())?;
        let names = model.class_names();
        if probabilities.len() != names.len() {
            return Err(TrainingError::data_shape(format!(
                "Model produced {} scores for {} classes",
                probabilities.len(),
                names.len()
            ))
            .into());
        }

        let mut ranked: Vec<Prediction> = names
            .iter()
            .zip(probabilities.iter())
            .map(|(name, &confidence)| Prediction {
                class_name: name.clone(),
                confidence,
            })
            .collect();
        ranked.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap_or(Ordering::Equal));
        debug!(
            "Predicted '{}' ({:.1}%)",
            ranked[0].class_name,
            ranked[0].confidence * 100.0
        );
        Ok(ranked)
    }
}
