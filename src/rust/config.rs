use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Hyper-parameters for one training run.
///
/// The defaults reproduce a small transfer-learning head: 50 epochs, batch size 16,
/// 20% held out for validation, Adam at 0.001 on categorical cross-entropy, one
/// 128-unit ReLU layer with 0.5 dropout. Every field can be overridden.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub batch_size: usize,
    /// Fraction of samples held out for validation, in `[0, 1)`
    pub validation_split: f32,
    pub learning_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    pub hidden_units: usize,
    pub dropout: f32,
    /// Reshuffle the training rows every epoch
    pub shuffle: bool,
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 50,
            batch_size: 16,
            validation_split: 0.2,
            learning_rate: 0.001,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-7,
            hidden_units: 128,
            dropout: 0.5,
            shuffle: true,
            seed: 42,
        }
    }
}

impl TrainingConfig {
    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_validation_split(mut self, split: f32) -> Self {
        self.validation_split = split;
        self
    }

    pub fn with_learning_rate(mut self, learning_rate: f32) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    pub fn with_hidden_units(mut self, hidden_units: usize) -> Self {
        self.hidden_units = hidden_units;
        self
    }

    pub fn with_dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }

    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Number of rows held out from `total` samples.
    ///
    /// Always leaves at least one training row.
    pub fn validation_count(&self, total: usize) -> usize {
        if total < 2 || !(self.validation_split > 0.0) {
            return 0;
        }
        let split = self.validation_split.min(0.99);
        let count = (total as f32 * split).floor() as usize;
        count.min(total - 1)
    }
}

/// Timer periods for capture and live prediction sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureConfig {
    pub auto_capture_period: Duration,
    pub prediction_period: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            auto_capture_period: Duration::from_millis(500),
            prediction_period: Duration::from_millis(500),
        }
    }
}

/// Retry schedule used when fetching the feature extractor.
///
/// Attempt `n` (1-based) that fails waits `base_delay * n` before the next one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_training_config() {
        let config = TrainingConfig::default();
        assert_eq!(config.epochs, 50);
        assert_eq!(config.batch_size, 16);
        assert!((config.validation_split - 0.2).abs() < f32::EPSILON);
    }

    #[test]
    fn test_validation_count() {
        let config = TrainingConfig::default();
        assert_eq!(config.validation_count(10), 2);
        assert_eq!(config.validation_count(4), 0);
        assert_eq!(config.validation_count(1), 0);

        let config = config.with_validation_split(0.0);
        assert_eq!(config.validation_count(100), 0);
    }

    #[test]
    fn test_retry_delays_grow_linearly() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(3), Duration::from_secs(3));
    }
}
