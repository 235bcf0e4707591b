use std::io::{Read, Write};

use log::debug;
use ndarray::{Array, Array1, Array2, ArrayView1, ArrayView2, Axis, Dimension, Zip};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use super::{EpochProgress, FitReport, HeadModel, TrainableHead};
use crate::config::TrainingConfig;
use crate::error::{ExportError, TrainingError};
use crate::utils::{argmax, softmax};

const ARTIFACT_FORMAT: &str = "imprint-dense-v1";
// Refuse to allocate heads beyond this many weights.
const MAX_PARAMETERS: usize = 1 << 28;

/// Builds [`DenseModel`]s: one ReLU hidden layer with dropout and a softmax output.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenseHead;

impl TrainableHead for DenseHead {
    fn build(
        &self,
        input_dim: usize,
        num_classes: usize,
        config: &TrainingConfig,
    ) -> Result<Box<dyn HeadModel>, TrainingError> {
        Ok(Box::new(DenseModel::new(input_dim, num_classes, config)?))
    }
}

/// Dense classifier `input -> hidden (ReLU, dropout) -> classes (softmax)`,
/// fitted with Adam on categorical cross-entropy.
#[derive(Debug, Clone)]
pub struct DenseModel {
    w1: Array2<f32>,
    b1: Array1<f32>,
    w2: Array2<f32>,
    b2: Array1<f32>,
}

#[derive(Serialize, Deserialize)]
struct DenseArtifact {
    format: String,
    input_dim: usize,
    hidden_units: usize,
    class_names: Vec<String>,
    w1: Vec<f32>,
    b1: Vec<f32>,
    w2: Vec<f32>,
    b2: Vec<f32>,
}

impl DenseModel {
    /// Creates an untrained model: He-normal hidden weights, Glorot-uniform output
    /// weights, zero biases.
    pub fn new(input_dim: usize, num_classes: usize, config: &TrainingConfig) -> Result<Self, TrainingError> {
        let hidden = config.hidden_units;
        if input_dim == 0 || hidden == 0 {
            return Err(TrainingError::data_shape(format!(
                "Layer sizes must be positive (input {}, hidden {})",
                input_dim, hidden
            )));
        }
        if num_classes < 2 {
            return Err(TrainingError::data_shape(format!(
                "At least 2 output classes are required, got {}",
                num_classes
            )));
        }
        let parameters = input_dim
            .checked_mul(hidden)
            .and_then(|w1| hidden.checked_mul(num_classes).and_then(|w2| w1.checked_add(w2)))
            .filter(|&total| total <= MAX_PARAMETERS)
            .ok_or_else(|| {
                TrainingError::resource(format!(
                    "Model too large: {} inputs x {} hidden x {} classes",
                    input_dim, hidden, num_classes
                ))
            })?;
        debug!("Building dense head with {} weights", parameters);

        let mut rng = StdRng::seed_from_u64(config.seed);
        let he = Normal::new(0.0f32, (2.0 / input_dim as f32).sqrt())
            .map_err(|e| TrainingError::resource(e.to_string()))?;
        let w1 = Array2::from_shape_fn((input_dim, hidden), |_| he.sample(&mut rng));
        let limit = (6.0 / (hidden + num_classes) as f32).sqrt();
        let w2 = Array2::from_shape_fn((hidden, num_classes), |_| rng.random_range(-limit..limit));

        Ok(Self {
            w1,
            b1: Array1::zeros(hidden),
            w2,
            b2: Array1::zeros(num_classes),
        })
    }

    pub fn hidden_units(&self) -> usize {
        self.b1.len()
    }

    /// Reads a model written by [`HeadModel::save`], with its class names.
    pub fn from_reader(reader: impl Read) -> Result<(Self, Vec<String>), ExportError> {
        let artifact: DenseArtifact = serde_json::from_reader(reader)?;
        if artifact.format != ARTIFACT_FORMAT {
            return Err(ExportError::InvalidArtifact(format!(
                "Unsupported format '{}'",
                artifact.format
            )));
        }
        let classes = artifact.class_names.len();
        let shape_error = |e: ndarray::ShapeError| ExportError::InvalidArtifact(e.to_string());
        let w1 = Array2::from_shape_vec((artifact.input_dim, artifact.hidden_units), artifact.w1).map_err(shape_error)?;
        let w2 = Array2::from_shape_vec((artifact.hidden_units, classes), artifact.w2).map_err(shape_error)?;
        if artifact.b1.len() != artifact.hidden_units || artifact.b2.len() != classes {
            return Err(ExportError::InvalidArtifact("Bias length mismatch".to_string()));
        }
        let model = Self {
            w1,
            b1: Array1::from(artifact.b1),
            w2,
            b2: Array1::from(artifact.b2),
        };
        Ok((model, artifact.class_names))
    }

    fn forward(&self, x: ArrayView2<'_, f32>) -> Array2<f32> {
        let hidden = (x.dot(&self.w1) + &self.b1).mapv(|v| v.max(0.0));
        softmax_rows(hidden.dot(&self.w2) + &self.b2)
    }

    /// Mean loss and accuracy without dropout.
    fn evaluate(&self, x: ArrayView2<'_, f32>, y: ArrayView2<'_, f32>) -> (f32, f32) {
        let probs = self.forward(x);
        let rows = x.nrows().max(1) as f32;
        (
            cross_entropy_sum(&probs, y) / rows,
            count_correct(&probs, y) as f32 / rows,
        )
    }

    /// One Adam step on a mini-batch. Returns summed loss and correct predictions.
    fn train_step(
        &mut self,
        x: ArrayView2<'_, f32>,
        y: ArrayView2<'_, f32>,
        dropout: f32,
        adam: &mut Adam,
        rng: &mut StdRng,
    ) -> (f32, usize) {
        let rows = x.nrows() as f32;
        let z1 = x.dot(&self.w1) + &self.b1;
        let keep = 1.0 - dropout;
        let mask = Array2::from_shape_fn(z1.raw_dim(), |_| {
            if dropout == 0.0 || rng.random::<f32>() < keep {
                1.0 / keep
            } else {
                0.0
            }
        });
        let a1 = z1.mapv(|v| v.max(0.0)) * &mask;
        let probs = softmax_rows(a1.dot(&self.w2) + &self.b2);

        let loss = cross_entropy_sum(&probs, y);
        let correct = count_correct(&probs, y);

        let dz2 = (&probs - &y) / rows;
        let dw2 = a1.t().dot(&dz2);
        let db2 = dz2.sum_axis(Axis(0));
        let mut dz1 = dz2.dot(&self.w2.t()) * &mask;
        Zip::from(&mut dz1).and(&z1).for_each(|grad, &pre| {
            if pre <= 0.0 {
                *grad = 0.0;
            }
        });
        let dw1 = x.t().dot(&dz1);
        let db1 = dz1.sum_axis(Axis(0));

        adam.step += 1;
        let (params, step) = (adam.params, adam.step);
        adam.w1.update(&mut self.w1, &dw1, params, step);
        adam.b1.update(&mut self.b1, &db1, params, step);
        adam.w2.update(&mut self.w2, &dw2, params, step);
        adam.b2.update(&mut self.b2, &db2, params, step);

        (loss, correct)
    }
}

impl HeadModel for DenseModel {
    fn input_dim(&self) -> usize {
        self.w1.nrows()
    }

    fn num_classes(&self) -> usize {
        self.b2.len()
    }

    fn fit(
        &mut self,
        features: ArrayView2<'_, f32>,
        targets: ArrayView2<'_, f32>,
        config: &TrainingConfig,
        on_epoch: &mut dyn FnMut(EpochProgress),
    ) -> Result<FitReport, TrainingError> {
        if features.ncols() != self.input_dim() {
            return Err(TrainingError::data_shape(format!(
                "Features have {} columns, model expects {}",
                features.ncols(),
                self.input_dim()
            )));
        }
        if targets.ncols() != self.num_classes() || targets.nrows() != features.nrows() {
            return Err(TrainingError::data_shape(format!(
                "Targets are {}x{}, expected {}x{}",
                targets.nrows(),
                targets.ncols(),
                features.nrows(),
                self.num_classes()
            )));
        }
        let total = features.nrows();
        if total == 0 {
            return Err(TrainingError::data_shape("No training rows"));
        }

        let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(1));
        let mut order: Vec<usize> = (0..total).collect();
        order.shuffle(&mut rng);
        let validation = config.validation_count(total);
        let (train_rows, val_rows) = order.split_at(total - validation);
        let mut train_rows = train_rows.to_vec();
        let val_x = features.select(Axis(0), val_rows);
        let val_y = targets.select(Axis(0), val_rows);

        let batch_size = config.batch_size.max(1);
        let dropout = config.dropout.clamp(0.0, 0.9);
        let mut adam = Adam::new(self, config);
        let mut last: Option<EpochProgress> = None;

        for epoch in 1..=config.epochs {
            if config.shuffle {
                train_rows.shuffle(&mut rng);
            }
            let mut loss_sum = 0.0f32;
            let mut correct = 0usize;
            for batch in train_rows.chunks(batch_size) {
                let x = features.select(Axis(0), batch);
                let y = targets.select(Axis(0), batch);
                let (loss, hits) = self.train_step(x.view(), y.view(), dropout, &mut adam, &mut rng);
                loss_sum += loss;
                correct += hits;
            }

            let loss = loss_sum / train_rows.len() as f32;
            if !loss.is_finite() {
                return Err(TrainingError::unknown(format!("Loss diverged at epoch {}", epoch)));
            }
            let (val_loss, val_accuracy) = if val_rows.is_empty() {
                (None, None)
            } else {
                let (l, a) = self.evaluate(val_x.view(), val_y.view());
                (Some(l), Some(a))
            };
            let progress = EpochProgress {
                epoch,
                epochs: config.epochs,
                loss,
                accuracy: correct as f32 / train_rows.len() as f32,
                val_loss,
                val_accuracy,
            };
            debug!(
                "Epoch {}/{}: loss = {:.4}, accuracy = {:.2}%",
                epoch,
                config.epochs,
                progress.loss,
                progress.accuracy * 100.0
            );
            on_epoch(progress.clone());
            last = Some(progress);
        }

        let (loss, accuracy, val_loss, val_accuracy) = match last {
            Some(p) => (p.loss, p.accuracy, p.val_loss, p.val_accuracy),
            None => {
                let x = features.select(Axis(0), &train_rows);
                let y = targets.select(Axis(0), &train_rows);
                let (l, a) = self.evaluate(x.view(), y.view());
                (l, a, None, None)
            }
        };
        Ok(FitReport {
            epochs: config.epochs,
            loss,
            accuracy,
            val_loss,
            val_accuracy,
            train_samples: train_rows.len(),
            validation_samples: val_rows.len(),
        })
    }

    fn predict(&self, input: ArrayView1<'_, f32>) -> Result<Array1<f32>, TrainingError> {
        if input.len() != self.input_dim() {
            return Err(TrainingError::data_shape(format!(
                "Input has {} values, model expects {}",
                input.len(),
                self.input_dim()
            )));
        }
        let hidden = (input.dot(&self.w1) + &self.b1).mapv(|v| v.max(0.0));
        let logits = hidden.dot(&self.w2) + &self.b2;
        Ok(softmax(logits.view()))
    }

    fn save(&self, class_names: &[String], writer: &mut dyn Write) -> Result<(), ExportError> {
        if class_names.len() != self.num_classes() {
            return Err(ExportError::InvalidArtifact(format!(
                "{} class names for {} outputs",
                class_names.len(),
                self.num_classes()
            )));
        }
        let artifact = DenseArtifact {
            format: ARTIFACT_FORMAT.to_string(),
            input_dim: self.input_dim(),
            hidden_units: self.hidden_units(),
            class_names: class_names.to_vec(),
            w1: self.w1.iter().copied().collect(),
            b1: self.b1.to_vec(),
            w2: self.w2.iter().copied().collect(),
            b2: self.b2.to_vec(),
        };
        serde_json::to_writer(&mut *writer, &artifact)?;
        writer.flush()?;
        Ok(())
    }
}

#[derive(Clone, Copy)]
struct AdamParams {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
}

struct Moments<D: Dimension> {
    m: Array<f32, D>,
    v: Array<f32, D>,
}

impl<D: Dimension> Moments<D> {
    fn zeros_like(param: &Array<f32, D>) -> Self {
        Self {
            m: Array::zeros(param.raw_dim()),
            v: Array::zeros(param.raw_dim()),
        }
    }

    fn update(&mut self, param: &mut Array<f32, D>, grad: &Array<f32, D>, hp: AdamParams, step: i32) {
        let c1 = 1.0 - hp.beta1.powi(step);
        let c2 = 1.0 - hp.beta2.powi(step);
        Zip::from(param)
            .and(&mut self.m)
            .and(&mut self.v)
            .and(grad)
            .for_each(|p, m, v, &g| {
                *m = hp.beta1 * *m + (1.0 - hp.beta1) * g;
                *v = hp.beta2 * *v + (1.0 - hp.beta2) * g * g;
                *p -= hp.learning_rate * (*m / c1) / ((*v / c2).sqrt() + hp.epsilon);
            });
    }
}

struct Adam {
    params: AdamParams,
    step: i32,
    w1: Moments<ndarray::Ix2>,
    b1: Moments<ndarray::Ix1>,
    w2: Moments<ndarray::Ix2>,
    b2: Moments<ndarray::Ix1>,
}

impl Adam {
    fn new(model: &DenseModel, config: &TrainingConfig) -> Self {
        Self {
            params: AdamParams {
                learning_rate: config.learning_rate,
                beta1: config.beta1,
                beta2: config.beta2,
                epsilon: config.epsilon,
            },
            step: 0,
            w1: Moments::zeros_like(&model.w1),
            b1: Moments::zeros_like(&model.b1),
            w2: Moments::zeros_like(&model.w2),
            b2: Moments::zeros_like(&model.b2),
        }
    }
}

fn softmax_rows(mut logits: Array2<f32>) -> Array2<f32> {
    for mut row in logits.rows_mut() {
        let max = row.fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    }
    logits
}

fn cross_entropy_sum(probs: &Array2<f32>, targets: ArrayView2<'_, f32>) -> f32 {
    Zip::from(probs)
        .and(&targets)
        .fold(0.0f32, |acc, &p, &t| acc - t * p.max(1e-7).ln())
}

fn count_correct(probs: &Array2<f32>, targets: ArrayView2<'_, f32>) -> usize {
    probs
        .rows()
        .into_iter()
        .zip(targets.rows())
        .filter(|(p, t)| argmax(p.view()) == argmax(t.view()))
        .count()
}
