use log::{info, warn};
use ndarray::{Array2, ArrayView1};

use crate::error::DatasetError;
use crate::store::{SampleStore, MIN_ACTIVE_CLASSES};

/// Labelled embeddings for one training run.
///
/// Labels are `0..class_names.len()`, assigned by the order classes appeared in
/// the store when the set was built. They are not stable across store
/// mutations; a trained model keeps its own copy of `class_names`.
#[derive(Debug, Clone)]
pub struct TrainingSet {
    features: Array2<f32>,
    labels: Vec<usize>,
    class_names: Vec<String>,
    skipped: usize,
}

impl TrainingSet {
    /// Assembles a set from already-validated parts.
    ///
    /// # Errors
    /// - `InsufficientClasses` if fewer than two class names are given
    /// - `NoValidSamples` if `features` has no rows
    /// - `Malformed` if row and label counts disagree or a label is out of range
    pub fn from_parts(
        features: Array2<f32>,
        labels: Vec<usize>,
        class_names: Vec<String>,
    ) -> Result<Self, DatasetError> {
        if class_names.len() < MIN_ACTIVE_CLASSES {
            return Err(DatasetError::InsufficientClasses {
                found: class_names.len(),
            });
        }
        if features.nrows() == 0 || features.ncols() == 0 {
            return Err(DatasetError::NoValidSamples);
        }
        if features.nrows() != labels.len() {
            return Err(DatasetError::Malformed(format!(
                "{} feature rows but {} labels",
                features.nrows(),
                labels.len()
            )));
        }
        if let Some(&label) = labels.iter().find(|&&label| label >= class_names.len()) {
            return Err(DatasetError::Malformed(format!(
                "Label {} out of range for {} classes",
                label,
                class_names.len()
            )));
        }
        Ok(Self {
            features,
            labels,
            class_names,
            skipped: 0,
        })
    }

    /// One embedding per row, in label-then-sample order.
    pub fn features(&self) -> &Array2<f32> {
        &self.features
    }

    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    /// Class names indexed by label.
    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    pub fn input_dim(&self) -> usize {
        self.features.ncols()
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Samples left out because their embedding had the wrong length.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Per-class sample counts, indexed by label.
    pub fn class_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.class_names.len()];
        for &label in &self.labels {
            counts[label] += 1;
        }
        counts
    }

    /// Labels as one-hot rows aligned with [`features`](Self::features).
    pub fn one_hot(&self) -> Array2<f32> {
        let mut targets = Array2::zeros((self.labels.len(), self.class_names.len()));
        for (row, &label) in self.labels.iter().enumerate() {
            targets[[row, label]] = 1.0;
        }
        targets
    }
}

/// Flattens a [`SampleStore`] into a [`TrainingSet`].
pub struct DatasetBuilder;

impl DatasetBuilder {
    /// Builds a fresh training set from the current store contents.
    ///
    /// Only classes holding at least one sample take part, keeping store order;
    /// the label of a class is its position among those. The first embedding
    /// seen fixes the expected length and samples of any other length are
    /// skipped with a warning.
    ///
    /// # Errors
    /// - `InsufficientClasses` if fewer than two classes have samples
    /// - `NoValidSamples` if no sample survives shape validation
    pub fn build(store: &SampleStore) -> Result<TrainingSet, DatasetError> {
        let selected: Vec<_> = store
            .active_classes()
            .iter()
            .filter(|slot| !slot.is_empty())
            .collect();
        if selected.len() < MIN_ACTIVE_CLASSES {
            return Err(DatasetError::InsufficientClasses {
                found: selected.len(),
            });
        }

        let mut expected: Option<usize> = None;
        let mut flat: Vec<f32> = Vec::new();
        let mut labels = Vec::new();
        let mut skipped = 0usize;

        for (label, slot) in selected.iter().enumerate() {
            let mut kept = 0usize;
            for (index, sample) in slot.samples().iter().enumerate() {
                let embedding: ArrayView1<'_, f32> = sample.embedding().view();
                if expected.is_none() && !embedding.is_empty() {
                    expected = Some(embedding.len());
                }
                let dim = expected.unwrap_or(0);
                if embedding.is_empty() || embedding.len() != dim {
                    warn!(
                        "Skipping sample {} of class '{}': embedding has {} values, expected {}",
                        index + 1,
                        slot.name(),
                        embedding.len(),
                        dim
                    );
                    skipped += 1;
                    continue;
                }
                flat.extend(embedding.iter().copied());
                labels.push(label);
                kept += 1;
            }
            if kept == 0 {
                warn!("Class '{}' has no valid samples for this run", slot.name());
            }
        }

        let dim = match expected {
            Some(dim) if !labels.is_empty() && dim > 0 => dim,
            _ => return Err(DatasetError::NoValidSamples),
        };
        let features = Array2::from_shape_vec((labels.len(), dim), flat)
            .map_err(|e| DatasetError::Malformed(e.to_string()))?;
        let class_names = selected.iter().map(|slot| slot.name().to_string()).collect();

        let mut set = TrainingSet::from_parts(features, labels, class_names)?;
        set.skipped = skipped;
        info!(
            "Training data: {} samples, {} classes, {} skipped",
            set.len(),
            set.num_classes(),
            skipped
        );
        Ok(set)
    }
}
