use std::fmt;
use std::sync::{Arc, Mutex};
use std::thread;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::embedding::{Embedding, EmbeddingProvider, RawImage};
use crate::error::{EmbeddingError, StoreError};

/// Fewer active classes than this cannot be trained on.
pub const MIN_ACTIVE_CLASSES: usize = 2;

/// A store shared between the operator, capture sessions and training.
pub type SharedStore = Arc<Mutex<SampleStore>>;

/// Stable class identifier. Ids grow monotonically and are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClassId(u64);

impl ClassId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An image together with the embedding extracted from it at ingestion.
#[derive(Debug, Clone)]
pub struct Sample {
    image: RawImage,
    embedding: Embedding,
}

impl Sample {
    pub fn image(&self) -> &RawImage {
        &self.image
    }

    pub fn embedding(&self) -> &Embedding {
        &self.embedding
    }
}

/// A named bucket of samples for one category.
#[derive(Debug, Clone)]
pub struct ClassSlot {
    id: ClassId,
    name: String,
    samples: Vec<Sample>,
}

impl ClassSlot {
    pub fn id(&self) -> ClassId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Outcome of ingesting several images into one class.
///
/// Per-item failures never abort the batch.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub added: usize,
    /// Items whose media type is not `image/*`
    pub skipped: usize,
    /// Batch position and reason of every rejected item
    pub failed: Vec<(usize, StoreError)>,
}

impl BatchReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassStatistics {
    pub id: ClassId,
    pub name: String,
    pub samples: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreStatistics {
    pub classes: usize,
    pub samples: usize,
    pub per_class: Vec<ClassStatistics>,
}

/// Owns the classes and their (image, embedding) pairs.
///
/// Slots are kept in creation order, which is also display and label order.
/// A store always holds at least [`MIN_ACTIVE_CLASSES`] slots. Every stored
/// embedding has the same length: the first successful embedding after
/// construction (or after [`set_provider`](Self::set_provider)) fixes it.
pub struct SampleStore {
    provider: Arc<dyn EmbeddingProvider>,
    slots: Vec<ClassSlot>,
    next_id: u64,
    dimension: Option<usize>,
}

impl fmt::Debug for SampleStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SampleStore")
            .field("slots", &self.slots.len())
            .field("samples", &self.total_samples())
            .field("dimension", &self.dimension)
            .finish()
    }
}

impl SampleStore {
    /// Creates a store with two empty classes, `Class 1` and `Class 2`.
    pub fn new(provider: Arc<dyn EmbeddingProvider>) -> Self {
        let mut store = Self {
            provider,
            slots: Vec::new(),
            next_id: 0,
            dimension: None,
        };
        for _ in 0..MIN_ACTIVE_CLASSES {
            let name = store.default_class_name();
            store.add_class(name);
        }
        store
    }

    /// Creates a store with the given class names, in order.
    ///
    /// # Errors
    /// `InvariantViolation` if fewer than two names are given
    pub fn with_class_names<I, S>(provider: Arc<dyn EmbeddingProvider>, names: I) -> Result<Self, StoreError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut store = Self {
            provider,
            slots: Vec::new(),
            next_id: 0,
            dimension: None,
        };
        for name in names {
            store.add_class(name);
        }
        if store.slots.len() < MIN_ACTIVE_CLASSES {
            return Err(StoreError::InvariantViolation(format!(
                "A store needs at least {} classes, got {}",
                MIN_ACTIVE_CLASSES,
                store.slots.len()
            )));
        }
        Ok(store)
    }

    /// Name the next [`add_class`](Self::add_class) would get in a UI that does
    /// not ask for one.
    pub fn default_class_name(&self) -> String {
        format!("Class {}", self.next_id + 1)
    }

    pub fn add_class(&mut self, initial_name: impl Into<String>) -> ClassId {
        let id = ClassId(self.next_id);
        self.next_id += 1;
        self.slots.push(ClassSlot {
            id,
            name: initial_name.into(),
            samples: Vec::new(),
        });
        info!("Added class {}", id);
        id
    }

    /// Removes a class and drops all of its samples.
    ///
    /// # Errors
    /// - `NotFound` if the class does not exist
    /// - `InvariantViolation` if only two classes remain; the store is unchanged
    pub fn remove_class(&mut self, id: ClassId) -> Result<(), StoreError> {
        let pos = self.position(id)?;
        if self.slots.len() <= MIN_ACTIVE_CLASSES {
            return Err(StoreError::InvariantViolation(format!(
                "At least {} classes are required",
                MIN_ACTIVE_CLASSES
            )));
        }
        let slot = self.slots.remove(pos);
        info!("Removed class {} with {} samples", id, slot.len());
        Ok(())
    }

    pub fn rename_class(&mut self, id: ClassId, name: impl Into<String>) -> Result<(), StoreError> {
        let pos = self.position(id)?;
        self.slots[pos].name = name.into();
        Ok(())
    }

    /// Embeds an image and appends it to a class. Returns its index.
    ///
    /// The image and its embedding are added together or not at all.
    ///
    /// # Errors
    /// - `NotReady` if the embedding provider is still loading
    /// - `NotFound` if the class does not exist
    /// - `EmbeddingFailed` if extraction fails or the embedding has the wrong length
    pub fn add_sample(&mut self, id: ClassId, image: RawImage) -> Result<usize, StoreError> {
        self.ensure_ready()?;
        let pos = self.position(id)?;
        let embedding = embed_one(self.provider.as_ref(), &image);
        self.commit(pos, image, embedding)
    }

    /// Ingests images into one class strictly in order.
    ///
    /// Items that are not images are skipped; items that fail extraction are
    /// logged and reported. Only a missing class or an unready provider fails the
    /// whole call.
    pub fn add_samples<I>(&mut self, id: ClassId, images: I) -> Result<BatchReport, StoreError>
    where
        I: IntoIterator<Item = RawImage>,
    {
        self.ensure_ready()?;
        let pos = self.position(id)?;
        let mut report = BatchReport::default();
        for (i, image) in images.into_iter().enumerate() {
            if !image.is_image() {
                report.skipped += 1;
                continue;
            }
            let embedding = embed_one(self.provider.as_ref(), &image);
            self.record(&mut report, i, pos, image, embedding);
        }
        info!(
            "Class {}: added {} samples ({} skipped, {} failed)",
            id,
            report.added,
            report.skipped,
            report.failed.len()
        );
        Ok(report)
    }

    /// Ingests batches for several classes, extracting each batch on its own thread.
    ///
    /// Order within a batch is preserved and batches are committed in the order
    /// given, so the outcome is the same as calling
    /// [`add_samples`](Self::add_samples) for each batch in turn.
    pub fn add_samples_by_class(
        &mut self,
        batches: Vec<(ClassId, Vec<RawImage>)>,
    ) -> Result<Vec<(ClassId, BatchReport)>, StoreError> {
        self.ensure_ready()?;
        let positions = batches
            .iter()
            .map(|(id, _)| self.position(*id))
            .collect::<Result<Vec<_>, _>>()?;

        let provider = self.provider.as_ref();
        let extracted: Vec<Vec<Option<Result<Embedding, EmbeddingError>>>> = thread::scope(|scope| {
            let handles: Vec<_> = batches
                .iter()
                .map(|(_, images)| {
                    scope.spawn(move || {
                        images
                            .iter()
                            .map(|image| image.is_image().then(|| embed_one(provider, image)))
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .zip(&batches)
                .map(|(handle, (_, images))| {
                    handle.join().unwrap_or_else(|_| {
                        let failure = EmbeddingError::ExtractionError("Extraction thread panicked".to_string());
                        images.iter().map(|_| Some(Err(failure.clone()))).collect()
                    })
                })
                .collect()
        });

        let mut reports = Vec::with_capacity(batches.len());
        for (((id, images), pos), results) in batches.into_iter().zip(positions).zip(extracted) {
            let mut report = BatchReport::default();
            for (i, (image, result)) in images.into_iter().zip(results).enumerate() {
                match result {
                    None => report.skipped += 1,
                    Some(embedding) => self.record(&mut report, i, pos, image, embedding),
                }
            }
            reports.push((id, report));
        }
        Ok(reports)
    }

    /// Removes the sample at `index`; later samples shift down by one.
    pub fn remove_sample(&mut self, id: ClassId, index: usize) -> Result<Sample, StoreError> {
        let pos = self.position(id)?;
        let slot = &mut self.slots[pos];
        if index >= slot.samples.len() {
            return Err(StoreError::IndexOutOfRange {
                class: id,
                index,
                len: slot.samples.len(),
            });
        }
        Ok(slot.samples.remove(index))
    }

    /// Active classes in creation order.
    pub fn active_classes(&self) -> &[ClassSlot] {
        &self.slots
    }

    pub fn class(&self, id: ClassId) -> Option<&ClassSlot> {
        self.slots.iter().find(|slot| slot.id == id)
    }

    pub fn class_count(&self) -> usize {
        self.slots.len()
    }

    pub fn total_samples(&self) -> usize {
        self.slots.iter().map(ClassSlot::len).sum()
    }

    /// True when at least two classes have one sample or more.
    pub fn ready_for_training(&self) -> bool {
        self.slots.iter().filter(|slot| !slot.is_empty()).count() >= MIN_ACTIVE_CLASSES
    }

    /// Embedding length new samples must have, once established.
    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    pub fn provider(&self) -> Arc<dyn EmbeddingProvider> {
        Arc::clone(&self.provider)
    }

    /// Swaps the embedding provider, e.g. after reloading the extractor.
    ///
    /// Existing samples are kept; the dimensionality is re-established by the
    /// next successful embedding.
    pub fn set_provider(&mut self, provider: Arc<dyn EmbeddingProvider>) {
        self.provider = provider;
        self.dimension = None;
        info!("Embedding provider replaced");
    }

    pub fn statistics(&self) -> StoreStatistics {
        StoreStatistics {
            classes: self.slots.len(),
            samples: self.total_samples(),
            per_class: self
                .slots
                .iter()
                .map(|slot| ClassStatistics {
                    id: slot.id,
                    name: slot.name.clone(),
                    samples: slot.len(),
                })
                .collect(),
        }
    }

    fn ensure_ready(&self) -> Result<(), StoreError> {
        if self.provider.ready() {
            Ok(())
        } else {
            Err(StoreError::NotReady)
        }
    }

    fn position(&self, id: ClassId) -> Result<usize, StoreError> {
        self.slots
            .iter()
            .position(|slot| slot.id == id)
            .ok_or(StoreError::NotFound(id))
    }

    fn record(
        &mut self,
        report: &mut BatchReport,
        index: usize,
        pos: usize,
        image: RawImage,
        embedding: Result<Embedding, EmbeddingError>,
    ) {
        match self.commit(pos, image, embedding) {
            Ok(_) => report.added += 1,
            Err(e) => {
                warn!("Skipping item {} for class {}: {}", index + 1, self.slots[pos].id, e);
                report.failed.push((index, e));
            }
        }
    }

    fn commit(
        &mut self,
        pos: usize,
        image: RawImage,
        embedding: Result<Embedding, EmbeddingError>,
    ) -> Result<usize, StoreError> {
        let embedding = embedding.map_err(StoreError::EmbeddingFailed)?;
        let expected = self.dimension.or_else(|| self.provider.dimension());
        if let Some(expected) = expected {
            if embedding.len() != expected {
                return Err(StoreError::EmbeddingFailed(EmbeddingError::ExtractionError(format!(
                    "Embedding has {} values, expected {}",
                    embedding.len(),
                    expected
                ))));
            }
        }
        self.dimension = Some(embedding.len());

        let slot = &mut self.slots[pos];
        slot.samples.push(Sample { image, embedding });
        Ok(slot.samples.len() - 1)
    }
}

fn embed_one(provider: &dyn EmbeddingProvider, image: &RawImage) -> Result<Embedding, EmbeddingError> {
    let embedding = provider.embed(image)?;
    if embedding.is_empty() {
        return Err(EmbeddingError::ExtractionError("Provider returned an empty embedding".to_string()));
    }
    Ok(embedding)
}
