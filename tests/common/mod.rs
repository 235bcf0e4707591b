#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use imprint::{CaptureError, CaptureSource, Embedding, EmbeddingError, EmbeddingProvider, RawImage};
use ndarray::Array1;

/// Deterministic extractor: a `dim`-long vector seeded from the image bytes.
///
/// Empty images fail extraction. The first byte selects a "direction", so
/// images starting with the same byte embed close to each other.
pub struct FakeProvider {
    dim: usize,
    ready: AtomicBool,
    pub calls: AtomicUsize,
}

impl FakeProvider {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            ready: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn loading(dim: usize) -> Self {
        let provider = Self::new(dim);
        provider.ready.store(false, Ordering::SeqCst);
        provider
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }
}

impl EmbeddingProvider for FakeProvider {
    fn ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn embed(&self, image: &RawImage) -> Result<Embedding, EmbeddingError> {
        if !self.ready() {
            return Err(EmbeddingError::NotReady);
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        let bytes = image.bytes();
        let Some(&first) = bytes.first() else {
            return Err(EmbeddingError::ExtractionError("Empty image".to_string()));
        };
        let hot = first as usize % self.dim;
        let noise = bytes.get(1).copied().unwrap_or(0) as f32 / 2550.0;
        Ok(Array1::from_shape_fn(self.dim, |i| if i == hot { 1.0 - noise } else { noise }))
    }

    fn dimension(&self) -> Option<usize> {
        Some(self.dim)
    }
}

/// A [`FakeProvider`] whose extraction blocks the calling thread for `delay`.
pub struct SlowProvider {
    inner: FakeProvider,
    delay: Duration,
}

impl SlowProvider {
    pub fn new(dim: usize, delay: Duration) -> Self {
        Self {
            inner: FakeProvider::new(dim),
            delay,
        }
    }
}

impl EmbeddingProvider for SlowProvider {
    fn ready(&self) -> bool {
        self.inner.ready()
    }

    fn embed(&self, image: &RawImage) -> Result<Embedding, EmbeddingError> {
        std::thread::sleep(self.delay);
        self.inner.embed(image)
    }

    fn dimension(&self) -> Option<usize> {
        self.inner.dimension()
    }
}

/// An image the fake provider embeds along direction `class`.
pub fn image(class: u8, variant: u8) -> RawImage {
    RawImage::new(vec![class, variant]).with_media_type("image/png")
}

#[derive(Debug, Default)]
pub struct SourceCounters {
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub frames: AtomicUsize,
    /// Frames requested after `stop`
    pub frames_after_stop: AtomicUsize,
}

/// Scripted camera that yields images along one direction.
pub struct FakeSource {
    class: u8,
    stopped: bool,
    pub counters: Arc<SourceCounters>,
}

impl FakeSource {
    pub fn new(class: u8) -> (Self, Arc<SourceCounters>) {
        let counters = Arc::new(SourceCounters::default());
        let source = Self {
            class,
            stopped: false,
            counters: Arc::clone(&counters),
        };
        (source, counters)
    }
}

impl CaptureSource for FakeSource {
    fn start(&mut self) -> Result<(), CaptureError> {
        self.counters.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn frame(&mut self) -> Result<RawImage, CaptureError> {
        if self.stopped {
            self.counters.frames_after_stop.fetch_add(1, Ordering::SeqCst);
            return Err(CaptureError::Source("stopped".to_string()));
        }
        let n = self.counters.frames.fetch_add(1, Ordering::SeqCst);
        Ok(image(self.class, (n % 200) as u8))
    }

    fn stop(&mut self) {
        self.stopped = true;
        self.counters.stops.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn count(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::SeqCst)
}
