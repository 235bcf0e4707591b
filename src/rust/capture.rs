//! Live capture: single-shot and timed sampling into the store, and timed
//! prediction over the same kind of source.
//!
//! Timers run as tokio tasks and each tick does its work on the blocking pool.
//! Closing a session halts its timer and waits for a tick in progress before
//! the source is stopped, so no tick touches the store or the source afterwards.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::classifier::{Classifier, Prediction};
use crate::embedding::RawImage;
use crate::error::CaptureError;
use crate::store::{ClassId, SharedStore};
use crate::utils::lock;

/// A live image source such as a camera.
pub trait CaptureSource: Send {
    /// Opens the underlying stream.
    fn start(&mut self) -> Result<(), CaptureError>;

    /// Grabs the current frame.
    fn frame(&mut self) -> Result<RawImage, CaptureError>;

    /// Releases the underlying stream.
    fn stop(&mut self);
}

struct SourceSlot {
    source: Box<dyn CaptureSource>,
    open: bool,
}

type SharedSource = Arc<Mutex<SourceSlot>>;

fn open_source(mut source: Box<dyn CaptureSource>) -> Result<SharedSource, CaptureError> {
    source.start()?;
    Ok(Arc::new(Mutex::new(SourceSlot { source, open: true })))
}

fn grab(source: &Mutex<SourceSlot>) -> Result<RawImage, CaptureError> {
    let mut slot = lock(source);
    if !slot.open {
        return Err(CaptureError::Closed);
    }
    slot.source.frame()
}

/// Marks the source closed and stops it. Waits for any frame grab in progress.
fn release_source(source: &Mutex<SourceSlot>) -> bool {
    let mut slot = lock(source);
    if !slot.open {
        return false;
    }
    slot.open = false;
    slot.source.stop();
    true
}

/// Repeats a job on a fixed period until stopped or the job returns `false`.
///
/// Each tick runs on tokio's blocking pool while holding `in_flight`, and checks
/// `running` under that lock before doing any work. Once [`stop`](Self::stop)
/// returns, no tick is running and none will start.
#[derive(Default)]
struct Ticker {
    running: Arc<AtomicBool>,
    in_flight: Arc<Mutex<()>>,
    task: Option<JoinHandle<()>>,
}

impl Ticker {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Returns `false` if the ticker was already running.
    fn start<F>(&mut self, period: Duration, job: F) -> Result<bool, CaptureError>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        if self.is_running() {
            return Ok(false);
        }
        let handle = Handle::try_current().map_err(|_| CaptureError::NoRuntime)?;
        let period = period.max(Duration::from_millis(1));
        // A fresh flag per run, so a tick queued by an earlier run stays stopped.
        self.running = Arc::new(AtomicBool::new(true));
        let running = Arc::clone(&self.running);
        let in_flight = Arc::clone(&self.in_flight);
        let job = Arc::new(Mutex::new(job));
        self.task = Some(handle.spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                let tick = {
                    let running = Arc::clone(&running);
                    let in_flight = Arc::clone(&in_flight);
                    let job = Arc::clone(&job);
                    tokio::task::spawn_blocking(move || {
                        let _guard = lock(&in_flight);
                        running.load(Ordering::SeqCst) && (*lock(&job))()
                    })
                };
                match tick.await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => {
                        warn!("Timer job failed: {}", e);
                        break;
                    }
                }
            }
            running.store(false, Ordering::SeqCst);
        }));
        Ok(true)
    }

    /// Halts the timer and waits for a tick in progress to finish.
    /// Returns `false` if the ticker was not running.
    fn stop(&mut self) -> bool {
        let was_running = self.running.swap(false, Ordering::SeqCst);
        match self.task.take() {
            Some(task) => {
                task.abort();
                drop(lock(&self.in_flight));
                was_running
            }
            None => false,
        }
    }
}

/// Feeds frames from a [`CaptureSource`] into one class of the store.
pub struct CaptureSession {
    source: SharedSource,
    store: SharedStore,
    class: ClassId,
    ticker: Ticker,
    captured: Arc<AtomicUsize>,
}

impl fmt::Debug for CaptureSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureSession")
            .field("class", &self.class)
            .field("auto_capturing", &self.is_auto_capturing())
            .field("captured", &self.captured())
            .finish()
    }
}

impl CaptureSession {
    /// Starts `source` and binds it to `class`.
    pub fn open(source: impl CaptureSource + 'static, store: SharedStore, class: ClassId) -> Result<Self, CaptureError> {
        let source = open_source(Box::new(source))?;
        info!("Capture session opened for class {}", class);
        Ok(Self {
            source,
            store,
            class,
            ticker: Ticker::default(),
            captured: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn class(&self) -> ClassId {
        self.class
    }

    /// Samples added by this session so far.
    pub fn captured(&self) -> usize {
        self.captured.load(Ordering::SeqCst)
    }

    pub fn is_open(&self) -> bool {
        lock(&self.source).open
    }

    pub fn is_auto_capturing(&self) -> bool {
        self.ticker.is_running()
    }

    /// Grabs one frame and adds it to the class. Returns the sample index.
    pub fn capture_once(&self) -> Result<usize, CaptureError> {
        capture_into(&self.source, &self.store, self.class, &self.captured)
    }

    /// Captures every `period` until stopped. Returns `false` if already running.
    ///
    /// # Errors
    /// - `Closed` if the session has been closed
    /// - `NoRuntime` outside a tokio runtime
    pub fn start_auto_capture(&mut self, period: Duration) -> Result<bool, CaptureError> {
        if !self.is_open() {
            return Err(CaptureError::Closed);
        }
        let source = Arc::clone(&self.source);
        let store = Arc::clone(&self.store);
        let captured = Arc::clone(&self.captured);
        let class = self.class;
        let started = self.ticker.start(period, move || {
            match capture_into(&source, &store, class, &captured) {
                Ok(index) => {
                    debug!("Auto-captured sample {} for class {}", index + 1, class);
                    true
                }
                Err(CaptureError::Closed) => false,
                Err(e) => {
                    warn!("Auto-capture for class {} failed: {}", class, e);
                    true
                }
            }
        })?;
        if started {
            info!("Auto-capture started for class {} every {:?}", self.class, period);
        }
        Ok(started)
    }

    /// Returns `false` if auto-capture was not running.
    pub fn stop_auto_capture(&mut self) -> bool {
        let stopped = self.ticker.stop();
        if stopped {
            info!("Auto-capture stopped for class {}", self.class);
        }
        stopped
    }

    /// Stops auto-capture, then releases the source. Idempotent.
    pub fn close(&mut self) {
        self.stop_auto_capture();
        if release_source(&self.source) {
            info!("Capture session closed after {} samples", self.captured());
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn capture_into(
    source: &Mutex<SourceSlot>,
    store: &SharedStore,
    class: ClassId,
    captured: &AtomicUsize,
) -> Result<usize, CaptureError> {
    let frame = grab(source)?;
    let index = lock(store).add_sample(class, frame)?;
    captured.fetch_add(1, Ordering::SeqCst);
    Ok(index)
}

/// Classifies frames from a [`CaptureSource`] on a timer and publishes the
/// latest ranking.
///
/// Subscribers see [`Prediction::untrained`] until a model exists, and again
/// whenever the model disappears mid-flight.
pub struct LivePrediction {
    source: SharedSource,
    classifier: Classifier,
    ticker: Ticker,
    latest: Arc<watch::Sender<Vec<Prediction>>>,
}

impl fmt::Debug for LivePrediction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LivePrediction")
            .field("running", &self.is_running())
            .finish()
    }
}

impl LivePrediction {
    pub fn open(source: impl CaptureSource + 'static, classifier: Classifier) -> Result<Self, CaptureError> {
        let source = open_source(Box::new(source))?;
        let (latest, _) = watch::channel(vec![Prediction::untrained()]);
        Ok(Self {
            source,
            classifier,
            ticker: Ticker::default(),
            latest: Arc::new(latest),
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<Prediction>> {
        self.latest.subscribe()
    }

    pub fn latest(&self) -> Vec<Prediction> {
        self.latest.borrow().clone()
    }

    pub fn is_open(&self) -> bool {
        lock(&self.source).open
    }

    pub fn is_running(&self) -> bool {
        self.ticker.is_running()
    }

    /// Classifies the current frame and publishes the result.
    pub fn predict_once(&self) -> Result<Vec<Prediction>, CaptureError> {
        predict_frame(&self.source, &self.classifier, &self.latest)
    }

    /// Returns `false` if already running.
    pub fn start(&mut self, period: Duration) -> Result<bool, CaptureError> {
        if !self.is_open() {
            return Err(CaptureError::Closed);
        }
        let source = Arc::clone(&self.source);
        let classifier = self.classifier.clone();
        let latest = Arc::clone(&self.latest);
        self.ticker.start(period, move || match predict_frame(&source, &classifier, &latest) {
            Ok(_) => true,
            Err(CaptureError::Closed) => false,
            Err(e) => {
                warn!("Live prediction failed: {}", e);
                true
            }
        })
    }

    /// Returns `false` if not running.
    pub fn stop(&mut self) -> bool {
        self.ticker.stop()
    }

    /// Stops the timer, then releases the source. Idempotent.
    pub fn close(&mut self) {
        self.stop();
        if release_source(&self.source) {
            info!("Live prediction closed");
        }
    }
}

impl Drop for LivePrediction {
    fn drop(&mut self) {
        self.close();
    }
}

fn predict_frame(
    source: &Mutex<SourceSlot>,
    classifier: &Classifier,
    latest: &watch::Sender<Vec<Prediction>>,
) -> Result<Vec<Prediction>, CaptureError> {
    let frame = grab(source)?;
    let ranked = classifier.predict(&frame)?;
    latest.send_replace(ranked.clone());
    Ok(ranked)
}
