use std::any::Any;
use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use log::{error, info, warn};
use ndarray::{Array1, ArrayView1};
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::config::TrainingConfig;
use crate::dataset::TrainingSet;
use crate::error::{ExportError, TrainError, TrainingError};
use crate::head::{DenseHead, EpochProgress, FitReport, HeadModel, TrainableHead};
use crate::utils::{lock, read, write};

/// Lifecycle of the trainer's model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainerState {
    Idle,
    Building,
    Fitting,
    Trained,
    Failed,
}

impl TrainerState {
    /// True while a run holds the single-flight guard.
    pub fn is_running(self) -> bool {
        matches!(self, Self::Building | Self::Fitting)
    }
}

impl fmt::Display for TrainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Building => "building",
            Self::Fitting => "fitting",
            Self::Trained => "trained",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A fitted head together with the class names it was trained on.
///
/// The names are a copy taken when the run started; later store edits do not
/// affect them.
pub struct TrainedModel {
    model: Box<dyn HeadModel>,
    class_names: Vec<String>,
    report: FitReport,
}

impl fmt::Debug for TrainedModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrainedModel")
            .field("class_names", &self.class_names)
            .field("input_dim", &self.model.input_dim())
            .field("report", &self.report)
            .finish()
    }
}

impl TrainedModel {
    /// Class names indexed by output position.
    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    pub fn report(&self) -> &FitReport {
        &self.report
    }

    pub fn input_dim(&self) -> usize {
        self.model.input_dim()
    }

    pub fn predict(&self, input: ArrayView1<'_, f32>) -> Result<Array1<f32>, TrainingError> {
        self.model.predict(input)
    }

    pub fn save(&self, writer: &mut dyn Write) -> Result<(), ExportError> {
        self.model.save(&self.class_names, writer)
    }
}

struct TrainerInner {
    head: Arc<dyn TrainableHead>,
    state: Mutex<TrainerState>,
    model: RwLock<Option<Arc<TrainedModel>>>,
    last_error: Mutex<Option<TrainingError>>,
}

/// Owns the model lifecycle: build, fit, publish, dispose.
///
/// Only one run may be in flight. A call made while another run is building or
/// fitting is rejected with [`TrainError::AlreadyTraining`] rather than queued.
/// Clones share the same state and model.
#[derive(Clone)]
pub struct Trainer {
    inner: Arc<TrainerInner>,
}

impl fmt::Debug for Trainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trainer").field("state", &self.state()).finish()
    }
}

impl Default for Trainer {
    fn default() -> Self {
        Self::new(Arc::new(DenseHead))
    }
}

/// Holds the single-flight slot. A guard dropped without finishing marks the
/// run as failed so the trainer never stays stuck in a running state.
struct RunGuard {
    inner: Arc<TrainerInner>,
    finished: bool,
}

impl RunGuard {
    fn set_state(&self, state: TrainerState) {
        *lock(&self.inner.state) = state;
    }

    fn finish(mut self, state: TrainerState) {
        self.set_state(state);
        self.finished = true;
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if !self.finished {
            *lock(&self.inner.state) = TrainerState::Failed;
        }
    }
}

impl Trainer {
    pub fn new(head: Arc<dyn TrainableHead>) -> Self {
        Self {
            inner: Arc::new(TrainerInner {
                head,
                state: Mutex::new(TrainerState::Idle),
                model: RwLock::new(None),
                last_error: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> TrainerState {
        *lock(&self.inner.state)
    }

    /// Error of the most recent failed run, cleared by the next run or by
    /// [`dispose`](Self::dispose).
    pub fn last_error(&self) -> Option<TrainingError> {
        lock(&self.inner.last_error).clone()
    }

    /// Snapshot of the published model. Holders keep it alive even if the
    /// trainer disposes it afterwards.
    pub fn current_model(&self) -> Option<Arc<TrainedModel>> {
        read(&self.inner.model).clone()
    }

    pub fn is_trained(&self) -> bool {
        read(&self.inner.model).is_some()
    }

    /// Builds a fresh model for `set` and fits it, replacing any previous one.
    ///
    /// `on_epoch` runs after every epoch. Its errors and panics are logged and
    /// never affect the run.
    ///
    /// # Errors
    /// - `AlreadyTraining` if another run is building or fitting; nothing changes
    /// - `Training` if building or fitting failed; the trainer ends up `Failed`.
    ///   A panic in the head's build or fit is reported with the `Unknown` category
    ///   and the panic message
    pub fn train<F>(&self, set: &TrainingSet, config: &TrainingConfig, mut on_epoch: F) -> Result<FitReport, TrainError>
    where
        F: FnMut(&EpochProgress) -> anyhow::Result<()>,
    {
        let guard = self.begin()?;
        self.run(guard, set, config, &mut on_epoch)
    }

    /// Runs [`train`](Self::train) on tokio's blocking pool.
    ///
    /// The single-flight slot is claimed before the task is spawned, so a
    /// rejected call fails immediately. Must be called from within a runtime.
    pub fn train_in_background<F>(
        &self,
        set: TrainingSet,
        config: TrainingConfig,
        mut on_epoch: F,
    ) -> Result<JoinHandle<Result<FitReport, TrainError>>, TrainError>
    where
        F: FnMut(&EpochProgress) -> anyhow::Result<()> + Send + 'static,
    {
        let guard = self.begin()?;
        let trainer = self.clone();
        Ok(tokio::task::spawn_blocking(move || {
            trainer.run(guard, &set, &config, &mut on_epoch)
        }))
    }

    /// Drops the published model and returns to `Idle`.
    ///
    /// Valid in any state and idempotent. While a run is in flight only the
    /// previously published model is dropped; the run itself carries on.
    pub fn dispose(&self) {
        let released = write(&self.inner.model).take().is_some();
        let mut state = lock(&self.inner.state);
        if !state.is_running() {
            *state = TrainerState::Idle;
            *lock(&self.inner.last_error) = None;
        }
        if released {
            info!("Disposed trained model");
        }
    }

    /// Writes the current model through the head's own serializer.
    pub fn export(&self, writer: &mut dyn Write) -> Result<(), ExportError> {
        let model = self.current_model().ok_or(ExportError::Untrained)?;
        model.save(writer)
    }

    pub fn export_to_path(&self, path: impl AsRef<Path>) -> Result<(), ExportError> {
        let model = self.current_model().ok_or(ExportError::Untrained)?;
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut writer = BufWriter::new(File::create(path)?);
        model.save(&mut writer)?;
        info!("Exported model to {}", path.display());
        Ok(())
    }

    fn begin(&self) -> Result<RunGuard, TrainError> {
        let mut state = lock(&self.inner.state);
        if state.is_running() {
            warn!("Training request rejected: a run is already {}", *state);
            return Err(TrainError::AlreadyTraining);
        }
        *state = TrainerState::Building;
        Ok(RunGuard {
            inner: Arc::clone(&self.inner),
            finished: false,
        })
    }

    fn run(
        &self,
        guard: RunGuard,
        set: &TrainingSet,
        config: &TrainingConfig,
        on_epoch: &mut dyn FnMut(&EpochProgress) -> anyhow::Result<()>,
    ) -> Result<FitReport, TrainError> {
        *lock(&self.inner.last_error) = None;
        if write(&self.inner.model).take().is_some() {
            info!("Disposed previous model");
        }
        info!(
            "Training on {} samples across {} classes for {} epochs",
            set.len(),
            set.num_classes(),
            config.epochs
        );

        match self.build_and_fit(&guard, set, config, on_epoch) {
            Ok((model, report)) => {
                let trained = TrainedModel {
                    model,
                    class_names: set.class_names().to_vec(),
                    report: report.clone(),
                };
                *write(&self.inner.model) = Some(Arc::new(trained));
                guard.finish(TrainerState::Trained);
                info!(
                    "Training complete: loss = {:.4}, accuracy = {:.2}%",
                    report.loss,
                    report.accuracy * 100.0
                );
                Ok(report)
            }
            Err(err) => {
                error!("{}", err);
                *lock(&self.inner.last_error) = Some(err.clone());
                guard.finish(TrainerState::Failed);
                Err(err.into())
            }
        }
    }

    fn build_and_fit(
        &self,
        guard: &RunGuard,
        set: &TrainingSet,
        config: &TrainingConfig,
        on_epoch: &mut dyn FnMut(&EpochProgress) -> anyhow::Result<()>,
    ) -> Result<(Box<dyn HeadModel>, FitReport), TrainingError> {
        let head = Arc::clone(&self.inner.head);
        let mut model = panic::catch_unwind(AssertUnwindSafe(|| {
            head.build(set.input_dim(), set.num_classes(), config)
        }))
        .map_err(panic_error)??;
        if model.input_dim() != set.input_dim() || model.num_classes() != set.num_classes() {
            return Err(TrainingError::data_shape(format!(
                "Head built a {}x{} model for {}x{} data",
                model.input_dim(),
                model.num_classes(),
                set.input_dim(),
                set.num_classes()
            )));
        }

        guard.set_state(TrainerState::Fitting);
        let targets = set.one_hot();
        let mut report_progress = |progress: EpochProgress| {
            match panic::catch_unwind(AssertUnwindSafe(|| on_epoch(&progress))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Progress callback failed at epoch {}: {}", progress.epoch, e),
                Err(_) => warn!("Progress callback panicked at epoch {}", progress.epoch),
            }
        };
        let report = panic::catch_unwind(AssertUnwindSafe(|| {
            model.fit(set.features().view(), targets.view(), config, &mut report_progress)
        }))
        .map_err(panic_error)??;
        Ok((model, report))
    }
}

fn panic_error(payload: Box<dyn Any + Send>) -> TrainingError {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic with no message".to_string());
    TrainingError::unknown(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    struct PanickingHead;

    impl TrainableHead for PanickingHead {
        fn build(&self, _: usize, _: usize, _: &TrainingConfig) -> Result<Box<dyn HeadModel>, TrainingError> {
            panic!("out of device memory");
        }
    }

    fn small_set() -> TrainingSet {
        TrainingSet::from_parts(
            array![[1.0, 0.0], [0.9, 0.1], [0.0, 1.0], [0.1, 0.9]],
            vec![0, 0, 1, 1],
            vec!["left".into(), "right".into()],
        )
        .unwrap()
    }

    fn quick() -> TrainingConfig {
        TrainingConfig::default().with_epochs(3).with_hidden_units(4)
    }

    #[test]
    fn test_successful_run_publishes_model() {
        let trainer = Trainer::default();
        assert_eq!(trainer.state(), TrainerState::Idle);
        let report = trainer.train(&small_set(), &quick(), |_| Ok(())).unwrap();
        assert_eq!(report.epochs, 3);
        assert_eq!(trainer.state(), TrainerState::Trained);
        let model = trainer.current_model().unwrap();
        assert_eq!(model.class_names(), ["left", "right"]);
    }

    #[test]
    fn test_panicking_head_fails_the_run() {
        let trainer = Trainer::new(Arc::new(PanickingHead));
        let err = trainer.train(&small_set(), &quick(), |_| Ok(())).unwrap_err();
        match err {
            TrainError::Training(e) => {
                assert_eq!(e.category, crate::error::TrainingErrorCategory::Unknown);
                assert!(e.message.contains("out of device memory"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(trainer.state(), TrainerState::Failed);
        assert!(trainer.current_model().is_none());
        assert!(trainer.last_error().is_some());
    }

    #[test]
    fn test_callback_failures_are_ignored() {
        let trainer = Trainer::default();
        let mut calls = 0;
        trainer
            .train(&small_set(), &quick(), |progress| {
                calls += 1;
                if progress.epoch == 1 {
                    anyhow::bail!("display went away");
                }
                if progress.epoch == 2 {
                    panic!("callback bug");
                }
                Ok(())
            })
            .unwrap();
        assert_eq!(calls, 3);
        assert_eq!(trainer.state(), TrainerState::Trained);
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let trainer = Trainer::default();
        trainer.train(&small_set(), &quick(), |_| Ok(())).unwrap();
        trainer.dispose();
        trainer.dispose();
        assert_eq!(trainer.state(), TrainerState::Idle);
        assert!(!trainer.is_trained());
        assert!(matches!(trainer.export(&mut Vec::new()), Err(ExportError::Untrained)));
    }
}
