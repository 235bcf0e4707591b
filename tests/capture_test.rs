mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{count, image, FakeProvider, FakeSource, SlowProvider};
use imprint::{CaptureError, CaptureSession, Error, TrainingConfig, Workspace};

fn workspace() -> Workspace {
    Workspace::new(Arc::new(FakeProvider::new(4)))
        .with_training_config(TrainingConfig::default().with_epochs(5).with_hidden_units(8))
}

fn first_class(workspace: &Workspace) -> imprint::ClassId {
    workspace.statistics().store.per_class[0].id
}

#[test]
fn test_capture_once_adds_a_sample() -> Result<(), Box<dyn std::error::Error>> {
    let workspace = workspace();
    let class = first_class(&workspace);
    let (source, counters) = FakeSource::new(0);
    let session = workspace.open_capture(class, source)?;

    assert_eq!(count(&counters.starts), 1);
    assert_eq!(session.capture_once()?, 0);
    assert_eq!(session.capture_once()?, 1);
    assert_eq!(session.captured(), 2);
    assert_eq!(workspace.statistics().store.per_class[0].samples, 2);
    Ok(())
}

#[test]
fn test_open_capture_for_unknown_class() {
    let workspace = workspace();
    let class = workspace.add_class("temp");
    workspace.remove_class(class).unwrap();
    let (source, counters) = FakeSource::new(0);
    assert!(matches!(workspace.open_capture(class, source), Err(Error::Store(_))));
    assert_eq!(count(&counters.starts), 0);
}

#[test]
fn test_auto_capture_needs_a_runtime() {
    let workspace = workspace();
    let (source, _) = FakeSource::new(0);
    let mut session = workspace.open_capture(first_class(&workspace), source).unwrap();
    assert!(matches!(
        session.start_auto_capture(Duration::from_millis(500)),
        Err(CaptureError::NoRuntime)
    ));
    assert!(!session.is_auto_capturing());
}

#[tokio::test(start_paused = true)]
async fn test_auto_capture_start_and_stop_are_idempotent() {
    let workspace = workspace();
    let (source, counters) = FakeSource::new(0);
    let mut session = workspace.open_capture(first_class(&workspace), source).unwrap();

    assert!(session.start_auto_capture(Duration::from_millis(500)).unwrap());
    assert!(!session.start_auto_capture(Duration::from_millis(500)).unwrap());
    tokio::time::sleep(Duration::from_millis(1250)).await;
    assert_eq!(session.captured(), 2);

    assert!(session.stop_auto_capture());
    assert!(!session.stop_auto_capture());
    assert!(!session.is_auto_capturing());

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(session.captured(), 2);
    assert_eq!(count(&counters.frames), 2);
    assert_eq!(workspace.statistics().store.samples, 2);
}

#[tokio::test(start_paused = true)]
async fn test_close_halts_timer_before_releasing_source() {
    let workspace = workspace();
    let (source, counters) = FakeSource::new(0);
    let mut session = workspace.open_capture(first_class(&workspace), source).unwrap();
    session.start_auto_capture(Duration::from_millis(100)).unwrap();
    tokio::time::sleep(Duration::from_millis(350)).await;

    session.close();
    session.close();
    assert!(!session.is_open());
    assert!(!session.is_auto_capturing());
    assert_eq!(count(&counters.stops), 1);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(count(&counters.frames_after_stop), 0);
    assert!(matches!(session.capture_once(), Err(CaptureError::Closed)));
    assert!(matches!(
        session.start_auto_capture(Duration::from_millis(100)),
        Err(CaptureError::Closed)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_close_waits_for_a_slow_tick() {
    let workspace = Workspace::new(Arc::new(SlowProvider::new(4, Duration::from_millis(300))));
    let (source, counters) = FakeSource::new(0);
    let mut session = workspace.open_capture(first_class(&workspace), source).unwrap();
    session.start_auto_capture(Duration::from_millis(20)).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    session.close();
    let captured = session.captured();
    let samples = workspace.statistics().store.samples;
    assert_eq!(captured, samples);

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(session.captured(), captured);
    assert_eq!(workspace.statistics().store.samples, samples);
    assert_eq!(count(&counters.frames_after_stop), 0);
}

#[tokio::test]
async fn test_slow_ticks_leave_the_runtime_responsive() {
    let workspace = Workspace::new(Arc::new(SlowProvider::new(4, Duration::from_millis(300))));
    let (source, _) = FakeSource::new(0);
    let mut session = workspace.open_capture(first_class(&workspace), source).unwrap();
    session.start_auto_capture(Duration::from_millis(10)).unwrap();

    let mut worst = Duration::ZERO;
    for _ in 0..40 {
        let started = std::time::Instant::now();
        tokio::time::sleep(Duration::from_millis(5)).await;
        worst = worst.max(started.elapsed());
    }
    session.close();
    assert!(session.captured() >= 1);
    assert!(worst < Duration::from_millis(150), "worst 5ms sleep took {:?}", worst);
}

#[test]
fn test_dropping_a_session_releases_the_source() {
    let workspace = workspace();
    let (source, counters) = FakeSource::new(0);
    let session = CaptureSession::open(source, workspace.store(), first_class(&workspace)).unwrap();
    drop(session);
    assert_eq!(count(&counters.stops), 1);
}

#[tokio::test(start_paused = true)]
async fn test_live_prediction_follows_trainer_state() -> Result<(), Box<dyn std::error::Error>> {
    let workspace = workspace();
    let ids: Vec<_> = workspace.statistics().store.per_class.iter().map(|c| c.id).collect();
    for variant in 0..4 {
        workspace.add_sample(ids[0], image(0, variant))?;
        workspace.add_sample(ids[1], image(1, variant))?;
    }

    let (source, _) = FakeSource::new(1);
    let mut live = workspace.open_live_prediction(source)?;
    let mut updates = live.subscribe();
    assert!(live.latest()[0].is_untrained());
    assert!(live.predict_once()?[0].is_untrained());

    assert!(live.start(Duration::from_millis(500))?);
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(live.latest()[0].is_untrained());

    workspace.train(|_| Ok(()))?;
    updates.borrow_and_update();
    updates.changed().await?;
    let ranked = updates.borrow_and_update().clone();
    assert_eq!(ranked.len(), 2);
    assert!(!ranked[0].is_untrained());

    workspace.reset_model();
    updates.changed().await?;
    assert!(updates.borrow_and_update()[0].is_untrained());

    live.close();
    assert!(!live.is_running());
    assert!(!live.stop());
    Ok(())
}
