mod common;

use std::fs::File;
use std::sync::Arc;

use common::{count, image, FakeProvider};
use imprint::{
    DenseModel, Error, ExportError, HeadModel, Prediction, TrainError, Trainer, TrainerState, TrainingConfig,
    Workspace,
};

fn config() -> TrainingConfig {
    TrainingConfig::default()
        .with_epochs(40)
        .with_batch_size(8)
        .with_hidden_units(32)
        .with_dropout(0.1)
        .with_learning_rate(0.02)
}

fn three_class_workspace() -> Workspace {
    let workspace = Workspace::new(Arc::new(FakeProvider::new(6))).with_training_config(config());
    let third = workspace.add_default_class();
    let ids: Vec<_> = workspace.statistics().store.per_class.iter().map(|c| c.id).collect();
    assert_eq!(ids[2], third);
    for (direction, id) in ids.iter().enumerate() {
        for variant in 0..8 {
            workspace.add_sample(*id, image(direction as u8, variant)).unwrap();
        }
    }
    workspace
}

#[test]
fn test_predict_before_training_is_untrained() {
    let workspace = Workspace::new(Arc::new(FakeProvider::new(6)));
    let ranked = workspace.predict(&image(0, 0)).unwrap();
    assert_eq!(
        ranked,
        vec![Prediction {
            class_name: "untrained".to_string(),
            confidence: 0.0
        }]
    );
}

#[test]
fn test_three_class_predictions_are_ranked_probabilities() -> Result<(), Box<dyn std::error::Error>> {
    let workspace = three_class_workspace();
    let mut epochs = Vec::new();
    let report = workspace.train(|progress| {
        epochs.push(progress.epoch);
        Ok(())
    })?;
    assert_eq!(epochs, (1..=40).collect::<Vec<_>>());
    assert_eq!(report.train_samples + report.validation_samples, 24);
    assert_eq!(workspace.trainer().state(), TrainerState::Trained);

    let ranked = workspace.predict(&image(1, 3))?;
    assert_eq!(ranked.len(), 3);
    let total: f32 = ranked.iter().map(|p| p.confidence).sum();
    assert!((total - 1.0).abs() < 1e-4, "confidences sum to {}", total);
    assert!(ranked.windows(2).all(|w| w[0].confidence >= w[1].confidence));
    assert_eq!(ranked[0].class_name, "Class 2");
    Ok(())
}

#[test]
fn test_second_train_while_fitting_is_rejected() {
    let workspace = three_class_workspace();
    let trainer = workspace.trainer().clone();
    let set = workspace.build_dataset().unwrap();
    let tiny = TrainingConfig::default().with_epochs(1);

    let mut rejections = Vec::new();
    let report = workspace
        .trainer()
        .train(&set, &config().with_epochs(3), |progress| {
            assert_eq!(trainer.state(), TrainerState::Fitting);
            rejections.push(trainer.train(&set, &tiny, |_| Ok(())).unwrap_err());
            Ok(())
        })
        .unwrap();

    assert_eq!(rejections, vec![TrainError::AlreadyTraining; 3]);
    assert_eq!(report.epochs, 3);
    assert_eq!(trainer.state(), TrainerState::Trained);
    assert_eq!(trainer.current_model().unwrap().report().epochs, 3);
}

#[test]
fn test_trained_class_names_are_frozen() -> Result<(), Box<dyn std::error::Error>> {
    let workspace = three_class_workspace();
    workspace.train(|_| Ok(()))?;

    let ids: Vec<_> = workspace.statistics().store.per_class.iter().map(|c| c.id).collect();
    workspace.rename_class(ids[0], "Renamed")?;
    workspace.remove_class(ids[2])?;

    let stats = workspace.statistics();
    assert_eq!(stats.store.classes, 2);
    assert_eq!(
        stats.trained_classes.unwrap(),
        vec!["Class 1".to_string(), "Class 2".to_string(), "Class 3".to_string()]
    );
    let ranked = workspace.predict(&image(0, 1))?;
    assert_eq!(ranked.len(), 3);
    assert!(ranked.iter().all(|p| p.class_name != "Renamed"));
    Ok(())
}

#[test]
fn test_dataset_failure_keeps_prior_model() -> Result<(), Box<dyn std::error::Error>> {
    let workspace = three_class_workspace();
    workspace.train(|_| Ok(()))?;

    let ids: Vec<_> = workspace.statistics().store.per_class.iter().map(|c| c.id).collect();
    for id in &ids[1..] {
        while workspace.statistics().store.per_class.iter().any(|c| c.id == *id && c.samples > 0) {
            workspace.remove_sample(*id, 0)?;
        }
    }

    let err = workspace.train(|_| Ok(())).unwrap_err();
    assert!(matches!(err, Error::Dataset(_)));
    assert_eq!(workspace.trainer().state(), TrainerState::Trained);
    assert!(workspace.classifier().is_trained());
    Ok(())
}

#[test]
fn test_set_provider_switches_store_and_classifier() -> Result<(), Box<dyn std::error::Error>> {
    let mut workspace = three_class_workspace();
    workspace.train(|_| Ok(()))?;

    let replacement = Arc::new(FakeProvider::new(6));
    workspace.set_provider(replacement.clone());
    assert_eq!(count(&replacement.calls), 0);

    let ranked = workspace.predict(&image(0, 1))?;
    assert_eq!(ranked.len(), 3);
    assert_eq!(count(&replacement.calls), 1);

    let id = workspace.statistics().store.per_class[0].id;
    workspace.add_sample(id, image(0, 9))?;
    assert_eq!(count(&replacement.calls), 2);
    Ok(())
}

#[test]
fn test_export_round_trip() -> Result<(), Box<dyn std::error::Error>> {
    let workspace = three_class_workspace();
    assert!(matches!(
        workspace.export(&mut Vec::new()),
        Err(Error::Export(ExportError::Untrained))
    ));
    workspace.train(|_| Ok(()))?;

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("models").join("head.json");
    workspace.export_to_path(&path)?;

    let (model, names) = DenseModel::from_reader(File::open(&path)?)?;
    assert_eq!(names, ["Class 1", "Class 2", "Class 3"]);
    assert_eq!(model.input_dim(), 6);
    assert_eq!(model.num_classes(), 3);
    Ok(())
}

#[test]
fn test_dispose_returns_to_untrained() {
    let workspace = three_class_workspace();
    workspace.train(|_| Ok(())).unwrap();
    workspace.reset_model();
    workspace.reset_model();

    assert_eq!(workspace.trainer().state(), TrainerState::Idle);
    assert!(workspace.predict(&image(0, 0)).unwrap()[0].is_untrained());
}

#[tokio::test]
async fn test_background_training() -> Result<(), Box<dyn std::error::Error>> {
    let workspace = three_class_workspace();
    let report = workspace.train_async(|_| Ok(())).await?;
    assert_eq!(report.epochs, 40);
    assert!(workspace.classifier().is_trained());
    Ok(())
}

#[tokio::test]
async fn test_background_guard_is_taken_before_spawn() {
    let trainer = Trainer::default();
    let workspace = three_class_workspace();
    let set = workspace.build_dataset().unwrap();

    let (release, wait) = std::sync::mpsc::channel::<()>();
    let first = trainer
        .train_in_background(set.clone(), config().with_epochs(2), move |_| {
            let _ = wait.recv();
            Ok(())
        })
        .unwrap();

    let second = trainer.train_in_background(set, config(), |_| Ok(()));
    assert!(matches!(second, Err(TrainError::AlreadyTraining)));

    drop(release);
    first.await.unwrap().unwrap();
    assert_eq!(trainer.state(), TrainerState::Trained);
}
