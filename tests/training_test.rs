// Integration test: full training runs on synthetic data
// Covers checkpoint contents, resume semantics, best tracking and validation purity

use anyhow::Result;
use candle_core::Device;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::Path;
use tempfile::TempDir;

use reid_trainer::config::{DataSettings, ModelSettings, TrainConfig};
use reid_trainer::data::{BatchSource, SyntheticReid};
use reid_trainer::errors::TrainError;
use reid_trainer::losses::{CenterLoss, SoftmaxTripletLoss};
use reid_trainer::metrics::{read_scalars, MemorySink, SCALARS_FILE};
use reid_trainer::models::{Baseline, EmbeddingModel};
use reid_trainer::training::{CheckpointStore, RunContext, Trainer, TrainingParts};

/// 3 identities x 4 samples, batch 4: three train batches per epoch
fn small_config(root: &Path, epochs: usize) -> TrainConfig {
    let mut config = TrainConfig::default();
    config.seed = 7;
    config.trainer.epochs = epochs;
    config.trainer.checkpoint_dir = root.join("checkpoints").display().to_string();
    config.trainer.log_dir = root.join("logs").display().to_string();
    config.data = DataSettings {
        batch_size: 4,
        num_classes: 3,
        train_per_class: 4,
        val_per_class: 2,
        input_dim: 8,
        noise: 0.3,
    };
    config.model = ModelSettings {
        feature_dim: 16,
        dropout: 0.0,
    };
    config.losses.beta = 0.0005;
    config.lr_scheduler.steps = vec![3];
    config.lr_scheduler.iters = 2;
    config
}

#[test]
fn test_two_epochs_then_resume_to_four() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config = small_config(temp_dir.path(), 2);

    let context = RunContext::with_run_id(config.trainer_settings(), "first")?;
    let mut trainer = Trainer::from_config(&config, context)?;
    let summary = trainer.run()?;

    assert_eq!(summary.epochs.len(), 2);
    for (expected, result) in (1..=2).zip(&summary.epochs) {
        assert_eq!(result.epoch, expected);
        assert!(result.train.contains_key("loss"));
        assert!(result.train.contains_key("accuracy"));
        assert!(result.valid["loss"].is_finite());
        assert!((0.0..=1.0).contains(&result.valid["accuracy"]));
    }

    let last = trainer.checkpoint_store().last_path();
    let header = CheckpointStore::read_header(&last)?;
    assert_eq!(header.epoch, 2);
    assert_eq!(header.run_id, "first");
    // Per-epoch schedule: one step per finished epoch
    assert_eq!(header.lr_scheduler.last_epoch, 2);
    // Three batches per epoch
    assert_eq!(header.optimizer.step, 6);
    assert_eq!(header.optimizer_centerloss.step, 6);
    assert!(trainer.checkpoint_store().best_path().exists());

    // Resume with a larger epoch budget
    let mut resumed_config = small_config(temp_dir.path(), 4);
    resumed_config.resume = last.display().to_string();
    let context = RunContext::with_run_id(resumed_config.trainer_settings(), "second")?;
    let mut resumed = Trainer::from_config(&resumed_config, context)?;
    assert_eq!(resumed.context().start_epoch(), 3);
    assert_eq!(resumed.best_accuracy(), summary.best_accuracy);

    let resumed_summary = resumed.run()?;
    let epochs: Vec<usize> = resumed_summary.epochs.iter().map(|e| e.epoch).collect();
    assert_eq!(epochs, vec![3, 4]);

    let header = CheckpointStore::read_header(&resumed.checkpoint_store().last_path())?;
    assert_eq!(header.epoch, 4);
    assert_eq!(header.lr_scheduler.last_epoch, 4);
    assert_eq!(header.optimizer.step, 12);
    Ok(())
}

#[test]
fn test_resume_restores_parameters() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config = small_config(temp_dir.path(), 1);
    let context = RunContext::with_run_id(config.trainer_settings(), "source")?;
    let mut trainer = Trainer::from_config(&config, context)?;
    trainer.run()?;
    let trained = trainer.model_snapshot()?;
    let centers = trainer.center_snapshot()?;

    let mut resumed_config = small_config(temp_dir.path(), 1);
    resumed_config.resume = trainer.checkpoint_store().last_path().display().to_string();
    let context = RunContext::with_run_id(resumed_config.trainer_settings(), "target")?;
    let resumed = Trainer::from_config(&resumed_config, context)?;

    for (name, tensor) in resumed.model_snapshot()? {
        let expected = trained[&name].flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(tensor.flatten_all()?.to_vec1::<f32>()?, expected, "{}", name);
    }
    assert_eq!(
        resumed.center_snapshot()?["centers"].to_vec2::<f32>()?,
        centers["centers"].to_vec2::<f32>()?
    );

    // Nothing left to run
    let mut resumed = resumed;
    assert!(resumed.run()?.epochs.is_empty());
    Ok(())
}

#[test]
fn test_best_accuracy_is_running_max() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config = small_config(temp_dir.path(), 4);
    let context = RunContext::with_run_id(config.trainer_settings(), "best")?;
    let mut trainer = Trainer::from_config(&config, context)?;
    let summary = trainer.run()?;

    let mut best: Option<f64> = None;
    let mut last_best_epoch = 0;
    for result in &summary.epochs {
        let accuracy = result.valid["accuracy"];
        let improves = best.map_or(true, |b| accuracy > b);
        assert_eq!(result.is_best, improves, "epoch {}", result.epoch);
        if improves {
            best = Some(accuracy);
            last_best_epoch = result.epoch;
        }
    }
    assert!(summary.epochs[0].is_best);
    assert_eq!(summary.best_accuracy, best);

    let best_header = CheckpointStore::read_header(&trainer.checkpoint_store().best_path())?;
    assert_eq!(best_header.epoch, last_best_epoch);
    assert_eq!(best_header.best_accuracy, best);
    Ok(())
}

#[test]
fn test_validation_does_not_mutate_parameters() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config = small_config(temp_dir.path(), 1);
    let context = RunContext::with_run_id(config.trainer_settings(), "val")?;
    let mut trainer = Trainer::from_config(&config, context)?;

    let before = trainer.model_snapshot()?;
    let centers_before = trainer.center_snapshot()?;
    let result = trainer.validate(1)?;
    assert!(result.contains_key("loss"));

    for (name, tensor) in trainer.model_snapshot()? {
        assert_eq!(
            tensor.flatten_all()?.to_vec1::<f32>()?,
            before[&name].flatten_all()?.to_vec1::<f32>()?,
            "{}",
            name
        );
    }
    assert_eq!(
        trainer.center_snapshot()?["centers"].to_vec2::<f32>()?,
        centers_before["centers"].to_vec2::<f32>()?
    );
    Ok(())
}

#[test]
fn test_missing_resume_path_fails_fast() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let mut config = small_config(temp_dir.path(), 1);
    config.resume = temp_dir
        .path()
        .join("nope/model_last.safetensors")
        .display()
        .to_string();

    let context = RunContext::with_run_id(config.trainer_settings(), "missing")?;
    match Trainer::from_config(&config, context) {
        Err(TrainError::CheckpointNotFound(path)) => {
            assert!(path.ends_with("nope/model_last.safetensors"))
        }
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("expected CheckpointNotFound"),
    }
    Ok(())
}

#[test]
fn test_scalars_written_per_epoch() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config = small_config(temp_dir.path(), 2);
    let context = RunContext::with_run_id(config.trainer_settings(), "scalars")?;
    let log_dir = context.log_dir().to_path_buf();
    let mut trainer = Trainer::from_config(&config, context)?;
    trainer.run()?;

    let events = read_scalars(&log_dir.join(SCALARS_FILE))?;
    let steps: Vec<usize> = events
        .iter()
        .filter(|e| e.tag == "Accuracy/Val")
        .map(|e| e.step)
        .collect();
    assert_eq!(steps, vec![1, 2]);
    assert!(events.iter().any(|e| e.tag == "Loss/Train"));
    Ok(())
}

#[test]
fn test_log_dir_mirrored_each_epoch() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let mut config = small_config(temp_dir.path(), 1);
    config.trainer.log_dir_saved = temp_dir.path().join("drive").display().to_string();

    let context = RunContext::with_run_id(config.trainer_settings(), "mirrored")?;
    let mirror = context.mirror_dir().map(Path::to_path_buf);
    let mut trainer = Trainer::from_config(&config, context)?;
    trainer.run()?;

    let mirror = mirror.expect("mirror dir configured");
    assert!(mirror.join(SCALARS_FILE).exists());
    Ok(())
}

#[test]
fn test_custom_parts_with_memory_sink() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config = small_config(temp_dir.path(), 2);
    let context = RunContext::with_run_id(config.trainer_settings(), "parts")?;

    let device = Device::Cpu;
    let mut rng = StdRng::seed_from_u64(1);
    let data = SyntheticReid::new(&config.data, 1)?;
    let classes = data.num_classes();
    let model = Baseline::new(config.data.input_dim, classes, &config.model, &mut rng, &device)?;
    let center_loss = CenterLoss::new(classes, model.feature_dim(), &mut rng, &device)?;
    let parts = TrainingParts {
        model: Box::new(model),
        primary_loss: Box::new(SoftmaxTripletLoss::new(classes, 0.3, 0.1)),
        secondary_loss: Box::new(center_loss),
        data: Box::new(data),
    };

    let sink = MemorySink::new();
    let mut trainer = Trainer::new(&config, context, parts, Box::new(sink.clone()))?;
    let summary = trainer.run()?;

    let val_loss = sink.series("Loss/Val");
    assert_eq!(val_loss.len(), 2);
    assert_eq!(val_loss[1].0, 2);
    assert!((val_loss[1].1 - summary.epochs[1].valid["loss"]).abs() < 1e-12);
    assert_eq!(sink.events().len(), 8);
    Ok(())
}
