// Training orchestrator - epoch loop, validation, checkpoint lifecycle

use candle_core::{DType, Device, Tensor, Var, D};
use candle_nn::Optimizer;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::checkpoint::{CheckpointStore, OptimizationState};
use super::context::RunContext;
use super::joint_step::JointStep;
use super::mirror::mirror_dir;
use super::observer::{TrainingEvent, TrainingObserver};
use crate::config::{ScheduleStep, TrainConfig};
use crate::data::{BatchSource, Phase, SyntheticReid};
use crate::errors::{Result, TrainError};
use crate::losses::{CenterLoss, PrimaryLoss, SecondaryLoss, SoftmaxTripletLoss};
use crate::metrics::{MetricTracker, MetricsSink, ScalarWriter};
use crate::models::{snapshot_parameters, Baseline, EmbeddingModel, Mode};
use crate::optim::{Adam, ParamsAdam, ParamsSgd, Sgd, StatefulOptimizer, WarmupMultiStepLr};

/// Names tracked in both phases
pub const METRICS: [&str; 2] = ["loss", "accuracy"];

/// Collaborators the trainer drives
pub struct TrainingParts {
    pub model: Box<dyn EmbeddingModel>,
    pub primary_loss: Box<dyn PrimaryLoss>,
    pub secondary_loss: Box<dyn SecondaryLoss>,
    pub data: Box<dyn BatchSource>,
}

/// Per-epoch results
#[derive(Debug, Clone)]
pub struct EpochResult {
    pub epoch: usize,
    pub train: BTreeMap<String, f64>,
    pub valid: BTreeMap<String, f64>,
    pub is_best: bool,
}

/// What a finished `run` reports
#[derive(Debug, Clone)]
pub struct TrainingSummary {
    pub epochs: Vec<EpochResult>,
    pub best_accuracy: Option<f64>,
    pub last_checkpoint: Option<PathBuf>,
}

pub struct Trainer {
    context: RunContext,
    model: Box<dyn EmbeddingModel>,
    primary_loss: Box<dyn PrimaryLoss>,
    secondary_loss: Box<dyn SecondaryLoss>,
    data: Box<dyn BatchSource>,
    model_params: Vec<(String, Var)>,
    center_params: Vec<(String, Var)>,
    optimizer: Adam,
    optimizer_centerloss: Sgd,
    lr_scheduler: WarmupMultiStepLr,
    schedule_step: ScheduleStep,
    joint: JointStep,
    train_metrics: MetricTracker,
    valid_metrics: MetricTracker,
    sink: Box<dyn MetricsSink>,
    store: CheckpointStore,
    observers: Vec<Box<dyn TrainingObserver>>,
    best_accuracy: Option<f64>,
}

impl Trainer {
    /// Wire the collaborators together; resumes when `config.resume` is set
    pub fn new(
        config: &TrainConfig,
        mut context: RunContext,
        parts: TrainingParts,
        sink: Box<dyn MetricsSink>,
    ) -> Result<Self> {
        config.validate()?;
        let resume = config.resume_path();
        if let Some(path) = &resume {
            if !path.exists() {
                return Err(TrainError::CheckpointNotFound(path.clone()));
            }
        }

        let joint = JointStep::new(config.losses.beta)?;
        let model_params = parts.model.parameters();
        let center_params = parts.secondary_loss.parameters();

        let mut optimizer = Adam::with_named(
            model_params.clone(),
            ParamsAdam {
                lr: config.optimizer.lr,
                weight_decay: config.optimizer.weight_decay,
                ..ParamsAdam::default()
            },
        )?;
        let mut optimizer_centerloss =
            Sgd::with_named(center_params.clone(), ParamsSgd::new(config.optimizer.center_lr))?;

        let mut lr_scheduler = WarmupMultiStepLr::new(config.optimizer.lr, &config.lr_scheduler)?;
        lr_scheduler.apply(&mut optimizer);
        let schedule_step = config.trainer_settings().schedule_step;

        let total_params: usize = model_params.iter().map(|(_, v)| v.elem_count()).sum();
        tracing::info!(
            parameters = total_params,
            tensors = model_params.len(),
            feature_dim = parts.model.feature_dim(),
            "Model summary"
        );
        tracing::info!(
            schedule_step = ?schedule_step,
            beta = joint.beta(),
            "LR schedule configured"
        );

        let store = CheckpointStore::new(context.checkpoint_dir())?;

        let mut best_accuracy = None;
        if let Some(path) = resume {
            tracing::info!(path = %path.display(), "Loading checkpoint");
            let state = CheckpointStore::load(&path, context.device())?;
            restore_parameters(&model_params, &state.model, &path, "model")?;
            restore_parameters(&center_params, &state.center_loss, &path, "center_loss")?;
            optimizer.import_state(&state.optimizer)?;
            optimizer_centerloss.import_state(&state.optimizer_centerloss)?;
            lr_scheduler.load_state(state.lr_scheduler);
            best_accuracy = state.best_accuracy;
            context.resume_from(state.epoch)?;
            tracing::info!(
                start_epoch = context.start_epoch(),
                "Checkpoint loaded, resuming training"
            );
        }

        Ok(Self {
            context,
            model: parts.model,
            primary_loss: parts.primary_loss,
            secondary_loss: parts.secondary_loss,
            data: parts.data,
            model_params,
            center_params,
            optimizer,
            optimizer_centerloss,
            lr_scheduler,
            schedule_step,
            joint,
            train_metrics: MetricTracker::new(&METRICS),
            valid_metrics: MetricTracker::new(&METRICS),
            sink,
            store,
            observers: Vec::new(),
            best_accuracy,
        })
    }

    /// Build the built-in model, losses, synthetic data and scalar writer
    pub fn from_config(config: &TrainConfig, context: RunContext) -> Result<Self> {
        // Fail before building anything
        if let Some(path) = config.resume_path() {
            if !path.exists() {
                return Err(TrainError::CheckpointNotFound(path));
            }
        }

        let device = context.device().clone();
        let mut rng = StdRng::seed_from_u64(config.seed);
        let data = SyntheticReid::new(&config.data, config.seed)?;
        let num_classes = data.num_classes();

        let model = Baseline::new(
            config.data.input_dim,
            num_classes,
            &config.model,
            &mut rng,
            &device,
        )?;
        let primary_loss = SoftmaxTripletLoss::new(
            num_classes,
            config.losses.margin,
            config.losses.epsilon,
        );
        let center_loss = CenterLoss::new(num_classes, model.feature_dim(), &mut rng, &device)?;
        let sink = ScalarWriter::new(context.log_dir())?;

        let parts = TrainingParts {
            model: Box::new(model),
            primary_loss: Box::new(primary_loss),
            secondary_loss: Box::new(center_loss),
            data: Box::new(data),
        };
        Self::new(config, context, parts, Box::new(sink))
    }

    pub fn add_observer(&mut self, observer: Box<dyn TrainingObserver>) {
        self.observers.push(observer);
    }

    pub fn context(&self) -> &RunContext {
        &self.context
    }

    pub fn best_accuracy(&self) -> Option<f64> {
        self.best_accuracy
    }

    pub fn checkpoint_store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Current learning rate of the primary optimizer
    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    /// Deep copies of the model parameters
    pub fn model_snapshot(&self) -> Result<BTreeMap<String, Tensor>> {
        snapshot_parameters(&self.model_params)
    }

    /// Deep copies of the center-loss parameters
    pub fn center_snapshot(&self) -> Result<BTreeMap<String, Tensor>> {
        snapshot_parameters(&self.center_params)
    }

    /// Run epochs `start_epoch..=epochs`
    pub fn run(&mut self) -> Result<TrainingSummary> {
        let run_id = self.context.run_id().to_string();
        notify(
            &mut self.observers,
            &TrainingEvent::RunStarted {
                run_id: &run_id,
                start_epoch: self.context.start_epoch(),
                epochs: self.context.epochs(),
            },
        );

        let mut epochs = Vec::with_capacity(self.context.remaining_epochs());
        let mut last_checkpoint = None;
        for epoch in self.context.start_epoch()..=self.context.epochs() {
            let train = self.train_epoch(epoch)?;

            if self.schedule_step == ScheduleStep::Epoch {
                self.step_schedule();
            }

            let valid = self.validate(epoch)?;

            self.sink.add_scalars(
                "Loss",
                &[("Train", train["loss"]), ("Val", valid["loss"])],
                epoch,
            )?;
            self.sink.add_scalars(
                "Accuracy",
                &[("Train", train["accuracy"]), ("Val", valid["accuracy"])],
                epoch,
            )?;

            let mut log = train.clone();
            log.extend(valid.iter().map(|(k, v)| (format!("val_{}", k), *v)));
            notify(&mut self.observers, &TrainingEvent::EpochFinished { epoch, log: &log });

            let val_accuracy = valid["accuracy"];
            let is_best = self.best_accuracy.map_or(true, |best| val_accuracy > best);
            if is_best {
                self.best_accuracy = Some(val_accuracy);
            }

            let state = self.optimization_state(epoch)?;
            let path = self.store.save(&state, is_best)?;
            notify(
                &mut self.observers,
                &TrainingEvent::CheckpointSaved {
                    epoch,
                    path: &path,
                    is_best,
                },
            );
            last_checkpoint = Some(path);

            if let Some(mirror) = self.context.mirror_dir() {
                mirror_dir(self.context.log_dir(), mirror)?;
            }

            epochs.push(EpochResult {
                epoch,
                train,
                valid,
                is_best,
            });
        }

        notify(
            &mut self.observers,
            &TrainingEvent::RunFinished {
                best_accuracy: self.best_accuracy,
            },
        );
        Ok(TrainingSummary {
            epochs,
            best_accuracy: self.best_accuracy,
            last_checkpoint,
        })
    }

    fn train_epoch(&mut self, epoch: usize) -> Result<BTreeMap<String, f64>> {
        self.train_metrics.reset();
        let batches = self.data.num_batches(Phase::Train);
        notify(
            &mut self.observers,
            &TrainingEvent::PhaseStarted {
                epoch,
                phase: Phase::Train,
                batches,
            },
        );

        let device = self.context.device().clone();
        for (batch_idx, batch) in self.data.batches(Phase::Train, epoch).enumerate() {
            let batch = batch?.to_device(&device)?;

            self.joint.zero_grad();
            let output = self.model.forward(&batch.inputs, Mode::Train)?;
            let primary = self
                .primary_loss
                .compute(&output.scores, &output.features, &batch.labels)?;
            let secondary = self.secondary_loss.compute(&output.features, &batch.labels)?;
            let loss = self.joint.combine(&primary, &secondary)?;

            self.joint.backward(&loss)?;
            self.joint.rescale_secondary(&self.center_params)?;
            self.joint
                .step(&mut self.optimizer, &mut self.optimizer_centerloss)?;

            let loss = scalar(&loss)?;
            let accuracy = batch_accuracy(&output.scores, &batch.labels)?;
            self.train_metrics.update("loss", loss)?;
            self.train_metrics.update("accuracy", accuracy)?;

            if self.schedule_step == ScheduleStep::Iteration {
                let lr = self.lr_scheduler.step();
                self.lr_scheduler.apply(&mut self.optimizer);
                tracing::trace!(epoch, batch = batch_idx, lr, "Stepped lr schedule");
            }

            notify(
                &mut self.observers,
                &TrainingEvent::BatchFinished {
                    epoch,
                    phase: Phase::Train,
                    batch: batch_idx,
                    loss: self.train_metrics.avg("loss")?,
                    accuracy: self.train_metrics.avg("accuracy")?,
                },
            );
        }

        notify(
            &mut self.observers,
            &TrainingEvent::PhaseFinished {
                epoch,
                phase: Phase::Train,
            },
        );
        self.train_metrics.result()
    }

    /// Validation pass; model and losses are only borrowed immutably
    pub fn validate(&mut self, epoch: usize) -> Result<BTreeMap<String, f64>> {
        let device = self.context.device().clone();
        validate_epoch(
            ValidationInputs {
                model: self.model.as_ref(),
                primary_loss: self.primary_loss.as_ref(),
                secondary_loss: self.secondary_loss.as_ref(),
                joint: &self.joint,
                device: &device,
            },
            self.data.as_mut(),
            &mut self.valid_metrics,
            &mut self.observers,
            epoch,
        )
    }

    fn step_schedule(&mut self) {
        let lr = self.lr_scheduler.step();
        self.lr_scheduler.apply(&mut self.optimizer);
        tracing::debug!(
            last_epoch = self.lr_scheduler.last_epoch(),
            lr,
            "Stepped lr schedule"
        );
    }

    fn optimization_state(&self, epoch: usize) -> Result<OptimizationState> {
        Ok(OptimizationState {
            epoch,
            model: snapshot_parameters(&self.model_params)?,
            center_loss: snapshot_parameters(&self.center_params)?,
            optimizer: self.optimizer.export_state()?,
            optimizer_centerloss: self.optimizer_centerloss.export_state()?,
            lr_scheduler: self.lr_scheduler.state(),
            best_accuracy: self.best_accuracy,
            run_id: self.context.run_id().to_string(),
        })
    }
}

/// Read-only collaborators of a validation pass
struct ValidationInputs<'a> {
    model: &'a dyn EmbeddingModel,
    primary_loss: &'a dyn PrimaryLoss,
    secondary_loss: &'a dyn SecondaryLoss,
    joint: &'a JointStep,
    device: &'a Device,
}

fn validate_epoch(
    inputs: ValidationInputs<'_>,
    data: &mut dyn BatchSource,
    tracker: &mut MetricTracker,
    observers: &mut [Box<dyn TrainingObserver>],
    epoch: usize,
) -> Result<BTreeMap<String, f64>> {
    tracker.reset();
    notify(
        observers,
        &TrainingEvent::PhaseStarted {
            epoch,
            phase: Phase::Validation,
            batches: data.num_batches(Phase::Validation),
        },
    );

    for (batch_idx, batch) in data.batches(Phase::Validation, epoch).enumerate() {
        let batch = batch?.to_device(inputs.device)?;
        let output = inputs.model.forward(&batch.inputs, Mode::Eval)?;
        let scores = output.scores.detach();
        let features = output.features.detach();

        let primary = inputs
            .primary_loss
            .compute(&scores, &features, &batch.labels)?;
        let secondary = inputs.secondary_loss.compute(&features, &batch.labels)?;
        let loss = scalar(&inputs.joint.combine(&primary, &secondary)?)?;
        let accuracy = batch_accuracy(&scores, &batch.labels)?;

        tracker.update("loss", loss)?;
        tracker.update("accuracy", accuracy)?;
        notify(
            observers,
            &TrainingEvent::BatchFinished {
                epoch,
                phase: Phase::Validation,
                batch: batch_idx,
                loss: tracker.avg("loss")?,
                accuracy: tracker.avg("accuracy")?,
            },
        );
    }

    notify(
        observers,
        &TrainingEvent::PhaseFinished {
            epoch,
            phase: Phase::Validation,
        },
    );
    tracker.result()
}

fn notify(observers: &mut [Box<dyn TrainingObserver>], event: &TrainingEvent<'_>) {
    for observer in observers.iter_mut() {
        observer.on_event(event);
    }
}

/// Fraction of rows whose argmax matches the label
fn batch_accuracy(scores: &Tensor, labels: &Tensor) -> Result<f64> {
    let preds = scores.argmax(D::Minus1)?;
    let correct = preds
        .eq(&labels.to_dtype(preds.dtype())?)?
        .to_dtype(DType::F32)?
        .mean_all()?;
    scalar(&correct)
}

fn scalar(t: &Tensor) -> Result<f64> {
    Ok(t.to_dtype(DType::F64)?.to_scalar::<f64>()?)
}

/// Copy saved tensors into live parameters, matching by name
fn restore_parameters(
    params: &[(String, Var)],
    saved: &BTreeMap<String, Tensor>,
    path: &Path,
    group: &str,
) -> Result<()> {
    for (name, var) in params {
        let tensor = saved.get(name).ok_or_else(|| {
            TrainError::incompatible(path, format!("{} parameter '{}' missing", group, name))
        })?;
        if tensor.dims() != var.dims() {
            return Err(TrainError::incompatible(
                path,
                format!(
                    "{} parameter '{}' has shape {:?}, expected {:?}",
                    group,
                    name,
                    tensor.dims(),
                    var.dims()
                ),
            ));
        }
        var.set(&tensor.to_device(var.device())?.to_dtype(var.dtype())?)?;
    }
    if saved.len() > params.len() {
        tracing::warn!(
            group,
            saved = saved.len(),
            expected = params.len(),
            "Checkpoint has extra parameters"
        );
    }
    Ok(())
}
