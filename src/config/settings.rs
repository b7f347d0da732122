// Configuration structs
//
// Every section is optional in the TOML file; missing keys fall back to the
// defaults below (the re-id strong-baseline settings scaled down to the
// synthetic data source).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::errors::{Result, TrainError};

/// Top-level training configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Use the `[trainer_colab]` section instead of `[trainer]`
    pub colab: bool,
    /// Checkpoint to resume from (empty = fresh run)
    pub resume: String,
    /// Seed for parameter init, shuffling and synthetic data
    pub seed: u64,
    pub trainer: TrainerSettings,
    pub trainer_colab: TrainerSettings,
    pub data: DataSettings,
    pub model: ModelSettings,
    pub losses: LossSettings,
    pub optimizer: OptimizerSettings,
    pub lr_scheduler: SchedulerSettings,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            colab: false,
            resume: String::new(),
            seed: 42,
            trainer: TrainerSettings::default(),
            trainer_colab: TrainerSettings {
                log_dir_saved: "drive/saved/logs".to_string(),
                use_gpu: true,
                ..TrainerSettings::default()
            },
            data: DataSettings::default(),
            model: ModelSettings::default(),
            losses: LossSettings::default(),
            optimizer: OptimizerSettings::default(),
            lr_scheduler: SchedulerSettings::default(),
        }
    }
}

impl TrainConfig {
    /// Trainer section selected by the `colab` flag
    pub fn trainer_settings(&self) -> &TrainerSettings {
        if self.colab {
            &self.trainer_colab
        } else {
            &self.trainer
        }
    }

    pub fn trainer_settings_mut(&mut self) -> &mut TrainerSettings {
        if self.colab {
            &mut self.trainer_colab
        } else {
            &mut self.trainer
        }
    }

    /// Resume path, if one is configured
    pub fn resume_path(&self) -> Option<PathBuf> {
        let trimmed = self.resume.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(PathBuf::from(trimmed))
        }
    }

    /// Reject settings the trainer cannot run with
    pub fn validate(&self) -> Result<()> {
        let trainer = self.trainer_settings();
        if trainer.epochs == 0 {
            return Err(TrainError::config("trainer.epochs must be at least 1"));
        }
        if self.data.batch_size == 0 {
            return Err(TrainError::config("data.batch_size must be at least 1"));
        }
        if self.data.num_classes < 2 {
            return Err(TrainError::config("data.num_classes must be at least 2"));
        }
        if !(self.losses.beta > 0.0 && self.losses.beta.is_finite()) {
            return Err(TrainError::config(format!(
                "losses.beta must be positive, got {}",
                self.losses.beta
            )));
        }
        if !(0.0..1.0).contains(&self.losses.epsilon) {
            return Err(TrainError::config("losses.epsilon must be in [0, 1)"));
        }
        if self.optimizer.lr <= 0.0 || self.optimizer.center_lr <= 0.0 {
            return Err(TrainError::config("optimizer learning rates must be positive"));
        }
        self.lr_scheduler.validate()
    }
}

/// When the lr schedule advances
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleStep {
    /// Once per epoch, after training and before validation
    Epoch,
    /// After every training batch
    Iteration,
}

/// Output locations and run length
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerSettings {
    pub epochs: usize,
    pub checkpoint_dir: String,
    pub log_dir: String,
    /// Secondary location the log dir is mirrored to (empty = disabled)
    pub log_dir_saved: String,
    pub use_gpu: bool,
    pub schedule_step: ScheduleStep,
}

impl Default for TrainerSettings {
    fn default() -> Self {
        Self {
            epochs: 120,
            checkpoint_dir: "saved/checkpoints".to_string(),
            log_dir: "saved/logs".to_string(),
            log_dir_saved: String::new(),
            use_gpu: false,
            schedule_step: ScheduleStep::Epoch,
        }
    }
}

/// Synthetic identity data
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSettings {
    pub batch_size: usize,
    pub num_classes: usize,
    pub train_per_class: usize,
    pub val_per_class: usize,
    pub input_dim: usize,
    /// Standard deviation of samples around their identity center
    pub noise: f32,
}

impl Default for DataSettings {
    fn default() -> Self {
        Self {
            batch_size: 32,
            num_classes: 16,
            train_per_class: 16,
            val_per_class: 4,
            input_dim: 64,
            noise: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    pub feature_dim: usize,
    pub dropout: f32,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            feature_dim: 128,
            dropout: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LossSettings {
    /// Triplet margin
    pub margin: f64,
    /// Label smoothing factor
    pub epsilon: f64,
    /// Center loss weight
    pub beta: f64,
}

impl Default for LossSettings {
    fn default() -> Self {
        Self {
            margin: 0.3,
            epsilon: 0.1,
            beta: 0.0005,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerSettings {
    pub lr: f64,
    pub weight_decay: f64,
    /// SGD learning rate for the center parameters
    pub center_lr: f64,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            lr: 0.00035,
            weight_decay: 0.0005,
            center_lr: 0.5,
        }
    }
}

/// Warmup + multi-step decay
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Milestones (strictly increasing)
    pub steps: Vec<usize>,
    pub gamma: f64,
    /// Warmup factor
    pub factor: f64,
    /// Warmup iterations
    pub iters: usize,
    /// "linear" or "constant"
    pub method: String,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            steps: vec![40, 70],
            gamma: 0.1,
            factor: 0.01,
            iters: 10,
            method: "linear".to_string(),
        }
    }
}

impl SchedulerSettings {
    pub fn validate(&self) -> Result<()> {
        crate::optim::WarmupMethod::parse(&self.method)?;
        if let Some(pair) = self.steps.windows(2).find(|w| w[0] >= w[1]) {
            return Err(TrainError::InvalidSchedule(format!(
                "milestones must be strictly increasing, found {} before {}",
                pair[0], pair[1]
            )));
        }
        if !(self.gamma > 0.0) {
            return Err(TrainError::InvalidSchedule(format!(
                "gamma must be positive, got {}",
                self.gamma
            )));
        }
        if !(self.factor > 0.0 && self.factor <= 1.0) {
            return Err(TrainError::InvalidSchedule(format!(
                "warmup factor must be in (0, 1], got {}",
                self.factor
            )));
        }
        Ok(())
    }
}
