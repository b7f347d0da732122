// Warmup + multi-step decay learning-rate schedule
//
// The multiplier is a pure function of the iteration index; the only mutable
// state is `last_epoch`.

use candle_nn::Optimizer;
use serde::{Deserialize, Serialize};

use crate::config::SchedulerSettings;
use crate::errors::{Result, TrainError};

/// Shape of the warmup ramp
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WarmupMethod {
    /// Hold at the warmup factor until warmup ends
    Constant,
    /// Ramp linearly from the warmup factor to 1
    Linear,
}

impl WarmupMethod {
    pub fn parse(method: &str) -> Result<Self> {
        match method {
            "constant" => Ok(Self::Constant),
            "linear" => Ok(Self::Linear),
            other => Err(TrainError::InvalidSchedule(format!(
                "warmup method must be 'constant' or 'linear', got '{}'",
                other
            ))),
        }
    }
}

/// Checkpointed schedule state
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScheduleState {
    pub last_epoch: usize,
    pub base_lr: f64,
}

#[derive(Debug, Clone)]
pub struct WarmupMultiStepLr {
    base_lr: f64,
    milestones: Vec<usize>,
    gamma: f64,
    warmup_factor: f64,
    warmup_iters: usize,
    warmup_method: WarmupMethod,
    last_epoch: usize,
}

impl WarmupMultiStepLr {
    pub fn new(base_lr: f64, settings: &SchedulerSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            base_lr,
            milestones: settings.steps.clone(),
            gamma: settings.gamma,
            warmup_factor: settings.factor,
            warmup_iters: settings.iters,
            warmup_method: WarmupMethod::parse(&settings.method)?,
            last_epoch: 0,
        })
    }

    /// Multiplier applied to the base lr at iteration `t`
    pub fn multiplier(&self, t: usize) -> f64 {
        if t < self.warmup_iters {
            return match self.warmup_method {
                // Stays at warmup_factor for the whole window
                WarmupMethod::Constant => self.warmup_factor,
                WarmupMethod::Linear => {
                    let alpha = t as f64 / self.warmup_iters as f64;
                    self.warmup_factor + (1.0 - self.warmup_factor) * alpha
                }
            };
        }
        let passed = self.milestones.partition_point(|&m| m <= t);
        self.gamma.powi(passed as i32)
    }

    /// Current iteration index
    pub fn last_epoch(&self) -> usize {
        self.last_epoch
    }

    /// Learning rate at the current index
    pub fn current_lr(&self) -> f64 {
        self.base_lr * self.multiplier(self.last_epoch)
    }

    /// Advance one iteration and return the new learning rate
    pub fn step(&mut self) -> f64 {
        self.last_epoch += 1;
        self.current_lr()
    }

    /// Write the current learning rate into an optimizer
    pub fn apply<O: Optimizer>(&self, optimizer: &mut O) {
        optimizer.set_learning_rate(self.current_lr());
    }

    pub fn state(&self) -> ScheduleState {
        ScheduleState {
            last_epoch: self.last_epoch,
            base_lr: self.base_lr,
        }
    }

    pub fn load_state(&mut self, state: ScheduleState) {
        self.last_epoch = state.last_epoch;
        self.base_lr = state.base_lr;
    }
}
