// Optimizers and learning-rate schedule
//
// candle_nn's own AdamW/SGD keep their moment buffers private, which makes
// them impossible to checkpoint. These implement the same `Optimizer` trait
// and expose their state as named tensors.

mod adam;
mod scheduler;
mod sgd;

pub use adam::{Adam, ParamsAdam};
pub use scheduler::{ScheduleState, WarmupMethod, WarmupMultiStepLr};
pub use sgd::{ParamsSgd, Sgd};

use candle_core::{Tensor, Var};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::errors::{Result, TrainError};

/// Scalar part of an optimizer's state (stored in the checkpoint header)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OptimizerScalars {
    pub learning_rate: f64,
    pub step: u64,
}

/// Full optimizer state: scalars plus named buffers
#[derive(Debug, Clone)]
pub struct OptimizerState {
    pub scalars: OptimizerScalars,
    /// `<buffer kind>.<parameter name>` → tensor snapshot
    pub buffers: BTreeMap<String, Tensor>,
}

/// Optimizers whose internal state survives a checkpoint
pub trait StatefulOptimizer: candle_nn::Optimizer {
    /// Snapshot of the current state (buffers are deep copies)
    fn export_state(&self) -> Result<OptimizerState>;

    /// Restore a snapshot taken from an optimizer over the same parameters
    fn import_state(&mut self, state: &OptimizerState) -> Result<()>;
}

/// Parameter with the name it is checkpointed under
pub(crate) struct NamedVar {
    pub name: String,
    pub var: Var,
}

/// Name unnamed vars by position
pub(crate) fn index_named(vars: Vec<Var>) -> Vec<(String, Var)> {
    vars.into_iter()
        .enumerate()
        .map(|(i, var)| (format!("p{}", i), var))
        .collect()
}

/// Copy a stored buffer into `target`, checking it exists
pub(crate) fn restore_buffer(
    buffers: &BTreeMap<String, Tensor>,
    key: &str,
    target: &Var,
) -> Result<()> {
    let saved = buffers
        .get(key)
        .ok_or_else(|| TrainError::model(format!("optimizer buffer '{}' missing", key)))?;
    target.set(&saved.to_device(target.device())?.to_dtype(target.dtype())?)?;
    Ok(())
}
