// Batch sources
// The trainer pulls ordered, finite batch iterators per phase from a `BatchSource`

mod synthetic;

pub use synthetic::SyntheticReid;

use candle_core::{Device, Tensor};

use crate::errors::Result;

/// Which split a pass iterates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Train,
    Validation,
}

impl Phase {
    pub fn label(self) -> &'static str {
        match self {
            Phase::Train => "Train",
            Phase::Validation => "Val",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// One mini-batch
#[derive(Debug, Clone)]
pub struct Batch {
    /// `(batch, input_dim)`
    pub inputs: Tensor,
    /// Identity labels, `u32`, `(batch,)`
    pub labels: Tensor,
    /// Sample ids within the split
    pub ids: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Copy inputs and labels to `device`
    pub fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            inputs: self.inputs.to_device(device)?,
            labels: self.labels.to_device(device)?,
            ids: self.ids.clone(),
        })
    }
}

/// Blocking, ordered, finite batch iterator per phase
pub trait BatchSource {
    fn num_batches(&self, phase: Phase) -> usize;

    /// Start a new pass over `phase` for the 1-based `epoch`
    ///
    /// Any train order must depend only on `epoch`, so a resumed run sees the
    /// same batches the uninterrupted run would have.
    fn batches(&mut self, phase: Phase, epoch: usize) -> Box<dyn Iterator<Item = Result<Batch>> + '_>;

    fn num_classes(&self) -> usize;
}
