// Loss functions
// Primary (classification + metric learning) and secondary (center) objectives

mod center;
mod softmax_triplet;

pub use center::{CenterLoss, CENTERS};
pub use softmax_triplet::SoftmaxTripletLoss;

use candle_core::{Tensor, Var};

use crate::errors::Result;

/// `(scores, features, labels) -> scalar`
pub trait PrimaryLoss {
    fn compute(&self, scores: &Tensor, features: &Tensor, labels: &Tensor) -> Result<Tensor>;
}

/// `(features, labels) -> scalar`, with its own learnable parameters
pub trait SecondaryLoss {
    fn compute(&self, features: &Tensor, labels: &Tensor) -> Result<Tensor>;

    /// Parameters optimized by the secondary optimizer
    fn parameters(&self) -> Vec<(String, Var)>;
}
