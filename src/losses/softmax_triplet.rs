// Label-smoothed cross entropy + batch-hard triplet loss

use candle_core::{DType, Tensor, D};

use super::PrimaryLoss;
use crate::errors::{Result, TrainError};

/// Offset that keeps same-identity pairs out of the hardest-negative search
const POSITIVE_MASK_OFFSET: f64 = 1e6;

#[derive(Debug, Clone)]
pub struct SoftmaxTripletLoss {
    num_classes: usize,
    margin: f64,
    epsilon: f64,
}

impl SoftmaxTripletLoss {
    pub fn new(num_classes: usize, margin: f64, epsilon: f64) -> Self {
        Self {
            num_classes,
            margin,
            epsilon,
        }
    }

    /// Cross entropy against `(1 - eps) * one_hot + eps / num_classes`
    pub fn cross_entropy(&self, scores: &Tensor, labels: &Tensor) -> Result<Tensor> {
        let (batch, classes) = scores.dims2()?;
        if classes != self.num_classes {
            return Err(TrainError::model(format!(
                "scores have {} classes, loss expects {}",
                classes, self.num_classes
            )));
        }

        let off = (self.epsilon / classes as f64) as f32;
        let on = (1.0 - self.epsilon) as f32 + off;
        let mut targets = vec![off; batch * classes];
        for (row, label) in labels.to_vec1::<u32>()?.into_iter().enumerate() {
            let label = label as usize;
            if label >= classes {
                return Err(TrainError::data(format!(
                    "label {} out of range for {} classes",
                    label, classes
                )));
            }
            targets[row * classes + label] = on;
        }
        let targets = Tensor::from_vec(targets, (batch, classes), scores.device())?;

        let log_probs = candle_nn::ops::log_softmax(scores, D::Minus1)?;
        Ok(targets.mul(&log_probs)?.sum(1)?.mean(0)?.neg()?)
    }

    /// Batch-hard triplet: hardest positive vs hardest negative per anchor
    pub fn triplet(&self, features: &Tensor, labels: &Tensor) -> Result<Tensor> {
        let n = features.dim(0)?;
        let dist = pairwise_distance(features)?;

        let is_pos = labels
            .reshape((n, 1))?
            .broadcast_eq(&labels.reshape((1, n))?)?
            .to_dtype(DType::F32)?;

        let dist_ap = dist.mul(&is_pos)?.max(1)?;
        let dist_an = dist
            .add(&is_pos.affine(POSITIVE_MASK_OFFSET, 0.0)?)?
            .min(1)?;

        Ok(dist_ap
            .sub(&dist_an)?
            .affine(1.0, self.margin)?
            .relu()?
            .mean(0)?)
    }
}

impl PrimaryLoss for SoftmaxTripletLoss {
    fn compute(&self, scores: &Tensor, features: &Tensor, labels: &Tensor) -> Result<Tensor> {
        let ce = self.cross_entropy(scores, labels)?;
        let triplet = self.triplet(features, labels)?;
        Ok(ce.add(&triplet)?)
    }
}

/// Euclidean distance matrix, clamped away from zero before the sqrt
fn pairwise_distance(features: &Tensor) -> Result<Tensor> {
    let sq = features.sqr()?.sum_keepdim(1)?;
    let gram = features.matmul(&features.t()?)?;
    let dist = sq
        .broadcast_add(&sq.t()?)?
        .sub(&gram.affine(2.0, 0.0)?)?
        .clamp(1e-12f32, f32::MAX)?
        .sqrt()?;
    Ok(dist)
}
