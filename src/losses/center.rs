// Center loss with learnable per-class centers

use candle_core::{Device, Tensor, Var};
use rand::rngs::StdRng;

use super::SecondaryLoss;
use crate::errors::{Result, TrainError};
use crate::models::common::normal_var;

/// Checkpoint name of the centers parameter
pub const CENTERS: &str = "centers";

pub struct CenterLoss {
    centers: Var,
    num_classes: usize,
    feature_dim: usize,
}

impl CenterLoss {
    /// Centers start as standard normal samples
    pub fn new(
        num_classes: usize,
        feature_dim: usize,
        rng: &mut StdRng,
        device: &Device,
    ) -> Result<Self> {
        Ok(Self {
            centers: normal_var(rng, (num_classes, feature_dim), device)?,
            num_classes,
            feature_dim,
        })
    }

    pub fn centers(&self) -> &Var {
        &self.centers
    }
}

impl SecondaryLoss for CenterLoss {
    /// Mean squared distance of each feature to its class center
    fn compute(&self, features: &Tensor, labels: &Tensor) -> Result<Tensor> {
        let (_, dim) = features.dims2()?;
        if dim != self.feature_dim {
            return Err(TrainError::model(format!(
                "features have dim {}, centers have {}",
                dim, self.feature_dim
            )));
        }
        if let Some(max) = labels.to_vec1::<u32>()?.into_iter().max() {
            if max as usize >= self.num_classes {
                return Err(TrainError::data(format!(
                    "label {} out of range for {} centers",
                    max, self.num_classes
                )));
            }
        }

        let batch_centers = self.centers.index_select(labels, 0)?;
        let dist = features
            .sub(&batch_centers)?
            .sqr()?
            .sum(1)?
            .clamp(1e-12f32, 1e12f32)?;
        Ok(dist.mean(0)?)
    }

    fn parameters(&self) -> Vec<(String, Var)> {
        vec![(CENTERS.to_string(), self.centers.clone())]
    }
}
