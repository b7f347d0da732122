// Common model utilities and types

use candle_core::{Device, Shape, Tensor, Var};
use rand::rngs::StdRng;
use rand::Rng;

use crate::errors::Result;

/// Train/eval switch for layers whose behaviour depends on it (dropout)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
}

impl Mode {
    pub fn is_train(self) -> bool {
        matches!(self, Mode::Train)
    }
}

/// Output of one forward pass
#[derive(Debug, Clone)]
pub struct ModelOutput {
    /// Class logits, `(batch, num_classes)`
    pub scores: Tensor,
    /// Embedding used by the metric losses, `(batch, feature_dim)`
    pub features: Tensor,
}

/// Embedding network consumed by the trainer
pub trait EmbeddingModel {
    fn forward(&self, inputs: &Tensor, mode: Mode) -> Result<ModelOutput>;

    /// Learnable parameters, sorted by name
    fn parameters(&self) -> Vec<(String, Var)>;

    fn feature_dim(&self) -> usize;
}

/// Uniform(-bound, bound) init
pub(crate) fn uniform_var<S: Into<Shape>>(
    rng: &mut StdRng,
    shape: S,
    bound: f32,
    device: &Device,
) -> Result<Var> {
    let shape = shape.into();
    let data: Vec<f32> = (0..shape.elem_count())
        .map(|_| rng.gen_range(-bound..bound))
        .collect();
    Ok(Var::from_tensor(&Tensor::from_vec(data, shape, device)?)?)
}

/// Standard normal samples (Box-Muller)
pub(crate) fn normal_samples(rng: &mut StdRng, n: usize) -> Vec<f32> {
    (0..n)
        .map(|_| {
            let u1: f32 = 1.0 - rng.gen::<f32>();
            let u2: f32 = rng.gen();
            (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos()
        })
        .collect()
}

/// Standard normal init
pub(crate) fn normal_var<S: Into<Shape>>(rng: &mut StdRng, shape: S, device: &Device) -> Result<Var> {
    let shape = shape.into();
    let data = normal_samples(rng, shape.elem_count());
    Ok(Var::from_tensor(&Tensor::from_vec(data, shape, device)?)?)
}

/// Deep copies of parameter values, keyed by name
pub fn snapshot_parameters(
    params: &[(String, Var)],
) -> Result<std::collections::BTreeMap<String, Tensor>> {
    params
        .iter()
        .map(|(name, var)| Ok((name.clone(), var.as_tensor().copy()?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_init_is_seeded() {
        let mut a = StdRng::seed_from_u64(7);
        let mut b = StdRng::seed_from_u64(7);
        let x = uniform_var(&mut a, (3, 4), 0.5, &Device::Cpu).unwrap();
        let y = uniform_var(&mut b, (3, 4), 0.5, &Device::Cpu).unwrap();
        assert_eq!(
            x.as_tensor().to_vec2::<f32>().unwrap(),
            y.as_tensor().to_vec2::<f32>().unwrap()
        );
        assert!(x
            .as_tensor()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap()
            .iter()
            .all(|v| v.abs() < 0.5));
    }

    #[test]
    fn test_normal_samples_are_finite() {
        let mut rng = StdRng::seed_from_u64(1);
        let samples = normal_samples(&mut rng, 1000);
        assert!(samples.iter().all(|v| v.is_finite()));
        let mean = samples.iter().sum::<f32>() / samples.len() as f32;
        assert!(mean.abs() < 0.2);
    }
}
