// Joint optimization step
//
// One backward over `primary + beta * secondary` feeds two optimizers. The
// secondary parameters' gradients are divided by beta before stepping, so
// beta weights their influence on the shared features but not their own
// update size.

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::Optimizer;

use crate::errors::{Result, TrainError};

/// Stages of one joint step, in the only order they may happen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStage {
    Cleared,
    Backward,
    Rescaled,
    PrimaryStepped,
    SecondaryStepped,
}

pub struct JointStep {
    beta: f64,
    grads: Option<GradStore>,
    stages: Vec<StepStage>,
}

impl JointStep {
    pub fn new(beta: f64) -> Result<Self> {
        if !(beta > 0.0 && beta.is_finite()) {
            return Err(TrainError::config(format!(
                "losses.beta must be positive, got {}",
                beta
            )));
        }
        Ok(Self {
            beta,
            grads: None,
            stages: Vec::new(),
        })
    }

    pub fn beta(&self) -> f64 {
        self.beta
    }

    /// Stages completed since the last `zero_grad`
    pub fn stages(&self) -> &[StepStage] {
        &self.stages
    }

    /// Gradients of the current step, once `backward` has run
    pub fn grads(&self) -> Option<&GradStore> {
        self.grads.as_ref()
    }

    /// `primary + beta * secondary`
    pub fn combine(&self, primary: &Tensor, secondary: &Tensor) -> Result<Tensor> {
        Ok(primary.add(&secondary.affine(self.beta, 0.0)?)?)
    }

    /// Drop the gradients of the previous step for both optimizers
    pub fn zero_grad(&mut self) {
        self.grads = None;
        self.stages.clear();
        self.stages.push(StepStage::Cleared);
    }

    pub fn backward(&mut self, loss: &Tensor) -> Result<()> {
        self.expect_last(StepStage::Cleared, "backward")?;
        self.grads = Some(loss.backward()?);
        self.stages.push(StepStage::Backward);
        Ok(())
    }

    /// Scale the secondary parameters' gradients by `1 / beta`
    pub fn rescale_secondary(&mut self, params: &[(String, Var)]) -> Result<()> {
        self.expect_last(StepStage::Backward, "rescale")?;
        let scale = 1.0 / self.beta;
        let grads = self.grads_mut()?;
        for (name, var) in params {
            match grads.remove(var) {
                Some(grad) => {
                    let scaled = grad.affine(scale, 0.0)?;
                    grads.insert(var, scaled);
                }
                None => tracing::debug!(param = %name, "No gradient for secondary parameter"),
            }
        }
        self.stages.push(StepStage::Rescaled);
        Ok(())
    }

    pub fn step_primary<O: Optimizer>(&mut self, optimizer: &mut O) -> Result<()> {
        self.expect_last(StepStage::Rescaled, "primary step")?;
        optimizer.step(self.grads_ref()?)?;
        self.stages.push(StepStage::PrimaryStepped);
        Ok(())
    }

    pub fn step_secondary<O: Optimizer>(&mut self, optimizer: &mut O) -> Result<()> {
        self.expect_last(StepStage::PrimaryStepped, "secondary step")?;
        optimizer.step(self.grads_ref()?)?;
        self.stages.push(StepStage::SecondaryStepped);
        Ok(())
    }

    /// Primary then secondary
    pub fn step<P: Optimizer, S: Optimizer>(&mut self, primary: &mut P, secondary: &mut S) -> Result<()> {
        self.step_primary(primary)?;
        self.step_secondary(secondary)
    }

    fn expect_last(&self, required: StepStage, action: &str) -> Result<()> {
        match self.stages.last() {
            Some(stage) if *stage == required => Ok(()),
            Some(stage) => Err(TrainError::StepOrder(format!(
                "{} requires stage {:?}, current stage is {:?}",
                action, required, stage
            ))),
            None => Err(TrainError::StepOrder(format!(
                "{} before zero_grad",
                action
            ))),
        }
    }

    fn grads_ref(&self) -> Result<&GradStore> {
        self.grads
            .as_ref()
            .ok_or_else(|| TrainError::StepOrder("no gradients computed".to_string()))
    }

    fn grads_mut(&mut self) -> Result<&mut GradStore> {
        self.grads
            .as_mut()
            .ok_or_else(|| TrainError::StepOrder("no gradients computed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optim::{ParamsSgd, Sgd};
    use candle_core::{DType, Device};

    fn center_delta(beta: f64) -> Vec<Vec<f32>> {
        let dev = Device::Cpu;
        let weight = Var::new(&[[1.0f32, -1.0], [0.5, 2.0]], &dev).unwrap();
        let centers = Var::new(&[[0.0f32, 0.0]], &dev).unwrap();
        let before = centers.as_tensor().to_vec2::<f32>().unwrap();

        let inputs = Tensor::new(&[[1.0f32, 2.0]], &dev).unwrap();
        let features = inputs.matmul(&weight.as_tensor().t().unwrap()).unwrap();
        let primary = features.sqr().unwrap().sum_all().unwrap();
        let secondary = features
            .sub(centers.as_tensor())
            .unwrap()
            .sqr()
            .unwrap()
            .sum_all()
            .unwrap();

        let mut primary_opt = Sgd::with_named(
            vec![("weight".to_string(), weight.clone())],
            ParamsSgd::new(0.01),
        )
        .unwrap();
        let center_params = vec![("centers".to_string(), centers.clone())];
        let mut center_opt = Sgd::with_named(center_params.clone(), ParamsSgd::new(0.5)).unwrap();

        let mut joint = JointStep::new(beta).unwrap();
        joint.zero_grad();
        let loss = joint.combine(&primary, &secondary).unwrap();
        joint.backward(&loss).unwrap();
        joint.rescale_secondary(&center_params).unwrap();
        joint.step(&mut primary_opt, &mut center_opt).unwrap();

        let after = centers.as_tensor().to_vec2::<f32>().unwrap();
        after
            .iter()
            .zip(&before)
            .map(|(a, b)| a.iter().zip(b).map(|(x, y)| x - y).collect())
            .collect()
    }

    #[test]
    fn test_center_update_independent_of_beta() {
        let small = center_delta(0.0005);
        let large = center_delta(1.0);
        for (a, b) in small[0].iter().zip(&large[0]) {
            assert!((a - b).abs() < 1e-3 * b.abs().max(1.0), "{} vs {}", a, b);
        }
        assert!(small[0].iter().any(|d| d.abs() > 0.0));
    }

    #[test]
    fn test_stage_order_recorded() {
        let dev = Device::Cpu;
        let w = Var::ones((2,), DType::F32, &dev).unwrap();
        let c = Var::ones((2,), DType::F32, &dev).unwrap();
        let params = vec![("c".to_string(), c.clone())];
        let mut p_opt = Sgd::with_named(vec![("w".to_string(), w.clone())], ParamsSgd::new(0.1)).unwrap();
        let mut c_opt = Sgd::with_named(params.clone(), ParamsSgd::new(0.1)).unwrap();

        let mut joint = JointStep::new(0.5).unwrap();
        joint.zero_grad();
        let loss = joint
            .combine(
                &w.as_tensor().sum_all().unwrap(),
                &w.as_tensor().mul(c.as_tensor()).unwrap().sum_all().unwrap(),
            )
            .unwrap();
        joint.backward(&loss).unwrap();
        joint.rescale_secondary(&params).unwrap();
        joint.step(&mut p_opt, &mut c_opt).unwrap();

        assert_eq!(
            joint.stages(),
            &[
                StepStage::Cleared,
                StepStage::Backward,
                StepStage::Rescaled,
                StepStage::PrimaryStepped,
                StepStage::SecondaryStepped,
            ]
        );
    }

    #[test]
    fn test_rescale_touches_only_secondary_grads() {
        let dev = Device::Cpu;
        let w = Var::ones((2,), DType::F32, &dev).unwrap();
        let c = Var::ones((2,), DType::F32, &dev).unwrap();
        let params = vec![("c".to_string(), c.clone())];

        let mut joint = JointStep::new(0.25).unwrap();
        assert_eq!(joint.beta(), 0.25);
        joint.zero_grad();
        assert!(joint.grads().is_none());

        // d/dw = 1 + beta * c, d/dc = beta * w
        let loss = joint
            .combine(
                &w.as_tensor().sum_all().unwrap(),
                &w.as_tensor().mul(c.as_tensor()).unwrap().sum_all().unwrap(),
            )
            .unwrap();
        joint.backward(&loss).unwrap();
        let raw_c = joint.grads().unwrap().get(&c).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(raw_c, vec![0.25, 0.25]);

        joint.rescale_secondary(&params).unwrap();
        let grads = joint.grads().unwrap();
        assert_eq!(grads.get(&c).unwrap().to_vec1::<f32>().unwrap(), vec![1.0, 1.0]);
        assert_eq!(grads.get(&w).unwrap().to_vec1::<f32>().unwrap(), vec![1.25, 1.25]);
    }

    #[test]
    fn test_out_of_order_rejected() {
        let dev = Device::Cpu;
        let w = Var::ones((2,), DType::F32, &dev).unwrap();
        let mut opt = Sgd::with_named(vec![("w".to_string(), w.clone())], ParamsSgd::new(0.1)).unwrap();
        let loss = w.as_tensor().sum_all().unwrap();

        let mut joint = JointStep::new(1.0).unwrap();
        assert!(matches!(joint.backward(&loss), Err(TrainError::StepOrder(_))));

        joint.zero_grad();
        joint.backward(&loss).unwrap();
        // Second backward without clearing
        assert!(matches!(joint.backward(&loss), Err(TrainError::StepOrder(_))));
        // Stepping before the rescale
        assert!(matches!(joint.step_primary(&mut opt), Err(TrainError::StepOrder(_))));
    }

    #[test]
    fn test_non_positive_beta_rejected() {
        assert!(JointStep::new(0.0).is_err());
        assert!(JointStep::new(-1.0).is_err());
        assert!(JointStep::new(f64::NAN).is_err());
    }
}
