// Adam with L2 weight decay (decay added to the gradient, not decoupled)

use candle_core::backprop::GradStore;
use candle_core::Var;
use candle_nn::Optimizer;
use std::collections::BTreeMap;

use super::{
    index_named, restore_buffer, NamedVar, OptimizerScalars, OptimizerState, StatefulOptimizer,
};
use crate::errors::Result;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamsAdam {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

impl Default for ParamsAdam {
    fn default() -> Self {
        Self {
            lr: 0.001,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
        }
    }
}

struct AdamVar {
    param: NamedVar,
    exp_avg: Var,
    exp_avg_sq: Var,
}

/// Adam optimizer over named parameters
pub struct Adam {
    vars: Vec<AdamVar>,
    step_t: u64,
    params: ParamsAdam,
}

impl Adam {
    /// Build over parameters that keep their checkpoint names
    pub fn with_named(vars: Vec<(String, Var)>, params: ParamsAdam) -> candle_core::Result<Self> {
        let vars = vars
            .into_iter()
            .filter(|(_, var)| var.dtype().is_float())
            .map(|(name, var)| {
                let exp_avg = Var::zeros(var.shape(), var.dtype(), var.device())?;
                let exp_avg_sq = Var::zeros(var.shape(), var.dtype(), var.device())?;
                Ok(AdamVar {
                    param: NamedVar { name, var },
                    exp_avg,
                    exp_avg_sq,
                })
            })
            .collect::<candle_core::Result<Vec<_>>>()?;

        Ok(Self {
            vars,
            step_t: 0,
            params,
        })
    }

    pub fn params(&self) -> &ParamsAdam {
        &self.params
    }

    /// Number of steps taken so far
    pub fn step_count(&self) -> u64 {
        self.step_t
    }
}

impl Optimizer for Adam {
    type Config = ParamsAdam;

    fn new(vars: Vec<Var>, params: ParamsAdam) -> candle_core::Result<Self> {
        Self::with_named(index_named(vars), params)
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }

    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        self.step_t += 1;
        let ParamsAdam {
            lr,
            beta1,
            beta2,
            eps,
            weight_decay,
        } = self.params;
        let bias_correction1 = 1.0 - beta1.powf(self.step_t as f64);
        let bias_correction2 = 1.0 - beta2.powf(self.step_t as f64);

        for v in &self.vars {
            let theta = &v.param.var;
            let Some(grad) = grads.get(theta) else {
                continue;
            };
            let grad = if weight_decay != 0.0 {
                grad.add(&theta.affine(weight_decay, 0.0)?)?
            } else {
                grad.clone()
            };

            let exp_avg = v
                .exp_avg
                .affine(beta1, 0.0)?
                .add(&grad.affine(1.0 - beta1, 0.0)?)?;
            let exp_avg_sq = v
                .exp_avg_sq
                .affine(beta2, 0.0)?
                .add(&grad.sqr()?.affine(1.0 - beta2, 0.0)?)?;

            let m_hat = exp_avg.affine(1.0 / bias_correction1, 0.0)?;
            let denom = exp_avg_sq
                .affine(1.0 / bias_correction2, 0.0)?
                .sqrt()?
                .affine(1.0, eps)?;
            let delta = m_hat.div(&denom)?.affine(lr, 0.0)?;

            theta.set(&theta.sub(&delta)?)?;
            v.exp_avg.set(&exp_avg)?;
            v.exp_avg_sq.set(&exp_avg_sq)?;
        }
        Ok(())
    }
}

impl StatefulOptimizer for Adam {
    fn export_state(&self) -> Result<OptimizerState> {
        let mut buffers = BTreeMap::new();
        for v in &self.vars {
            buffers.insert(
                format!("exp_avg.{}", v.param.name),
                v.exp_avg.as_tensor().copy()?,
            );
            buffers.insert(
                format!("exp_avg_sq.{}", v.param.name),
                v.exp_avg_sq.as_tensor().copy()?,
            );
        }
        Ok(OptimizerState {
            scalars: OptimizerScalars {
                learning_rate: self.params.lr,
                step: self.step_t,
            },
            buffers,
        })
    }

    fn import_state(&mut self, state: &OptimizerState) -> Result<()> {
        for v in &self.vars {
            restore_buffer(
                &state.buffers,
                &format!("exp_avg.{}", v.param.name),
                &v.exp_avg,
            )?;
            restore_buffer(
                &state.buffers,
                &format!("exp_avg_sq.{}", v.param.name),
                &v.exp_avg_sq,
            )?;
        }
        self.params.lr = state.scalars.learning_rate;
        self.step_t = state.scalars.step;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn quadratic_step(opt: &mut Adam, x: &Var) -> candle_core::Result<()> {
        let loss = x.sqr()?.sum_all()?;
        let grads = loss.backward()?;
        opt.step(&grads)
    }

    #[test]
    fn test_first_step_moves_by_lr() -> anyhow::Result<()> {
        let x = Var::new(&[1.0f32, 2.0], &Device::Cpu)?;
        let params = ParamsAdam {
            lr: 0.1,
            ..ParamsAdam::default()
        };
        let mut opt = Adam::with_named(vec![("x".to_string(), x.clone())], params)?;

        quadratic_step(&mut opt, &x)?;

        // First bias-corrected Adam step is lr * sign(grad)
        let values = x.as_tensor().to_vec1::<f32>()?;
        assert!((values[0] - 0.9).abs() < 1e-5);
        assert!((values[1] - 1.9).abs() < 1e-5);
        assert_eq!(opt.step_count(), 1);
        Ok(())
    }

    #[test]
    fn test_state_restores_trajectory() -> anyhow::Result<()> {
        let params = ParamsAdam {
            lr: 0.05,
            weight_decay: 0.01,
            ..ParamsAdam::default()
        };
        let x = Var::new(&[1.0f32, -3.0], &Device::Cpu)?;
        let mut opt = Adam::with_named(vec![("x".to_string(), x.clone())], params)?;
        quadratic_step(&mut opt, &x)?;
        quadratic_step(&mut opt, &x)?;
        let state = opt.export_state()?;

        // Clone of the parameter at this point, with a fresh optimizer that imports the state
        let y = Var::from_tensor(&x.as_tensor().copy()?)?;
        let mut restored = Adam::with_named(vec![("x".to_string(), y.clone())], params)?;
        restored.import_state(&state)?;

        quadratic_step(&mut opt, &x)?;
        quadratic_step(&mut restored, &y)?;

        let a = x.as_tensor().to_vec1::<f32>()?;
        let b = y.as_tensor().to_vec1::<f32>()?;
        assert_eq!(a, b);
        assert_eq!(restored.step_count(), 3);
        Ok(())
    }

    #[test]
    fn test_import_missing_buffer_fails() -> anyhow::Result<()> {
        let x = Var::new(&[1.0f32], &Device::Cpu)?;
        let mut opt = Adam::with_named(vec![("x".to_string(), x)], ParamsAdam::default())?;
        let empty = OptimizerState {
            scalars: OptimizerScalars {
                learning_rate: 0.1,
                step: 4,
            },
            buffers: BTreeMap::new(),
        };
        assert!(opt.import_state(&empty).is_err());
        Ok(())
    }
}
