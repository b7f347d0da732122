// Plain SGD with optional momentum, used for the center-loss parameters

use candle_core::backprop::GradStore;
use candle_core::Var;
use candle_nn::Optimizer;
use std::collections::BTreeMap;

use super::{
    index_named, restore_buffer, NamedVar, OptimizerScalars, OptimizerState, StatefulOptimizer,
};
use crate::errors::Result;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamsSgd {
    pub lr: f64,
    pub momentum: f64,
    pub weight_decay: f64,
}

impl ParamsSgd {
    pub fn new(lr: f64) -> Self {
        Self {
            lr,
            momentum: 0.0,
            weight_decay: 0.0,
        }
    }
}

struct SgdVar {
    param: NamedVar,
    /// Only allocated when momentum is enabled
    momentum_buf: Option<Var>,
}

pub struct Sgd {
    vars: Vec<SgdVar>,
    step_t: u64,
    params: ParamsSgd,
}

impl Sgd {
    pub fn with_named(vars: Vec<(String, Var)>, params: ParamsSgd) -> candle_core::Result<Self> {
        let vars = vars
            .into_iter()
            .filter(|(_, var)| var.dtype().is_float())
            .map(|(name, var)| {
                let momentum_buf = if params.momentum != 0.0 {
                    Some(Var::zeros(var.shape(), var.dtype(), var.device())?)
                } else {
                    None
                };
                Ok(SgdVar {
                    param: NamedVar { name, var },
                    momentum_buf,
                })
            })
            .collect::<candle_core::Result<Vec<_>>>()?;

        Ok(Self {
            vars,
            step_t: 0,
            params,
        })
    }

    pub fn step_count(&self) -> u64 {
        self.step_t
    }
}

impl Optimizer for Sgd {
    type Config = ParamsSgd;

    fn new(vars: Vec<Var>, params: ParamsSgd) -> candle_core::Result<Self> {
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
        for v in &self.vars {
            let theta = &v.param.var;
            let Some(grad) = grads.get(theta) else {
                continue;
            };
            let mut grad = if self.params.weight_decay != 0.0 {
                grad.add(&theta.affine(self.params.weight_decay, 0.0)?)?
            } else {
                grad.clone()
            };
            if let Some(buf) = &v.momentum_buf {
                let next = buf.affine(self.params.momentum, 0.0)?.add(&grad)?;
                buf.set(&next)?;
                grad = next;
            }
            theta.set(&theta.sub(&grad.affine(self.params.lr, 0.0)?)?)?;
        }
        Ok(())
    }
}

impl StatefulOptimizer for Sgd {
    fn export_state(&self) -> Result<OptimizerState> {
        let mut buffers = BTreeMap::new();
        for v in &self.vars {
            if let Some(buf) = &v.momentum_buf {
                buffers.insert(
                    format!("momentum.{}", v.param.name),
                    buf.as_tensor().copy()?,
                );
            }
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
            if let Some(buf) = &v.momentum_buf {
                restore_buffer(
                    &state.buffers,
                    &format!("momentum.{}", v.param.name),
                    buf,
                )?;
            }
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

    #[test]
    fn test_plain_step() -> anyhow::Result<()> {
        let x = Var::new(&[1.0f32], &Device::Cpu)?;
        let mut opt = Sgd::with_named(vec![("x".to_string(), x.clone())], ParamsSgd::new(0.5))?;

        let loss = x.affine(3.0, 0.0)?.sum_all()?;
        opt.step(&loss.backward()?)?;

        let value = x.as_tensor().to_vec1::<f32>()?[0];
        assert!((value - (-0.5)).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_momentum_accumulates() -> anyhow::Result<()> {
        let x = Var::new(&[0.0f32], &Device::Cpu)?;
        let params = ParamsSgd {
            lr: 1.0,
            momentum: 0.9,
            weight_decay: 0.0,
        };
        let mut opt = Sgd::with_named(vec![("x".to_string(), x.clone())], params)?;

        // Constant gradient of 1: steps are 1.0 then 1.9
        for _ in 0..2 {
            let loss = x.sum_all()?;
            opt.step(&loss.backward()?)?;
        }
        let value = x.as_tensor().to_vec1::<f32>()?[0];
        assert!((value + 2.9).abs() < 1e-5);

        let state = opt.export_state()?;
        assert!(state.buffers.contains_key("momentum.x"));
        assert_eq!(state.scalars.step, 2);
        Ok(())
    }
}
