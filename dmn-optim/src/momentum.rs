use candle::{Result, Tensor, TensorId, Var};
use candle_nn::optim::Optimizer;
use std::collections::HashMap;

/// Stochastic Gradient Descent with a momentum accumulator.
///
/// The accumulator is not dampened and the learning rate is applied after accumulation:
///
/// ```text
/// accum <- momentum * accum + grad
/// var   <- var - lr * accum                          (plain)
/// var   <- var - lr * (grad + momentum * accum)      (nesterov)
/// ```
#[derive(Debug)]
pub struct Momentum {
    vars: Vec<Var>,
    params: ParamsMomentum,
    accum: HashMap<TensorId, Tensor>,
}

#[derive(Debug, Clone, Copy)]
pub struct ParamsMomentum {
    pub lr: f64,
    pub momentum: f64,
    pub weight_decay: f64,
    pub nesterov: bool,
}

impl Default for ParamsMomentum {
    fn default() -> Self {
        Self {
            lr: 0.01,
            momentum: 0.9,
            weight_decay: 0.,
            nesterov: false,
        }
    }
}

impl Optimizer for Momentum {
    type Config = ParamsMomentum;

    fn new(vars: Vec<Var>, params: ParamsMomentum) -> Result<Self> {
        if params.momentum < 0. {
            candle::bail!("momentum cannot be negative {}", params.momentum)
        }
        let vars = vars
            .into_iter()
            .filter(|var| var.dtype().is_float())
            .collect();
        Ok(Self {
            vars,
            params,
            accum: HashMap::new(),
        })
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn step(&mut self, grads: &candle::backprop::GradStore) -> Result<()> {
        for var in &self.vars {
            if let Some(grad) = grads.get(var) {
                let grad = if self.params.weight_decay == 0. {
                    grad.clone()
                } else {
                    (grad + (self.params.weight_decay * var.as_tensor())?)?
                };
                let accum = match self.accum.get(&var.id()) {
                    Some(prev) => ((prev * self.params.momentum)? + &grad)?,
                    None => grad.clone(),
                };
                let update = if self.params.nesterov {
                    (&grad + (&accum * self.params.momentum)?)?
                } else {
                    accum.clone()
                };
                var.set(&var.sub(&(update * self.params.lr)?)?)?;
                self.accum.insert(var.id(), accum);
            }
        }
        Ok(())
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }
}
