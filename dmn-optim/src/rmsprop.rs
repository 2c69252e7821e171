use candle::{Result, Tensor, TensorId, Var};
use candle_nn::optim::Optimizer;
use std::collections::HashMap;

/// RMSProp optimizer
///
/// Described in lecture 6e of Hinton's "Neural Networks for Machine Learning" course.
///
/// ```text
/// ms  <- decay * ms + (1 - decay) * grad^2
/// mom <- momentum * mom + lr * grad / sqrt(ms + eps)
/// var <- var - mom
/// ```
///
/// The mean square accumulator starts at zero.
#[derive(Debug)]
pub struct RmsProp {
    vars: Vec<Var>,
    params: ParamsRmsProp,
    state: HashMap<TensorId, (Tensor, Option<Tensor>)>,
}

#[derive(Debug, Clone, Copy)]
pub struct ParamsRmsProp {
    pub lr: f64,
    pub decay: f64,
    pub momentum: f64,
    pub eps: f64,
}

impl Default for ParamsRmsProp {
    fn default() -> Self {
        Self {
            lr: 0.001,
            decay: 0.9,
            momentum: 0.,
            eps: 1e-10,
        }
    }
}

impl Optimizer for RmsProp {
    type Config = ParamsRmsProp;

    fn new(vars: Vec<Var>, params: ParamsRmsProp) -> Result<Self> {
        if !(0. ..1.).contains(&params.decay) {
            candle::bail!("rmsprop decay must be in [0, 1) {}", params.decay)
        }
        let vars = vars
            .into_iter()
            .filter(|var| var.dtype().is_float())
            .collect();
        Ok(Self {
            vars,
            params,
            state: HashMap::new(),
        })
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn step(&mut self, grads: &candle::backprop::GradStore) -> Result<()> {
        let decay = self.params.decay;
        for var in &self.vars {
            if let Some(grad) = grads.get(var) {
                let grad_sq = (grad.sqr()? * (1. - decay))?;
                let (mean_sq, prev_mom) = match self.state.remove(&var.id()) {
                    Some((ms, mom)) => (((ms * decay)? + grad_sq)?, mom),
                    None => (grad_sq, None),
                };
                let scaled = (grad.div(&(&mean_sq + self.params.eps)?.sqrt()?)? * self.params.lr)?;
                let mom = match prev_mom {
                    Some(prev) if self.params.momentum != 0. => {
                        ((prev * self.params.momentum)? + scaled)?
                    }
                    _ => scaled,
                };
                var.set(&var.sub(&mom)?)?;
                let mom = (self.params.momentum != 0.).then_some(mom);
                self.state.insert(var.id(), (mean_sq, mom));
            }
        }
        Ok(())
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }
}
