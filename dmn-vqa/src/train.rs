//! Optimization: solver selection, gradient clipping and training steps.
use candle::backprop::GradStore;
use candle::{Result, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, SGD};
use dmn_optim::{Momentum, ParamsMomentum, ParamsRmsProp, RmsProp};

use crate::config::{Config, Solver};
use crate::model::{Batch, QuestionAnswerer};

#[derive(Debug)]
enum SolverState {
    Adam(AdamW),
    Momentum(Momentum),
    RmsProp(RmsProp),
    Sgd(SGD),
}

impl SolverState {
    fn new(vars: Vec<Var>, cfg: &Config) -> Result<Self> {
        let lr = cfg.learning_rate;
        let solver = match cfg.solver {
            Solver::Adam => {
                let params = ParamsAdamW {
                    lr,
                    weight_decay: 0.,
                    ..Default::default()
                };
                Self::Adam(AdamW::new(vars, params)?)
            }
            Solver::Momentum => {
                let params = ParamsMomentum {
                    lr,
                    momentum: cfg.momentum,
                    ..Default::default()
                };
                Self::Momentum(Momentum::new(vars, params)?)
            }
            Solver::Rmsprop => {
                let params = ParamsRmsProp {
                    lr,
                    decay: cfg.decay,
                    momentum: cfg.momentum,
                    ..Default::default()
                };
                Self::RmsProp(RmsProp::new(vars, params)?)
            }
            Solver::Sgd => Self::Sgd(SGD::new(vars, lr)?),
        };
        Ok(solver)
    }

    fn step(&mut self, grads: &GradStore) -> Result<()> {
        match self {
            Self::Adam(opt) => opt.step(grads),
            Self::Momentum(opt) => opt.step(grads),
            Self::RmsProp(opt) => opt.step(grads),
            Self::Sgd(opt) => opt.step(grads),
        }
    }

    fn learning_rate(&self) -> f64 {
        match self {
            Self::Adam(opt) => opt.learning_rate(),
            Self::Momentum(opt) => opt.learning_rate(),
            Self::RmsProp(opt) => opt.learning_rate(),
            Self::Sgd(opt) => opt.learning_rate(),
        }
    }

    fn set_learning_rate(&mut self, lr: f64) {
        match self {
            Self::Adam(opt) => opt.set_learning_rate(lr),
            Self::Momentum(opt) => opt.set_learning_rate(lr),
            Self::RmsProp(opt) => opt.set_learning_rate(lr),
            Self::Sgd(opt) => opt.set_learning_rate(lr),
        }
    }
}

/// Rescales the gradients of `vars` so that their global l2 norm is at most `max_norm`.
///
/// Returns the global norm before clipping.
pub fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<f64> {
    let mut sum = 0f64;
    for var in vars.iter() {
        if let Some(grad) = grads.get(var) {
            sum += grad.sqr()?.sum_all()?.to_dtype(candle::DType::F64)?.to_scalar::<f64>()?;
        }
    }
    let norm = sum.sqrt();
    if norm > max_norm {
        let scale = max_norm / norm;
        for var in vars.iter() {
            if let Some(grad) = grads.remove(var) {
                grads.insert(var, (grad * scale)?);
            }
        }
    }
    Ok(norm)
}

/// Statistics of a single training step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepStats {
    pub loss: f32,
    pub cross_entropy: f32,
    pub regularization: f32,
    /// Global gradient norm before clipping.
    pub grad_norm: f64,
}

#[derive(Debug)]
pub struct Trainer {
    solver: SolverState,
    vars: Vec<Var>,
    clip_gradients: f64,
    steps: usize,
}

impl Trainer {
    /// A trainer updating `vars` with the solver selected in `cfg`.
    pub fn new(vars: Vec<Var>, cfg: &Config) -> Result<Self> {
        let solver = SolverState::new(vars.clone(), cfg)?;
        Ok(Self {
            solver,
            vars,
            clip_gradients: cfg.clip_gradients,
            steps: 0,
        })
    }

    /// A trainer for all the trainable variables of `model`.
    pub fn for_model(model: &QuestionAnswerer) -> Result<Self> {
        let cfg = model.config();
        let vars = model.params().trainable_vars(cfg.train_cnn)?;
        tracing::info!(vars = vars.len(), solver = ?cfg.solver, "trainer");
        Self::new(vars, cfg)
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn learning_rate(&self) -> f64 {
        self.solver.learning_rate()
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.solver.set_learning_rate(lr)
    }

    /// Back-propagates `loss`, clips the gradients and updates the variables.
    ///
    /// Returns the gradient norm before clipping.
    pub fn apply_update(&mut self, loss: &Tensor) -> Result<f64> {
        let mut grads = loss.backward()?;
        let grad_norm = clip_grad_norm(&mut grads, &self.vars, self.clip_gradients)?;
        self.solver.step(&grads)?;
        self.steps += 1;
        Ok(grad_norm)
    }

    /// Runs the model in training mode on `batch` and updates its variables.
    pub fn train_step(&mut self, model: &QuestionAnswerer, batch: &Batch) -> Result<StepStats> {
        let output = model.forward(batch, true)?;
        let loss = match output.loss {
            Some(loss) => loss,
            None => candle::bail!("the model did not compute a loss for the training batch"),
        };
        let grad_norm = self.apply_update(&loss.total)?;
        let stats = StepStats {
            loss: loss.total.to_scalar::<f32>()?,
            cross_entropy: loss.cross_entropy.to_scalar::<f32>()?,
            regularization: loss.regularization.to_scalar::<f32>()?,
            grad_norm,
        };
        tracing::debug!(step = self.steps, ?stats, "train step");
        Ok(stats)
    }
}
