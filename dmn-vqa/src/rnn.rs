//! Recurrent cells used by the encoders and the episodic memory.
use candle::{DType, Device, Module, Result, Tensor, D};
use candle_nn::{Init, Linear, VarBuilder};

/// Trait for recurrent cells unrolled over a `(batch, seq_len, features)` input.
#[allow(clippy::upper_case_acronyms)]
pub trait RNN {
    type State;

    /// A zero state from which the recurrent network is usually initialized.
    fn zero_state(&self, batch_dim: usize) -> Result<Self::State>;

    /// Applies a single step of the recurrent network.
    ///
    /// The input should have dimensions [batch_size, features].
    fn step(&self, input: &Tensor, state: &Self::State) -> Result<Self::State>;

    /// Applies the recurrent network over a whole sequence starting from the zero state.
    ///
    /// The input should have dimensions [batch_size, seq_len, features], the returned tensor
    /// stacks the outputs of every step as [batch_size, seq_len, hidden].
    fn seq(&self, input: &Tensor) -> Result<(Tensor, Self::State)> {
        let batch_dim = input.dim(0)?;
        let state = self.zero_state(batch_dim)?;
        self.seq_init(input, &state)
    }

    /// Applies the recurrent network over a whole sequence starting from `state`.
    fn seq_init(&self, input: &Tensor, state: &Self::State) -> Result<(Tensor, Self::State)>;
}

#[derive(Debug, Clone, Copy)]
pub struct GruConfig {
    pub w_ih_init: Init,
    pub w_hh_init: Init,
    pub b_ih_init: Init,
    pub b_hh_init: Init,
}

impl Default for GruConfig {
    fn default() -> Self {
        Self {
            w_ih_init: candle_nn::init::DEFAULT_KAIMING_UNIFORM,
            w_hh_init: candle_nn::init::DEFAULT_KAIMING_UNIFORM,
            b_ih_init: Init::Const(0.),
            b_hh_init: Init::Const(0.),
        }
    }
}

/// A Gated Recurrent Unit cell.
///
/// The weights use the PyTorch layout, the reset, update and candidate gates are stacked in
/// this order along the first dimension of `weight_ih` and `weight_hh`:
///
/// ```text
/// r  = sigmoid(W_ir x + b_ir + W_hr h + b_hr)
/// z  = sigmoid(W_iz x + b_iz + W_hz h + b_hz)
/// n  = tanh(W_in x + b_in + r * (W_hn h + b_hn))
/// h' = (1 - z) * n + z * h
/// ```
#[derive(Debug, Clone)]
pub struct Gru {
    input_proj: Linear,
    hidden_proj: Linear,
    in_dim: usize,
    hidden_dim: usize,
    dtype: DType,
    device: Device,
    span: tracing::Span,
}

pub fn gru(in_dim: usize, hidden_dim: usize, config: GruConfig, vb: VarBuilder) -> Result<Gru> {
    let w_ih = vb.get_with_hints((3 * hidden_dim, in_dim), "weight_ih", config.w_ih_init)?;
    let w_hh = vb.get_with_hints((3 * hidden_dim, hidden_dim), "weight_hh", config.w_hh_init)?;
    let b_ih = vb.get_with_hints(3 * hidden_dim, "bias_ih", config.b_ih_init)?;
    let b_hh = vb.get_with_hints(3 * hidden_dim, "bias_hh", config.b_hh_init)?;
    Ok(Gru {
        input_proj: Linear::new(w_ih, Some(b_ih)),
        hidden_proj: Linear::new(w_hh, Some(b_hh)),
        in_dim,
        hidden_dim,
        dtype: vb.dtype(),
        device: vb.device().clone(),
        span: tracing::span!(tracing::Level::TRACE, "gru"),
    })
}

impl Gru {
    pub fn in_dim(&self) -> usize {
        self.in_dim
    }

    pub fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }

    /// Number of scalar parameters held by the cell.
    pub fn num_parameters(&self) -> usize {
        3 * self.hidden_dim * (self.in_dim + self.hidden_dim + 2)
    }

    // `xs` already went through the input projection.
    fn step_projected(&self, xs: &Tensor, h: &Tensor) -> Result<Tensor> {
        let hs = self.hidden_proj.forward(h)?;
        let xs = xs.chunk(3, D::Minus1)?;
        let hs = hs.chunk(3, D::Minus1)?;
        let r = candle_nn::ops::sigmoid(&(&xs[0] + &hs[0])?)?;
        let z = candle_nn::ops::sigmoid(&(&xs[1] + &hs[1])?)?;
        let n = (&xs[2] + (r * &hs[2])?)?.tanh()?;
        // (1 - z) * n + z * h == n + z * (h - n)
        &n + (z * (h - &n)?)?
    }
}

impl RNN for Gru {
    type State = Tensor;

    fn zero_state(&self, batch_dim: usize) -> Result<Tensor> {
        Tensor::zeros((batch_dim, self.hidden_dim), self.dtype, &self.device)
    }

    fn step(&self, input: &Tensor, state: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let xs = self.input_proj.forward(input)?;
        self.step_projected(&xs, state)
    }

    fn seq_init(&self, input: &Tensor, state: &Tensor) -> Result<(Tensor, Tensor)> {
        let _enter = self.span.enter();
        let (_b_size, seq_len, in_dim) = input.dims3()?;
        if in_dim != self.in_dim {
            candle::bail!(
                "gru expects {} input features, got {:?}",
                self.in_dim,
                input.shape()
            )
        }
        // The input projection does not depend on the recurrence, compute it for all the steps
        // in a single matmul.
        let xs = self.input_proj.forward(input)?;
        let mut h = state.clone();
        let mut outputs = Vec::with_capacity(seq_len);
        for t in 0..seq_len {
            let xs_t = xs.narrow(1, t, 1)?.squeeze(1)?;
            h = self.step_projected(&xs_t, &h)?;
            outputs.push(h.clone());
        }
        if outputs.is_empty() {
            candle::bail!("gru cannot run over an empty sequence")
        }
        Ok((Tensor::stack(&outputs, 1)?, h))
    }
}
