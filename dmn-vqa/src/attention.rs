//! Attention over the facts, conditioned on the question and the current memory.
//!
//! For each fact `f` the interaction features `[f * q, f * m, |f - q|, |f - m|]` are scored by a
//! two layer network, the scores are normalized with a softmax over the regions. The gates are
//! then used either as the weights of a sum of the facts or as the update gates of an attention
//! GRU run over the facts.
use candle::{Module, Result, Tensor, D};
use candle_nn::VarBuilder;

use crate::config::AttentionMechanism;
use crate::with_tracing::{linear, Linear};

/// GRU variant where the update gate is replaced by an externally provided attention gate.
///
/// ```text
/// r  = sigmoid(W_r f + U_r h + b_r)
/// h~ = tanh(W f + r * (U h) + b)
/// h' = g * h~ + (1 - g) * h
/// ```
#[derive(Debug, Clone)]
pub struct AttentionGru {
    input_proj: Linear,
    hidden_proj: Linear,
    span: tracing::Span,
}

impl AttentionGru {
    pub fn new(dim: usize, vb: VarBuilder) -> Result<Self> {
        let input_proj = linear(dim, 2 * dim, vb.pp("input_proj"))?;
        let hidden_proj = linear(dim, 2 * dim, vb.pp("hidden_proj"))?;
        let span = tracing::span!(tracing::Level::TRACE, "attention-gru");
        Ok(Self {
            input_proj,
            hidden_proj,
            span,
        })
    }

    /// Runs over `(batch, regions, dim)` facts with `(batch, regions)` gates starting from a zero
    /// state, returns the final `(batch, dim)` state.
    pub fn forward(&self, facts: &Tensor, gates: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (b_size, num_facts, dim) = facts.dims3()?;
        let xs = self.input_proj.forward(facts)?;
        let mut h = Tensor::zeros((b_size, dim), facts.dtype(), facts.device())?;
        for i in 0..num_facts {
            let xs = xs.narrow(1, i, 1)?.squeeze(1)?.chunk(2, D::Minus1)?;
            let hs = self.hidden_proj.forward(&h)?.chunk(2, D::Minus1)?;
            let r = candle_nn::ops::sigmoid(&(&xs[0] + &hs[0])?)?;
            let candidate = (&xs[1] + (r * &hs[1])?)?.tanh()?;
            let g = gates.narrow(1, i, 1)?;
            h = (&h + g.broadcast_mul(&(candidate - &h)?)?)?;
        }
        Ok(h)
    }
}

#[derive(Debug, Clone)]
pub struct Attention {
    proj: Linear,
    score: Linear,
    gru: Option<AttentionGru>,
    span: tracing::Span,
}

impl Attention {
    pub fn new(dim: usize, mechanism: AttentionMechanism, vb: VarBuilder) -> Result<Self> {
        let proj = linear(4 * dim, dim, vb.pp("proj"))?;
        let score = linear(dim, 1, vb.pp("score"))?;
        let gru = match mechanism {
            AttentionMechanism::Soft => None,
            AttentionMechanism::Gru => Some(AttentionGru::new(dim, vb.pp("gru"))?),
        };
        let span = tracing::span!(tracing::Level::TRACE, "attention");
        Ok(Self {
            proj,
            score,
            gru,
            span,
        })
    }

    /// The `(batch, regions)` attention gates, each row sums to one.
    pub fn gates(&self, facts: &Tensor, memory: &Tensor, question: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let question = question.unsqueeze(1)?;
        let memory = memory.unsqueeze(1)?;
        let z = Tensor::cat(
            &[
                facts.broadcast_mul(&question)?,
                facts.broadcast_mul(&memory)?,
                facts.broadcast_sub(&question)?.abs()?,
                facts.broadcast_sub(&memory)?.abs()?,
            ],
            D::Minus1,
        )?;
        let scores = self
            .score
            .forward(&self.proj.forward(&z)?.tanh()?)?
            .squeeze(D::Minus1)?;
        candle_nn::ops::softmax(&scores, D::Minus1)
    }

    /// Aggregates the `(batch, regions, dim)` facts into a `(batch, dim)` tensor, also returns
    /// the gates that were used.
    pub fn attend(
        &self,
        facts: &Tensor,
        memory: &Tensor,
        question: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        let gates = self.gates(facts, memory, question)?;
        let fact = match &self.gru {
            None => gates.unsqueeze(1)?.matmul(facts)?.squeeze(1)?,
            Some(gru) => gru.forward(facts, &gates)?,
        };
        Ok((fact, gates))
    }
}
