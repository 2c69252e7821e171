//! Episodic memory.
//!
//! The memory starts from the question encoding and is refined over a fixed number of hops. At
//! each hop the attention module summarizes the facts given the current memory, and the memory
//! is updated from this summary. The parameters of a hop (attention and memory update) are
//! either shared by all the hops or specific to each of them.
use candle::{Module, Result, Tensor};
use candle_nn::{Dropout, VarBuilder};

use crate::attention::Attention;
use crate::config::{Config, MemoryUpdate};
use crate::rnn::{gru, Gru, GruConfig, RNN};
use crate::with_tracing::{batch_norm, linear, BatchNorm, Linear};

#[derive(Debug, Clone)]
enum Updater {
    Gru(Gru),
    Concat { fc: Linear, bn: BatchNorm },
}

/// The parameters used by a single reasoning hop.
#[derive(Debug, Clone)]
pub struct Hop {
    attention: Attention,
    updater: Updater,
    span: tracing::Span,
}

impl Hop {
    pub fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        let dim = cfg.dim_hidden;
        let attention = Attention::new(dim, cfg.attention, vb.pp("attention"))?;
        let updater = match cfg.memory_update {
            MemoryUpdate::Gru => Updater::Gru(gru(dim, dim, GruConfig::default(), vb.pp("gru"))?),
            MemoryUpdate::Concat => Updater::Concat {
                fc: linear(3 * dim, dim, vb.pp("fc"))?,
                bn: batch_norm(dim, cfg.batch_norm, vb.pp("bn"))?,
            },
        };
        let span = tracing::span!(tracing::Level::TRACE, "hop");
        Ok(Self {
            attention,
            updater,
            span,
        })
    }

    /// Runs one hop, returns the new memory and the attention gates.
    pub fn forward(
        &self,
        facts: &Tensor,
        memory: &Tensor,
        question: &Tensor,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let _enter = self.span.enter();
        let (fact, gates) = self.attention.attend(facts, memory, question)?;
        let memory = match &self.updater {
            Updater::Gru(gru) => gru.step(&fact, memory)?,
            Updater::Concat { fc, bn } => {
                let xs = Tensor::cat(&[memory, &fact, question], 1)?;
                fc.forward(&xs)?.apply_t(bn, train)?.relu()?
            }
        };
        Ok((memory, gates))
    }
}

/// Intermediate values of a run of the episodic memory.
#[derive(Debug, Clone)]
pub struct Trace {
    /// The memory before the first hop (the question encoding) then after each hop.
    pub memories: Vec<Tensor>,
    /// The `(batch, regions)` attention gates of each hop.
    pub gates: Vec<Tensor>,
    /// The final memory after dropout.
    pub output: Tensor,
}

#[derive(Debug, Clone)]
pub struct EpisodicMemory {
    hops: Vec<Hop>,
    memory_step: usize,
    num_facts: usize,
    dim_hidden: usize,
    dropout: Dropout,
    span: tracing::Span,
}

impl EpisodicMemory {
    /// Builds the hops, a single one is allocated when the memory weights are tied.
    pub fn new(cfg: &Config, num_facts: usize, vb: VarBuilder) -> Result<Self> {
        let vb = vb.pp("hop");
        let hops = if cfg.tie_memory_weight {
            vec![Hop::new(cfg, vb)?]
        } else {
            (0..cfg.memory_step)
                .map(|t| Hop::new(cfg, vb.pp(t)))
                .collect::<Result<Vec<_>>>()?
        };
        tracing::debug!(
            hops = hops.len(),
            memory_step = cfg.memory_step,
            "episodic memory"
        );
        Ok(Self {
            hops,
            memory_step: cfg.memory_step,
            num_facts,
            dim_hidden: cfg.dim_hidden,
            dropout: Dropout::new(cfg.memory_dropout),
            span: tracing::span!(tracing::Level::TRACE, "episodic-memory"),
        })
    }

    /// Number of distinct hop parameter sets.
    pub fn num_hops(&self) -> usize {
        self.hops.len()
    }

    pub fn memory_step(&self) -> usize {
        self.memory_step
    }

    fn hop(&self, t: usize) -> &Hop {
        if self.hops.len() == 1 {
            &self.hops[0]
        } else {
            &self.hops[t]
        }
    }

    fn check_shapes(&self, facts: &Tensor, question: &Tensor) -> Result<()> {
        let (b_size, num_facts, dim) = facts.dims3()?;
        let (q_b_size, q_dim) = question.dims2()?;
        if num_facts != self.num_facts || dim != self.dim_hidden {
            candle::bail!(
                "expected ({b_size}, {}, {}) facts, got {:?}",
                self.num_facts,
                self.dim_hidden,
                facts.shape()
            )
        }
        if q_b_size != b_size || q_dim != self.dim_hidden {
            candle::bail!(
                "expected a ({b_size}, {}) question encoding, got {:?}",
                self.dim_hidden,
                question.shape()
            )
        }
        Ok(())
    }

    /// Runs all the hops and keeps every intermediate memory and the attention gates.
    ///
    /// `facts` is `(batch, regions, hidden)` and `question` is `(batch, hidden)`.
    pub fn run_with_trace(&self, facts: &Tensor, question: &Tensor, train: bool) -> Result<Trace> {
        let _enter = self.span.enter();
        self.check_shapes(facts, question)?;
        let mut memories = Vec::with_capacity(self.memory_step + 1);
        let mut gates = Vec::with_capacity(self.memory_step);
        let mut memory = question.clone();
        memories.push(memory.clone());
        for t in 0..self.memory_step {
            let (next, g) = self.hop(t).forward(facts, &memory, question, train)?;
            memory = next;
            memories.push(memory.clone());
            gates.push(g);
        }
        let output = self.dropout.forward(&memory, train)?;
        Ok(Trace {
            memories,
            gates,
            output,
        })
    }

    /// The final `(batch, hidden)` memory.
    pub fn forward(&self, facts: &Tensor, question: &Tensor, train: bool) -> Result<Tensor> {
        Ok(self.run_with_trace(facts, question, train)?.output)
    }
}
