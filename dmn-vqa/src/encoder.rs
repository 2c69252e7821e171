//! Question and fact encoders.
//!
//! Questions are embedded and run through a GRU, the encoding of each question is the hidden
//! state at its last real token. The region features are contextualised by a single GRU cell
//! run in both directions over the snake ordered sequence, the two passes are summed.
use candle::{DType, Module, Result, Tensor, D};
use candle_nn::{Embedding, VarBuilder};

use crate::rnn::{gru, Gru, GruConfig, RNN};

#[derive(Debug, Clone)]
pub struct SequenceEncoder {
    embedding: Embedding,
    question_gru: Gru,
    fact_gru: Gru,
    span_question: tracing::Span,
    span_facts: tracing::Span,
}

impl SequenceEncoder {
    /// `vb` holds the recurrent cells, `embed_vb` the `(num_words, dim_embed)` word embeddings.
    /// The two can point at different parameter groups so that the embeddings can be frozen.
    pub fn new(
        num_words: usize,
        dim_embed: usize,
        dim_fact: usize,
        dim_hidden: usize,
        vb: VarBuilder,
        embed_vb: VarBuilder,
    ) -> Result<Self> {
        let embedding = candle_nn::embedding(num_words, dim_embed, embed_vb)?;
        let cfg = GruConfig::default();
        let question_gru = gru(dim_embed, dim_hidden, cfg, vb.pp("question"))?;
        let fact_gru = gru(dim_fact, dim_hidden, cfg, vb.pp("facts"))?;
        Ok(Self {
            embedding,
            question_gru,
            fact_gru,
            span_question: tracing::span!(tracing::Level::TRACE, "encode-question"),
            span_facts: tracing::span!(tracing::Level::TRACE, "encode-facts"),
        })
    }

    pub fn dim_hidden(&self) -> usize {
        self.question_gru.hidden_dim()
    }

    pub fn dim_fact(&self) -> usize {
        self.fact_gru.in_dim()
    }

    /// Looks up the embeddings of a `(batch, seq_len)` tensor of word indexes.
    pub fn embed(&self, tokens: &Tensor) -> Result<Tensor> {
        self.embedding.forward(tokens)
    }

    /// Encodes `(batch, seq_len)` questions, `lengths` holds the number of real tokens of each
    /// question, the remaining positions are padding and never influence the result.
    ///
    /// Returns a `(batch, hidden)` tensor.
    pub fn encode_question(&self, tokens: &Tensor, lengths: &Tensor) -> Result<Tensor> {
        let _enter = self.span_question.enter();
        let (b_size, seq_len) = tokens.dims2()?;
        let lengths = lengths.to_dtype(DType::U32)?.to_vec1::<u32>()?;
        if lengths.len() != b_size {
            candle::bail!(
                "got {} question lengths for a batch of {b_size} questions",
                lengths.len()
            )
        }
        let mut last = Vec::with_capacity(b_size);
        for (index, &len) in lengths.iter().enumerate() {
            if len == 0 || len as usize > seq_len {
                candle::bail!("question {index} has length {len}, expected a value in 1..={seq_len}")
            }
            last.push(len - 1)
        }
        let (states, _) = self.question_gru.seq(&self.embed(tokens)?)?;
        let hidden = states.dim(D::Minus1)?;
        let last = Tensor::from_vec(last, (b_size, 1, 1), tokens.device())?
            .broadcast_as((b_size, 1, hidden))?
            .contiguous()?;
        states.gather(&last, 1)?.squeeze(1)
    }

    /// Encodes `(batch, regions, dim_fact)` region features into `(batch, regions, hidden)`
    /// facts.
    pub fn encode_facts(&self, feats: &Tensor) -> Result<Tensor> {
        let _enter = self.span_facts.enter();
        let (forward, _) = self.fact_gru.seq(feats)?;
        let (backward, _) = self.fact_gru.seq(&feats.flip(&[1])?)?;
        forward + backward.flip(&[1])?
    }
}
