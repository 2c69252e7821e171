//! Answer decoder, a single linear layer over the memory and the question encoding.
use candle::{Module, Result, Tensor, D};
use candle_nn::VarBuilder;

use crate::with_tracing::{linear, Linear};

/// The decoded answers for a batch.
#[derive(Debug, Clone)]
pub struct Answer {
    /// Index of the most likely word, `(batch,)` u32.
    pub predicted: Tensor,
    /// Probability of the predicted word, `(batch,)`.
    pub confidence: Tensor,
    /// `(batch, num_words)` probabilities.
    pub distribution: Tensor,
    /// `(batch, num_words)` unnormalized scores.
    pub logits: Tensor,
}

#[derive(Debug, Clone)]
pub struct AnswerDecoder {
    dec: Linear,
    span: tracing::Span,
}

impl AnswerDecoder {
    pub fn new(dim_hidden: usize, num_words: usize, vb: VarBuilder) -> Result<Self> {
        let dec = linear(2 * dim_hidden, num_words, vb.pp("dec"))?;
        let span = tracing::span!(tracing::Level::TRACE, "decoder");
        Ok(Self { dec, span })
    }

    pub fn logits(&self, memory: &Tensor, question: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let xs = Tensor::cat(&[memory, question], D::Minus1)?;
        self.dec.forward(&xs)
    }

    pub fn decode(&self, memory: &Tensor, question: &Tensor) -> Result<Answer> {
        let logits = self.logits(memory, question)?;
        let distribution = candle_nn::ops::softmax(&logits, D::Minus1)?;
        let predicted = distribution.argmax(D::Minus1)?;
        let confidence = distribution.max(D::Minus1)?;
        Ok(Answer {
            predicted,
            confidence,
            distribution,
            logits,
        })
    }
}
