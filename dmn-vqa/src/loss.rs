//! Loss calculations.
use candle::{DType, Device, Result, Tensor};

/// Cross-entropy where each example contributes proportionally to its weight.
///
/// Arguments
///
/// * [logits]: The unnormalized scores of dimensions `N, C`.
/// * [target]: The ground truth labels as a tensor of u32 of dimension `N`.
/// * [weights]: The per-example weights of dimension `N`.
///
/// Returns the scalar `sum_b(w_b * ce_b) / sum_b(w_b)`.
pub fn weighted_cross_entropy(logits: &Tensor, target: &Tensor, weights: &Tensor) -> Result<Tensor> {
    let b_sz = match logits.dims() {
        &[b_sz, _] => b_sz,
        dims => candle::bail!("weighted_cross_entropy expects logits of rank 2 ({dims:?})"),
    };
    match (target.dims(), weights.dims()) {
        (&[t_sz], &[w_sz]) if t_sz == b_sz && w_sz == b_sz => (),
        (t_dims, w_dims) => candle::bail!(
            "expected targets and weights of shape ({b_sz},), got {t_dims:?} and {w_dims:?}"
        ),
    }
    let log_probs = candle_nn::ops::log_softmax(logits, 1)?;
    let target = target.to_dtype(DType::U32)?.unsqueeze(1)?;
    let nll = log_probs.gather(&target, 1)?.squeeze(1)?.neg()?;
    let weights = weights.to_dtype(logits.dtype())?;
    (nll * &weights)?.sum_all()? / weights.sum_all()?
}

/// Whether a variable is subject to weight decay: weight matrices, convolution kernels and
/// trainable embeddings are, biases and batch normalization parameters are not.
pub fn is_decayed(name: &str) -> bool {
    let mut segments = name.split('.');
    let last = segments.next_back().unwrap_or_default();
    last.starts_with("weight") && !segments.any(|s| s.starts_with("bn"))
}

/// Sum of the squares of all the elements of `tensors`, a zero scalar when there is none.
pub fn l2(tensors: &[Tensor], device: &Device) -> Result<Tensor> {
    let mut sum = Tensor::zeros((), DType::F32, device)?;
    for tensor in tensors.iter() {
        sum = (sum + tensor.to_dtype(DType::F32)?.sqr()?.sum_all()?)?;
    }
    Ok(sum)
}

/// The components of the training objective.
#[derive(Debug, Clone)]
pub struct Loss {
    /// `cross_entropy + regularization`, the value that gets minimized.
    pub total: Tensor,
    pub cross_entropy: Tensor,
    pub regularization: Tensor,
}

impl Loss {
    /// Combines the data term with `weight_decay` times the l2 penalty of `decayed`.
    pub fn new(
        logits: &Tensor,
        target: &Tensor,
        weights: &Tensor,
        decayed: &[Tensor],
        weight_decay: f64,
    ) -> Result<Self> {
        let cross_entropy = weighted_cross_entropy(logits, target, weights)?;
        let regularization = (l2(decayed, logits.device())? * weight_decay)?
            .to_dtype(cross_entropy.dtype())?;
        let total = (&cross_entropy + &regularization)?;
        Ok(Self {
            total,
            cross_entropy,
            regularization,
        })
    }
}
