#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

use anyhow::Result;
use candle::{test_utils::to_vec0_round, Device, Tensor};
use dmn_vqa::loss::{is_decayed, l2, weighted_cross_entropy, Loss};

/* Expected values computed with:
import torch
import torch.nn.functional as F
logits = torch.tensor([[1., 2., 3.], [1., 1., 1.]])
ce = F.cross_entropy(logits, torch.tensor([2, 0]), reduction='none')
w = torch.tensor([1., 3.])
print((ce * w).sum() / w.sum())
# tensor(0.9259)
*/
#[test]
fn weighted_cross_entropy_test() -> Result<()> {
    let cpu = &Device::Cpu;
    let logits = Tensor::new(&[[1f32, 2., 3.], [1., 1., 1.]], cpu)?;
    let target = Tensor::new(&[2u32, 0], cpu)?;
    let weights = Tensor::new(&[1f32, 3.], cpu)?;
    let loss = weighted_cross_entropy(&logits, &target, &weights)?;
    assert_eq!(to_vec0_round(&loss, 4)?, 0.9259);

    // Uniform weights give the plain cross-entropy, whatever their scale.
    let uniform = Tensor::new(&[2f32, 2.], cpu)?;
    let loss = weighted_cross_entropy(&logits, &target, &uniform)?;
    assert_eq!(to_vec0_round(&loss, 4)?, 0.7531);
    let plain = candle_nn::loss::cross_entropy(&logits, &target)?;
    assert_eq!(to_vec0_round(&plain, 4)?, 0.7531);

    assert!(weighted_cross_entropy(&logits, &target, &Tensor::new(&[1f32], cpu)?).is_err());
    assert!(weighted_cross_entropy(&logits.flatten_all()?, &target, &weights).is_err());
    Ok(())
}

#[test]
fn decayed_variables() {
    assert!(is_decayed("decoder.dec.weight"));
    assert!(is_decayed("encoder.question.weight_ih"));
    assert!(is_decayed("embedding.weight"));
    assert!(is_decayed("layer1.0.conv1.weight"));
    assert!(!is_decayed("decoder.dec.bias"));
    assert!(!is_decayed("encoder.question.bias_hh"));
    assert!(!is_decayed("layer1.0.bn1.weight"));
    assert!(!is_decayed("episodic.hop.bn.weight"));
    assert!(!is_decayed("episodic.hop.bn.running_var"));
}

#[test]
fn l2_and_total_loss() -> Result<()> {
    let cpu = &Device::Cpu;
    let w1 = Tensor::new(&[1f32, 2.], cpu)?;
    let w2 = Tensor::new(&[[3f32]], cpu)?;
    let decayed = [w1, w2];
    assert_eq!(to_vec0_round(&l2(&decayed, cpu)?, 4)?, 14.);
    assert_eq!(to_vec0_round(&l2(&[], cpu)?, 4)?, 0.);

    let logits = Tensor::new(&[[1f32, 2., 3.], [1., 1., 1.]], cpu)?;
    let target = Tensor::new(&[2u32, 0], cpu)?;
    let weights = Tensor::new(&[1f32, 3.], cpu)?;
    let loss = Loss::new(&logits, &target, &weights, &decayed, 0.1)?;
    assert_eq!(to_vec0_round(&loss.cross_entropy, 4)?, 0.9259);
    assert_eq!(to_vec0_round(&loss.regularization, 4)?, 1.4);
    assert_eq!(to_vec0_round(&loss.total, 4)?, 2.3259);
    Ok(())
}
