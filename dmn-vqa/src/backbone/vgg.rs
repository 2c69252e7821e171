//! VGG-16 feature extractor.
//!
//! See Very Deep Convolutional Networks for Large-Scale Image Recognition
//! <https://arxiv.org/abs/1409.1556>
//!
//! The classifier head and the last max pooling are dropped, the regions are read from the
//! output of `conv5_3`, i.e. a 14x14x512 grid for 224x224 images.
use candle::{Module, ModuleT, Result, Tensor};
use candle_nn::{FuncT, VarBuilder};

use super::{FeatureExtractor, FeatureGrid};
use crate::with_tracing::{batch_norm as norm, conv2d};

const CHANNELS: usize = 512;

#[derive(Debug)]
pub struct Vgg16 {
    blocks: Vec<FuncT<'static>>,
    grid: FeatureGrid,
    span: tracing::Span,
}

// A block is a stack of 3x3 convolutions, each followed by batch normalization and a relu.
// All the blocks but the last one end with a 2x2 max pooling.
fn conv2d_block(
    convs: &[(usize, usize, &str)],
    pool: bool,
    batch_norm: bool,
    vb: &VarBuilder,
) -> Result<FuncT<'static>> {
    let cfg = candle_nn::Conv2dConfig {
        stride: 1,
        padding: 1,
        ..Default::default()
    };
    let layers = convs
        .iter()
        .map(|&(in_c, out_c, name)| {
            let conv = conv2d(in_c, out_c, 3, cfg, vb.pp(format!("conv{name}")))?;
            let bn = norm(out_c, batch_norm, vb.pp(format!("bn{name}")))?;
            Ok((conv, bn))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(FuncT::new(move |xs, train| {
        let mut xs = xs.clone();
        for (conv, bn) in layers.iter() {
            xs = conv.forward(&xs)?.apply_t(bn, train)?.relu()?
        }
        if pool {
            xs = xs.max_pool2d_with_stride(2, 2)?
        }
        Ok(xs)
    }))
}

impl Vgg16 {
    pub fn new(image_size: usize, batch_norm: bool, vb: VarBuilder) -> Result<Self> {
        let grid = Self::grid(image_size);
        let blocks = vec![
            conv2d_block(&[(3, 64, "1_1"), (64, 64, "1_2")], true, batch_norm, &vb)?,
            conv2d_block(&[(64, 128, "2_1"), (128, 128, "2_2")], true, batch_norm, &vb)?,
            conv2d_block(
                &[(128, 256, "3_1"), (256, 256, "3_2"), (256, 256, "3_3")],
                true,
                batch_norm,
                &vb,
            )?,
            conv2d_block(
                &[(256, 512, "4_1"), (512, 512, "4_2"), (512, 512, "4_3")],
                true,
                batch_norm,
                &vb,
            )?,
            conv2d_block(
                &[(512, 512, "5_1"), (512, 512, "5_2"), (512, CHANNELS, "5_3")],
                false,
                batch_norm,
                &vb,
            )?,
        ];
        let span = tracing::span!(tracing::Level::TRACE, "vgg16");
        Ok(Self { blocks, grid, span })
    }

    /// Four 2x2 poolings, each one halving the side (rounding down).
    pub fn grid(image_size: usize) -> FeatureGrid {
        let side = (0..4).fold(image_size, |s, _| s / 2);
        FeatureGrid {
            height: side,
            width: side,
            channels: CHANNELS,
        }
    }
}

impl FeatureExtractor for Vgg16 {
    fn grid(&self) -> FeatureGrid {
        self.grid
    }

    fn feature_map(&self, images: &Tensor, train: bool) -> Result<Tensor> {
        let _enter = self.span.enter();
        let mut xs = images.clone();
        for block in self.blocks.iter() {
            xs = block.forward_t(&xs, train)?;
        }
        Ok(xs)
    }
}
