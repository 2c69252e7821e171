//! Bottleneck ResNet feature extractors (ResNet-50, 101 and 152).
//!
//! See "Deep Residual Learning for Image Recognition" He et al. 2015
//! <https://arxiv.org/abs/1512.03385>
//!
//! The average pooling and the classifier are dropped, the regions are read from the output of
//! the last stage: a 7x7x2048 grid for 224x224 images.
use candle::{ModuleT, Result, Tensor, D};
use candle_nn::{FuncT, VarBuilder};

use super::{conv_out, FeatureExtractor, FeatureGrid};
use crate::with_tracing::{batch_norm as norm, conv2d_no_bias, Conv2d};

const EXPANSION: usize = 4;
const CHANNELS: usize = EXPANSION * 512;

fn conv2d(
    c_in: usize,
    c_out: usize,
    ksize: usize,
    padding: usize,
    stride: usize,
    vb: VarBuilder,
) -> Result<Conv2d> {
    let conv2d_cfg = candle_nn::Conv2dConfig {
        stride,
        padding,
        ..Default::default()
    };
    conv2d_no_bias(c_in, c_out, ksize, conv2d_cfg, vb)
}

fn downsample(
    c_in: usize,
    c_out: usize,
    stride: usize,
    batch_norm: bool,
    vb: VarBuilder,
) -> Result<FuncT<'static>> {
    if stride != 1 || c_in != c_out {
        let conv = conv2d(c_in, c_out, 1, 0, stride, vb.pp("conv"))?;
        let bn = norm(c_out, batch_norm, vb.pp("bn"))?;
        Ok(FuncT::new(move |xs, train| {
            xs.apply(&conv)?.apply_t(&bn, train)
        }))
    } else {
        Ok(FuncT::new(|xs, _train| Ok(xs.clone())))
    }
}

fn bottleneck_block(
    c_in: usize,
    c_out: usize,
    stride: usize,
    batch_norm: bool,
    vb: VarBuilder,
) -> Result<FuncT<'static>> {
    let e_dim = EXPANSION * c_out;
    let conv1 = conv2d(c_in, c_out, 1, 0, 1, vb.pp("conv1"))?;
    let bn1 = norm(c_out, batch_norm, vb.pp("bn1"))?;
    let conv2 = conv2d(c_out, c_out, 3, 1, stride, vb.pp("conv2"))?;
    let bn2 = norm(c_out, batch_norm, vb.pp("bn2"))?;
    let conv3 = conv2d(c_out, e_dim, 1, 0, 1, vb.pp("conv3"))?;
    let bn3 = norm(e_dim, batch_norm, vb.pp("bn3"))?;
    let downsample = downsample(c_in, e_dim, stride, batch_norm, vb.pp("downsample"))?;
    Ok(FuncT::new(move |xs, train| {
        let ys = xs
            .apply(&conv1)?
            .apply_t(&bn1, train)?
            .relu()?
            .apply(&conv2)?
            .apply_t(&bn2, train)?
            .relu()?
            .apply(&conv3)?
            .apply_t(&bn3, train)?;
        (xs.apply_t(&downsample, train)? + ys)?.relu()
    }))
}

fn bottleneck_layer(
    c_in: usize,
    c_out: usize,
    stride: usize,
    cnt: usize,
    batch_norm: bool,
    vb: VarBuilder,
) -> Result<FuncT<'static>> {
    let mut layers = Vec::with_capacity(cnt);
    for index in 0..cnt {
        let l_in = if index == 0 { c_in } else { EXPANSION * c_out };
        let stride = if index == 0 { stride } else { 1 };
        layers.push(bottleneck_block(l_in, c_out, stride, batch_norm, vb.pp(index))?)
    }
    Ok(FuncT::new(move |xs, train| {
        let mut xs = xs.clone();
        for layer in layers.iter() {
            xs = xs.apply_t(layer, train)?
        }
        Ok(xs)
    }))
}

#[derive(Debug)]
pub struct ResNet {
    stem: FuncT<'static>,
    layers: [FuncT<'static>; 4],
    grid: FeatureGrid,
    span: tracing::Span,
}

impl ResNet {
    fn new(
        blocks: [usize; 4],
        image_size: usize,
        batch_norm: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let [c1, c2, c3, c4] = blocks;
        let conv1 = conv2d(3, 64, 7, 3, 2, vb.pp("conv1"))?;
        let bn1 = norm(64, batch_norm, vb.pp("bn1"))?;
        let stem = FuncT::new(move |xs, train| {
            xs.apply(&conv1)?
                .apply_t(&bn1, train)?
                .relu()?
                .pad_with_same(D::Minus1, 1, 1)?
                .pad_with_same(D::Minus2, 1, 1)?
                .max_pool2d_with_stride(3, 2)
        });
        let layers = [
            bottleneck_layer(64, 64, 1, c1, batch_norm, vb.pp("layer1"))?,
            bottleneck_layer(EXPANSION * 64, 128, 2, c2, batch_norm, vb.pp("layer2"))?,
            bottleneck_layer(EXPANSION * 128, 256, 2, c3, batch_norm, vb.pp("layer3"))?,
            bottleneck_layer(EXPANSION * 256, 512, 2, c4, batch_norm, vb.pp("layer4"))?,
        ];
        let grid = Self::grid(image_size);
        let span = tracing::span!(tracing::Level::TRACE, "resnet");
        Ok(Self {
            stem,
            layers,
            grid,
            span,
        })
    }

    pub fn resnet50(image_size: usize, batch_norm: bool, vb: VarBuilder) -> Result<Self> {
        Self::new([3, 4, 6, 3], image_size, batch_norm, vb)
    }

    pub fn resnet101(image_size: usize, batch_norm: bool, vb: VarBuilder) -> Result<Self> {
        Self::new([3, 4, 23, 3], image_size, batch_norm, vb)
    }

    pub fn resnet152(image_size: usize, batch_norm: bool, vb: VarBuilder) -> Result<Self> {
        Self::new([3, 8, 36, 3], image_size, batch_norm, vb)
    }

    /// The stride 2 stem convolution, the stem max pooling and the three strided stages.
    pub fn grid(image_size: usize) -> FeatureGrid {
        let side = conv_out(image_size, 7, 2, 3);
        let side = conv_out(side, 3, 2, 1);
        let side = (0..3).fold(side, |s, _| conv_out(s, 3, 2, 1));
        FeatureGrid {
            height: side,
            width: side,
            channels: CHANNELS,
        }
    }
}

impl FeatureExtractor for ResNet {
    fn grid(&self) -> FeatureGrid {
        self.grid
    }

    fn feature_map(&self, images: &Tensor, train: bool) -> Result<Tensor> {
        let _enter = self.span.enter();
        let mut xs = self.stem.forward_t(images, train)?;
        for layer in self.layers.iter() {
            xs = layer.forward_t(&xs, train)?
        }
        Ok(xs)
    }
}
