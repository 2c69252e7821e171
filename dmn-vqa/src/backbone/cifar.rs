//! Pre-activation residual network for small (CIFAR-10 sized) images.
//!
//! A 3x3 stem followed by two residual stages (16 then 32 filters, the second one with stride 2)
//! and a final 2x2 max pooling. Each residual unit is `bn -> leaky relu -> conv -> bn ->
//! leaky relu -> conv -> dropout`, projection-free shortcuts are average pooled and zero padded
//! along the channel axis when the width changes.
use candle::{ModuleT, Result, Tensor};
use candle_nn::{Dropout, FuncT, VarBuilder};

use super::{FeatureExtractor, FeatureGrid};
use crate::with_tracing::{batch_norm as norm, conv2d_no_bias, Conv2d};

const FILTERS: [usize; 3] = [16, 16, 32];
const UNITS_PER_STAGE: usize = 5;
const LEAKINESS: f64 = 0.1;
const DROPOUT: f32 = 0.2;

fn conv3x3(c_in: usize, c_out: usize, stride: usize, vb: VarBuilder) -> Result<Conv2d> {
    let cfg = candle_nn::Conv2dConfig {
        stride,
        padding: 1,
        ..Default::default()
    };
    conv2d_no_bias(c_in, c_out, 3, cfg, vb)
}

fn residual(
    c_in: usize,
    c_out: usize,
    stride: usize,
    activate_before_residual: bool,
    batch_norm: bool,
    vb: VarBuilder,
) -> Result<FuncT<'static>> {
    let bn1 = norm(c_in, batch_norm, vb.pp("bn1"))?;
    let conv1 = conv3x3(c_in, c_out, stride, vb.pp("conv1"))?;
    let bn2 = norm(c_out, batch_norm, vb.pp("bn2"))?;
    let conv2 = conv3x3(c_out, c_out, 1, vb.pp("conv2"))?;
    let dropout = Dropout::new(DROPOUT);
    let pad = (c_out - c_in) / 2;
    Ok(FuncT::new(move |xs, train| {
        let activated = candle_nn::ops::leaky_relu(&xs.apply_t(&bn1, train)?, LEAKINESS)?;
        let shortcut = if activate_before_residual {
            activated.clone()
        } else {
            xs.clone()
        };
        let ys = activated.apply(&conv1)?.apply_t(&bn2, train)?;
        let ys = candle_nn::ops::leaky_relu(&ys, LEAKINESS)?
            .apply(&conv2)?
            .apply_t(&dropout, train)?;
        let shortcut = if c_in != c_out {
            shortcut
                .avg_pool2d_with_stride(stride, stride)?
                .pad_with_zeros(1, pad, pad)?
        } else {
            shortcut
        };
        ys + shortcut
    }))
}

fn residual_stage(
    c_in: usize,
    c_out: usize,
    stride: usize,
    batch_norm: bool,
    vb: VarBuilder,
) -> Result<FuncT<'static>> {
    let mut units = Vec::with_capacity(UNITS_PER_STAGE);
    units.push(residual(c_in, c_out, stride, true, batch_norm, vb.pp(0))?);
    for index in 1..UNITS_PER_STAGE {
        units.push(residual(c_out, c_out, 1, false, batch_norm, vb.pp(index))?)
    }
    Ok(FuncT::new(move |xs, train| {
        let mut xs = xs.clone();
        for unit in units.iter() {
            xs = xs.apply_t(unit, train)?
        }
        Ok(xs)
    }))
}

#[derive(Debug)]
pub struct CifarResNet {
    stem: Conv2d,
    stages: [FuncT<'static>; 2],
    grid: FeatureGrid,
    span: tracing::Span,
}

impl CifarResNet {
    pub fn new(image_size: usize, batch_norm: bool, vb: VarBuilder) -> Result<Self> {
        let grid = Self::grid(image_size)?;
        let stem = conv3x3(3, FILTERS[1], 1, vb.pp("init"))?;
        let stages = [
            residual_stage(FILTERS[0], FILTERS[1], 1, batch_norm, vb.pp("unit1"))?,
            residual_stage(FILTERS[1], FILTERS[2], 2, batch_norm, vb.pp("unit2"))?,
        ];
        let span = tracing::span!(tracing::Level::TRACE, "cifar-resnet");
        Ok(Self {
            stem,
            stages,
            grid,
            span,
        })
    }

    /// The strided stage and the final pooling each halve the side, the side has to be a
    /// multiple of 4 so that the strided convolutions and the pooled shortcuts agree.
    pub fn grid(image_size: usize) -> Result<FeatureGrid> {
        if image_size == 0 || image_size % 4 != 0 {
            candle::bail!("the cifar backbone expects a multiple of 4 as image size, got {image_size}")
        }
        Ok(FeatureGrid {
            height: image_size / 4,
            width: image_size / 4,
            channels: FILTERS[2],
        })
    }
}

impl FeatureExtractor for CifarResNet {
    fn grid(&self) -> FeatureGrid {
        self.grid
    }

    fn feature_map(&self, images: &Tensor, train: bool) -> Result<Tensor> {
        let _enter = self.span.enter();
        let mut xs = images.apply(&self.stem)?;
        for stage in self.stages.iter() {
            xs = stage.forward_t(&xs, train)?
        }
        xs.max_pool2d_with_stride(2, 2)
    }
}
