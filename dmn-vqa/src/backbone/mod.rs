//! Convolutional backbones producing the grid of region features.
//!
//! Every backbone maps a batch of NCHW images to a feature map of shape
//! `(batch, channels, height, width)`. The map is then flattened into a sequence of
//! `height * width` regions using a snake walk over the grid: even rows are read left to right,
//! odd rows right to left, so that two consecutive regions of the sequence are always spatial
//! neighbours. The reasoning module runs a bidirectional recurrent encoder over this sequence.
use candle::{Device, Result, Tensor};
use candle_nn::VarBuilder;

pub mod cifar;
pub mod resnet;
pub mod vgg;

pub use cifar::CifarResNet;
pub use resnet::ResNet;
pub use vgg::Vgg16;

/// The backbones that can be selected in the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Backbone {
    Vgg16,
    Resnet50,
    Resnet101,
    Resnet152,
    ResnetCifar10,
}

/// Shape of the feature map produced by a backbone, `height * width` regions of `channels`
/// features each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureGrid {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

impl FeatureGrid {
    /// Number of regions N.
    pub fn len(&self) -> usize {
        self.height * self.width
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// Output side of a convolution or pooling with the given kernel/stride/padding.
pub(crate) fn conv_out(size: usize, kernel: usize, stride: usize, padding: usize) -> usize {
    (size + 2 * padding).saturating_sub(kernel) / stride + 1
}

impl Backbone {
    /// The grid produced for square images of side `image_size`.
    pub fn grid(&self, image_size: usize) -> Result<FeatureGrid> {
        let grid = match self {
            Self::Vgg16 => Vgg16::grid(image_size),
            Self::Resnet50 | Self::Resnet101 | Self::Resnet152 => ResNet::grid(image_size),
            Self::ResnetCifar10 => CifarResNet::grid(image_size)?,
        };
        if grid.is_empty() {
            candle::bail!("{self:?} produces an empty grid for {image_size}px images")
        }
        Ok(grid)
    }
}

/// A convolutional feature extractor.
pub trait FeatureExtractor: std::fmt::Debug + Send + Sync {
    /// The shape of the feature maps returned by [`FeatureExtractor::feature_map`].
    fn grid(&self) -> FeatureGrid;

    /// Runs the backbone on `(batch, 3, size, size)` images and returns the last feature map
    /// as `(batch, channels, height, width)`.
    fn feature_map(&self, images: &Tensor, train: bool) -> Result<Tensor>;
}

/// Creates the extractor for `backbone`, its variables are stored under `vb`.
pub fn extractor(
    backbone: Backbone,
    image_size: usize,
    batch_norm: bool,
    vb: VarBuilder,
) -> Result<Box<dyn FeatureExtractor>> {
    let extractor: Box<dyn FeatureExtractor> = match backbone {
        Backbone::Vgg16 => Box::new(Vgg16::new(image_size, batch_norm, vb)?),
        Backbone::Resnet50 => Box::new(ResNet::resnet50(image_size, batch_norm, vb)?),
        Backbone::Resnet101 => Box::new(ResNet::resnet101(image_size, batch_norm, vb)?),
        Backbone::Resnet152 => Box::new(ResNet::resnet152(image_size, batch_norm, vb)?),
        Backbone::ResnetCifar10 => Box::new(CifarResNet::new(image_size, batch_norm, vb)?),
    };
    Ok(extractor)
}

/// The snake walk over a `height x width` grid.
///
/// `order[i * width + j]` is the row-major index of the j-th region of the i-th row of the
/// walk: `i * width + j` for even rows and `(i + 1) * width - j - 1` for odd rows.
pub fn snake_permutation(height: usize, width: usize) -> Vec<u32> {
    let mut order = Vec::with_capacity(height * width);
    for i in 0..height {
        for j in 0..width {
            let index = if i % 2 == 0 {
                i * width + j
            } else {
                (i + 1) * width - j - 1
            };
            order.push(index as u32)
        }
    }
    order
}

/// Flattens a `(batch, channels, height, width)` feature map into `(batch, regions, channels)`
/// with the regions in `order`.
pub fn flatten_feats(feature_map: &Tensor, order: &Tensor) -> Result<Tensor> {
    let (b_size, channels, height, width) = feature_map.dims4()?;
    feature_map
        .reshape((b_size, channels, height * width))?
        .transpose(1, 2)?
        .contiguous()?
        .index_select(order, 1)
}

/// A backbone together with the region order, the order is computed once and reused for every
/// batch.
#[derive(Debug)]
pub struct RegionFeatures {
    extractor: Box<dyn FeatureExtractor>,
    order: Tensor,
    grid: FeatureGrid,
    span: tracing::Span,
}

impl RegionFeatures {
    pub fn new(extractor: Box<dyn FeatureExtractor>, device: &Device) -> Result<Self> {
        let grid = extractor.grid();
        let order = snake_permutation(grid.height, grid.width);
        let order = Tensor::from_vec(order, grid.len(), device)?;
        let span = tracing::span!(tracing::Level::TRACE, "region-features");
        Ok(Self {
            extractor,
            order,
            grid,
            span,
        })
    }

    pub fn grid(&self) -> FeatureGrid {
        self.grid
    }

    /// Maps `(batch, 3, size, size)` images to `(batch, regions, channels)` region features.
    pub fn extract(&self, images: &Tensor, train: bool) -> Result<Tensor> {
        let _enter = self.span.enter();
        let feature_map = self.extractor.feature_map(images, train)?;
        let (_b_size, channels, height, width) = feature_map.dims4()?;
        let grid = self.grid;
        if (height, width, channels) != (grid.height, grid.width, grid.channels) {
            candle::bail!(
                "backbone produced a {height}x{width}x{channels} feature map, expected {}x{}x{}",
                grid.height,
                grid.width,
                grid.channels
            )
        }
        flatten_feats(&feature_map, &self.order)
    }
}
