#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

use anyhow::Result;
use candle::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use dmn_vqa::backbone::{
    extractor, flatten_feats, snake_permutation, Backbone, FeatureExtractor, FeatureGrid,
    RegionFeatures,
};

#[test]
fn snake_permutation_is_a_bijection() -> Result<()> {
    for (h, w) in [(1, 1), (2, 2), (3, 5), (7, 7), (14, 14)] {
        let mut order = snake_permutation(h, w);
        assert_eq!(order.len(), h * w);
        order.sort();
        assert_eq!(order, (0..(h * w) as u32).collect::<Vec<_>>());
    }
    Ok(())
}

#[test]
fn snake_permutation_rows() -> Result<()> {
    let order = snake_permutation(3, 4);
    assert_eq!(order, [0, 1, 2, 3, 7, 6, 5, 4, 8, 9, 10, 11]);
    let (h, w) = (7, 7);
    let order = snake_permutation(h, w);
    for i in 0..h {
        for j in 0..w {
            let expected = if i % 2 == 0 { i * w + j } else { i * w + (w - 1 - j) };
            assert_eq!(order[i * w + j] as usize, expected);
        }
    }
    Ok(())
}

#[test]
fn grids() -> Result<()> {
    let grid = |height, width, channels| FeatureGrid {
        height,
        width,
        channels,
    };
    assert_eq!(Backbone::Vgg16.grid(224)?, grid(14, 14, 512));
    assert_eq!(Backbone::Resnet50.grid(224)?, grid(7, 7, 2048));
    assert_eq!(Backbone::Resnet101.grid(224)?, grid(7, 7, 2048));
    assert_eq!(Backbone::Resnet152.grid(224)?, grid(7, 7, 2048));
    assert_eq!(Backbone::ResnetCifar10.grid(32)?, grid(8, 8, 32));
    assert_eq!(Backbone::Vgg16.grid(224)?.len(), 196);
    // Too small for vgg, not a multiple of 4 for the cifar network.
    assert!(Backbone::Vgg16.grid(8).is_err());
    assert!(Backbone::ResnetCifar10.grid(30).is_err());
    Ok(())
}

#[test]
fn flatten_in_snake_order() -> Result<()> {
    let dev = &Device::Cpu;
    // One image, two channels on a 2x3 grid, the second channel is the first one negated.
    let fmap = Tensor::arange(0f32, 6., dev)?.reshape((1, 1, 2, 3))?;
    let fmap = Tensor::cat(&[&fmap, &fmap.neg()?], 1)?;
    let order = Tensor::new(snake_permutation(2, 3).as_slice(), dev)?;
    let flat = flatten_feats(&fmap, &order)?;
    assert_eq!(flat.dims(), &[1, 6, 2]);
    assert_eq!(
        flat.squeeze(0)?.to_vec2::<f32>()?,
        &[
            [0., -0.],
            [1., -1.],
            [2., -2.],
            [5., -5.],
            [4., -4.],
            [3., -3.]
        ]
    );
    Ok(())
}

#[test]
fn cifar_region_features() -> Result<()> {
    let dev = &Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, dev);
    let extractor = extractor(Backbone::ResnetCifar10, 8, true, vb)?;
    let regions = RegionFeatures::new(extractor, dev)?;
    let grid = regions.grid();
    assert_eq!((grid.height, grid.width, grid.channels), (2, 2, 32));
    let images = Tensor::randn(0f32, 1., (2, 3, 8, 8), dev)?;
    let feats = regions.extract(&images, false)?;
    assert_eq!(feats.dims(), &[2, 4, 32]);
    // Training mode goes through the batch statistics and the dropout.
    let feats = regions.extract(&images, true)?;
    assert_eq!(feats.dims(), &[2, 4, 32]);
    // The images must have the configured size.
    let images = Tensor::randn(0f32, 1., (2, 3, 16, 16), dev)?;
    assert!(regions.extract(&images, false).is_err());
    Ok(())
}

#[test]
fn region_features_follow_the_snake_walk() -> Result<()> {
    let dev = &Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, dev);
    // Both extractors share the variables of the varmap.
    let direct = extractor(Backbone::ResnetCifar10, 16, true, vb.clone())?;
    let regions = RegionFeatures::new(extractor(Backbone::ResnetCifar10, 16, true, vb)?, dev)?;
    let images = Tensor::randn(0f32, 1., (3, 3, 16, 16), dev)?;

    let fmap = direct.feature_map(&images, false)?;
    assert_eq!(fmap.dims(), &[3, 32, 4, 4]);
    let row_major = fmap.flatten_from(2)?.transpose(1, 2)?.to_vec3::<f32>()?;
    let order = snake_permutation(4, 4);
    let expected = row_major
        .iter()
        .map(|regions| {
            order
                .iter()
                .map(|&i| regions[i as usize].clone())
                .collect::<Vec<_>>()
        })
        .collect::<Vec<_>>();

    let feats = regions.extract(&images, false)?;
    assert_eq!(feats.dims(), &[3, 16, 32]);
    assert_eq!(feats.to_vec3::<f32>()?, expected);
    Ok(())
}

#[test]
fn cifar_without_batch_norm() -> Result<()> {
    let dev = &Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, dev);
    let extractor = extractor(Backbone::ResnetCifar10, 4, false, vb)?;
    let names = varmap.data().lock().unwrap().keys().cloned().collect::<Vec<_>>();
    assert!(!names.is_empty());
    assert!(names.iter().all(|n| !n.contains("bn")));
    let images = Tensor::randn(0f32, 1., (1, 3, 4, 4), dev)?;
    let fmap = extractor.feature_map(&images, false)?;
    assert_eq!(fmap.dims(), &[1, 32, 1, 1]);
    Ok(())
}
