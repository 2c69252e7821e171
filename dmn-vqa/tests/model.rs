#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

use anyhow::Result;
use candle::{test_utils::to_vec2_round, DType, Device, Tensor, D};
use dmn_vqa::config::Config;
use dmn_vqa::model::{Batch, QuestionAnswerer, Visual};
use dmn_vqa::params::Group;
use dmn_vqa::word_table::WordTable;

const V: usize = 5;

// B=2, N=4 (a 2x2 grid of 32 channels), H=8, V=5, two tied hops with a gru update.
fn config() -> Config {
    Config {
        image_size: 8,
        dim_hidden: 8,
        memory_step: 2,
        ..Config::tiny(V)
    }
}

fn questions(dev: &Device) -> Result<(Tensor, Tensor)> {
    let questions = Tensor::new(&[[1u32, 2, 3, 0, 0], [4, 4, 1, 2, 0]], dev)?;
    let lens = Tensor::new(&[3u32, 4], dev)?;
    Ok((questions, lens))
}

fn feature_batch(cfg: &Config, dev: &Device) -> Result<Batch> {
    let grid = cfg.feature_grid()?;
    let feats = Tensor::randn(0f32, 1., (2, grid.len(), grid.channels), dev)?;
    let (questions, question_lens) = questions(dev)?;
    Ok(Batch {
        visual: Visual::Features(feats),
        questions,
        question_lens,
        answers: None,
        answer_weights: None,
    })
}

#[test]
fn end_to_end() -> Result<()> {
    let dev = &Device::Cpu;
    let cfg = config();
    let model = QuestionAnswerer::new(cfg.clone(), None, dev)?;
    assert_eq!(model.grid().len(), 4);
    let batch = feature_batch(&cfg, dev)?;

    let (question, trace) = model.reason(&batch, false)?;
    assert_eq!(question.dims(), &[2, 8]);
    assert_eq!(trace.memories.len(), 3);
    assert_ne!(trace.memories[2].to_vec2::<f32>()?, question.to_vec2::<f32>()?);

    let output = model.forward(&batch, false)?;
    assert!(output.loss.is_none());
    assert_eq!(output.logits.dims(), &[2, V]);
    assert_eq!(output.distribution.dims(), &[2, V]);
    assert_eq!(output.predicted.dtype(), DType::U32);
    let sums = output.distribution.sum(D::Minus1)?.to_vec1::<f32>()?;
    assert!(sums.iter().all(|s| (s - 1.).abs() < 1e-5), "{sums:?}");
    assert_eq!(
        output.predicted.to_vec1::<u32>()?,
        output.logits.argmax(D::Minus1)?.to_vec1::<u32>()?
    );
    assert_eq!(
        output.confidence.to_vec1::<f32>()?,
        output.distribution.max(D::Minus1)?.to_vec1::<f32>()?
    );
    // Inference is deterministic.
    let again = model.forward(&batch, false)?;
    assert_eq!(
        output.logits.to_vec2::<f32>()?,
        again.logits.to_vec2::<f32>()?
    );
    Ok(())
}

#[test]
fn losses() -> Result<()> {
    let dev = &Device::Cpu;
    let cfg = config();
    let model = QuestionAnswerer::new(cfg.clone(), None, dev)?;
    let batch = feature_batch(&cfg, dev)?;

    // Training requires the answers and their weights.
    assert!(model.forward(&batch, true).is_err());
    let with_answers = Batch {
        answers: Some(Tensor::new(&[0u32, 3], dev)?),
        ..batch.clone()
    };
    assert!(model.forward(&with_answers, true).is_err());

    // Evaluation uses uniform weights by default.
    let output = model.forward(&with_answers, false)?;
    let loss = output.loss.expect("loss with answers");
    let weighted = Batch {
        answer_weights: Some(Tensor::new(&[2f32, 2.], dev)?),
        ..with_answers
    };
    let weighted_loss = model
        .forward(&weighted, false)?
        .loss
        .expect("loss with answers");
    assert_eq!(
        loss.total.to_scalar::<f32>()?,
        weighted_loss.total.to_scalar::<f32>()?
    );
    let weighted_train = model.forward(&weighted, true)?;
    assert!(weighted_train.loss.is_some());
    Ok(())
}

#[test]
fn visual_input_must_match_the_backbone() -> Result<()> {
    let dev = &Device::Cpu;
    let cfg = config();
    let model = QuestionAnswerer::new(cfg.clone(), None, dev)?;
    let (questions, question_lens) = questions(dev)?;
    let images = Batch {
        visual: Visual::Images(Tensor::randn(0f32, 1., (2, 3, 8, 8), dev)?),
        questions: questions.clone(),
        question_lens: question_lens.clone(),
        answers: None,
        answer_weights: None,
    };
    assert!(model.forward(&images, false).is_err());
    let wrong_grid = Batch {
        visual: Visual::Features(Tensor::randn(0f32, 1., (2, 5, 32), dev)?),
        ..images.clone()
    };
    assert!(model.forward(&wrong_grid, false).is_err());
    let wrong_batch = Batch {
        visual: Visual::Features(Tensor::randn(0f32, 1., (3, 4, 32), dev)?),
        ..images
    };
    assert!(model.forward(&wrong_batch, false).is_err());
    Ok(())
}

#[test]
fn trained_backbone() -> Result<()> {
    let dev = &Device::Cpu;
    let cfg = Config {
        train_cnn: true,
        ..config()
    };
    let model = QuestionAnswerer::new(cfg.clone(), None, dev)?;
    let params = model.params();
    assert!(params.num_parameters(Group::Backbone, "")? > 0);
    let trainable = params.trainable_vars(true)?.len();
    assert!(trainable > params.trainable_vars(false)?.len());

    let (questions, question_lens) = questions(dev)?;
    let batch = Batch {
        visual: Visual::Images(Tensor::randn(0f32, 1., (2, 3, 8, 8), dev)?),
        questions,
        question_lens,
        answers: Some(Tensor::new(&[1u32, 2], dev)?),
        answer_weights: Some(Tensor::new(&[1f32, 1.], dev)?),
    };
    let output = model.forward(&batch, true)?;
    assert!(output.loss.is_some());
    // Pre-extracted features cannot be used when the backbone is trained.
    assert!(model.forward(&feature_batch(&cfg, dev)?, false).is_err());

    // The backbone kernels are part of the weight decay.
    let frozen_cnn = QuestionAnswerer::new(config(), None, dev)?;
    assert!(model.decayed_weights()?.len() > frozen_cnn.decayed_weights()?.len());
    Ok(())
}

#[test]
fn checkpoint_round_trip() -> Result<()> {
    let dev = &Device::Cpu;
    let cfg = config();
    let model = QuestionAnswerer::new(cfg.clone(), None, dev)?;
    let batch = feature_batch(&cfg, dev)?;
    let expected = model.forward(&batch, false)?.logits;

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("model.safetensors");
    model.params().save(&path)?;

    let restored = QuestionAnswerer::new(cfg.clone(), None, dev)?;
    let before = restored.forward(&batch, false)?.logits;
    assert_ne!(before.to_vec2::<f32>()?, expected.to_vec2::<f32>()?);
    restored.params().load(&path)?;
    let after = restored.forward(&batch, false)?.logits;
    assert_eq!(to_vec2_round(&after, 5)?, to_vec2_round(&expected, 5)?);

    // A checkpoint of a different architecture is rejected.
    let untied = QuestionAnswerer::new(
        Config {
            tie_memory_weight: false,
            ..cfg
        },
        None,
        dev,
    )?;
    assert!(untied.params().load(&path).is_err());
    Ok(())
}

#[test]
fn backbone_checkpoint() -> Result<()> {
    let dev = &Device::Cpu;
    let cfg = Config {
        train_cnn: true,
        ..config()
    };
    let model = QuestionAnswerer::new(cfg.clone(), None, dev)?;
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("backbone.safetensors");
    model.params().save_backbone(&path)?;

    let other = QuestionAnswerer::new(
        Config {
            memory_step: 3,
            ..cfg
        },
        None,
        dev,
    )?;
    other.params().load_backbone(&path)?;
    let original = model.params().named_vars(Group::Backbone)?;
    let loaded = other.params().named_vars(Group::Backbone)?;
    assert_eq!(original.len(), loaded.len());
    for ((n1, v1), (n2, v2)) in original.iter().zip(loaded.iter()) {
        assert_eq!(n1, n2);
        let diff = (v1.as_tensor() - v2.as_tensor())?
            .abs()?
            .flatten_all()?
            .max(0)?
            .to_scalar::<f32>()?;
        assert_eq!(diff, 0.);
    }
    Ok(())
}

#[test]
fn word_embeddings() -> Result<()> {
    let dev = &Device::Cpu;
    let words = ["<pad>", "a", "b", "c", "d"]
        .iter()
        .map(|w| w.to_string())
        .collect();
    let vectors = (0..V)
        .map(|i| (0..6).map(|j| (i * 6 + j) as f32).collect())
        .collect::<Vec<Vec<f32>>>();
    let table = WordTable::new(words, vec![], Some(vectors))?;
    let expected = table
        .embeddings(6, DType::F32, dev)?
        .expect("vectors")
        .to_vec2::<f32>()?;

    for fix_embed_weight in [false, true] {
        let cfg = Config {
            fix_embed_weight,
            ..config()
        };
        let model = QuestionAnswerer::new(cfg, Some(&table), dev)?;
        let params = model.params();
        let group = if fix_embed_weight {
            Group::Frozen
        } else {
            Group::Reasoning
        };
        let embedding = params
            .named_vars(group)?
            .into_iter()
            .find(|(name, _)| name == "embedding.weight")
            .expect("embedding variable");
        assert_eq!(embedding.1.to_vec2::<f32>()?, expected);
        let trainable = params.trainable_vars(false)?;
        let is_trainable = trainable.iter().any(|v| v.id() == embedding.1.id());
        assert_eq!(is_trainable, !fix_embed_weight);
        let embedded = model
            .encoder()
            .embed(&Tensor::new(&[[2u32]], dev)?)?
            .squeeze(0)?
            .to_vec2::<f32>()?;
        assert_eq!(embedded[0], expected[2]);
    }

    let wrong_vocabulary = Config {
        num_words: V + 1,
        ..config()
    };
    assert!(QuestionAnswerer::new(wrong_vocabulary, Some(&table), dev).is_err());
    Ok(())
}
