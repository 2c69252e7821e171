//! The full question answering model.
//!
//! ```text
//! images -> backbone -> region features -> fact encoder ---------.
//!                                                                 v
//! question -> embedding -> question encoder -> episodic memory -> decoder -> answer
//! ```
//!
//! When the backbone is not trained it is not built at all, the region features then have to be
//! extracted beforehand and are passed to [`QuestionAnswerer::forward`] directly.
use candle::{DType, Device, Result, Tensor};

use crate::backbone::{extractor, FeatureGrid, RegionFeatures};
use crate::config::Config;
use crate::decoder::AnswerDecoder;
use crate::encoder::SequenceEncoder;
use crate::episodic::{EpisodicMemory, Trace};
use crate::loss::{is_decayed, Loss};
use crate::params::{Group, ParamGroups};
use crate::word_table::WordTable;

/// The visual input of a batch.
#[derive(Debug, Clone)]
pub enum Visual {
    /// `(batch, 3, size, size)` images, requires a trained backbone.
    Images(Tensor),
    /// `(batch, regions, channels)` region features in snake order.
    Features(Tensor),
}

#[derive(Debug, Clone)]
pub struct Batch {
    pub visual: Visual,
    /// `(batch, seq_len)` u32 word indexes.
    pub questions: Tensor,
    /// `(batch,)` number of real tokens in each question.
    pub question_lens: Tensor,
    /// `(batch,)` u32 answer word indexes, required for training.
    pub answers: Option<Tensor>,
    /// `(batch,)` per-example loss weights, required for training.
    pub answer_weights: Option<Tensor>,
}

#[derive(Debug, Clone)]
pub struct Output {
    /// Only computed when the answers are known.
    pub loss: Option<Loss>,
    pub predicted: Tensor,
    pub confidence: Tensor,
    pub distribution: Tensor,
    pub logits: Tensor,
}

#[derive(Debug)]
pub struct QuestionAnswerer {
    config: Config,
    params: ParamGroups,
    grid: FeatureGrid,
    backbone: Option<RegionFeatures>,
    encoder: SequenceEncoder,
    memory: EpisodicMemory,
    decoder: AnswerDecoder,
}

impl QuestionAnswerer {
    /// Builds the model and allocates its variables, the word embeddings are initialized from
    /// the word table vectors when there are some.
    pub fn new(config: Config, word_table: Option<&WordTable>, device: &Device) -> Result<Self> {
        config.validate()?;
        if let Some(word_table) = word_table {
            if word_table.num_words() != config.num_words {
                candle::bail!(
                    "the word table has {} words, the config expects {}",
                    word_table.num_words(),
                    config.num_words
                )
            }
        }
        let params = ParamGroups::new(DType::F32, device);
        let grid = config.feature_grid()?;
        let backbone = if config.train_cnn {
            let vb = params.var_builder(Group::Backbone);
            let extractor = extractor(config.backbone, config.image_size, config.batch_norm, vb)?;
            Some(RegionFeatures::new(extractor, device)?)
        } else {
            None
        };

        let vb = params.var_builder(Group::Reasoning);
        let embed_group = if config.fix_embed_weight {
            Group::Frozen
        } else {
            Group::Reasoning
        };
        let encoder = SequenceEncoder::new(
            config.num_words,
            config.dim_embed,
            grid.channels,
            config.dim_hidden,
            vb.pp("encoder"),
            params.var_builder(embed_group).pp("embedding"),
        )?;
        if let Some(word_table) = word_table {
            if let Some(vectors) = word_table.embeddings(config.dim_embed, DType::F32, device)? {
                params.set(embed_group, "embedding.weight", &vectors)?
            }
        }
        let memory = EpisodicMemory::new(&config, grid.len(), vb.pp("episodic"))?;
        let decoder = AnswerDecoder::new(config.dim_hidden, config.num_words, vb.pp("decoder"))?;
        tracing::info!(
            backbone = ?config.backbone,
            regions = grid.len(),
            channels = grid.channels,
            train_cnn = config.train_cnn,
            reasoning_params = params.num_parameters(Group::Reasoning, "")?,
            backbone_params = params.num_parameters(Group::Backbone, "")?,
            "built question answerer"
        );
        Ok(Self {
            config,
            params,
            grid,
            backbone,
            encoder,
            memory,
            decoder,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn params(&self) -> &ParamGroups {
        &self.params
    }

    pub fn grid(&self) -> FeatureGrid {
        self.grid
    }

    pub fn encoder(&self) -> &SequenceEncoder {
        &self.encoder
    }

    pub fn memory(&self) -> &EpisodicMemory {
        &self.memory
    }

    /// The `(batch, regions, channels)` region features of the visual input.
    pub fn region_features(&self, visual: &Visual, train: bool) -> Result<Tensor> {
        match (visual, self.backbone.as_ref()) {
            (Visual::Images(images), Some(backbone)) => backbone.extract(images, train),
            (Visual::Images(_), None) => candle::bail!(
                "the backbone is not trained, the region features have to be provided"
            ),
            (Visual::Features(_), Some(_)) => {
                candle::bail!("the backbone is trained, the images have to be provided")
            }
            (Visual::Features(feats), None) => {
                let (_b_size, num_facts, channels) = feats.dims3()?;
                if num_facts != self.grid.len() || channels != self.grid.channels {
                    candle::bail!(
                        "expected features with {} regions of {} channels, got {:?}",
                        self.grid.len(),
                        self.grid.channels,
                        feats.shape()
                    )
                }
                Ok(feats.clone())
            }
        }
    }

    /// Encodes the batch and runs the episodic memory, returns the question encoding and the
    /// memory trace.
    pub fn reason(&self, batch: &Batch, train: bool) -> Result<(Tensor, Trace)> {
        let feats = self.region_features(&batch.visual, train)?;
        let (b_size, _) = batch.questions.dims2()?;
        if feats.dim(0)? != b_size {
            candle::bail!(
                "got {} visual inputs for {b_size} questions",
                feats.dim(0)?
            )
        }
        let question = self
            .encoder
            .encode_question(&batch.questions, &batch.question_lens)?;
        let facts = self.encoder.encode_facts(&feats)?;
        let trace = self.memory.run_with_trace(&facts, &question, train)?;
        Ok((question, trace))
    }

    /// The variables subject to weight decay, the backbone ones only count when the backbone
    /// is trained.
    pub fn decayed_weights(&self) -> Result<Vec<Tensor>> {
        self.params.select(self.config.train_cnn, is_decayed)
    }

    pub fn forward(&self, batch: &Batch, train: bool) -> Result<Output> {
        let (question, trace) = self.reason(batch, train)?;
        let answer = self.decoder.decode(&trace.output, &question)?;
        let loss = match (&batch.answers, &batch.answer_weights) {
            (Some(answers), Some(weights)) => Some(Loss::new(
                &answer.logits,
                answers,
                weights,
                &self.decayed_weights()?,
                self.config.weight_decay,
            )?),
            (Some(answers), None) if !train => {
                let weights = Tensor::ones(answers.dims1()?, DType::F32, answers.device())?;
                Some(Loss::new(
                    &answer.logits,
                    answers,
                    &weights,
                    &self.decayed_weights()?,
                    self.config.weight_decay,
                )?)
            }
            (None, _) if !train => None,
            (None, _) => candle::bail!("the answers are required for training"),
            (Some(_), None) => candle::bail!("the answer weights are required for training"),
        };
        Ok(Output {
            loss,
            predicted: answer.predicted,
            confidence: answer.confidence,
            distribution: answer.distribution,
            logits: answer.logits,
        })
    }
}
