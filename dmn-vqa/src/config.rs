//! Model and training configuration.
//!
//! The configuration is usually loaded from a json file, every field except the dimensions of
//! the question/answer vocabulary has a default matching the usual training setup.
use candle::Result;

use crate::backbone::{Backbone, FeatureGrid};

/// How the memory state is refreshed at the end of each reasoning hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryUpdate {
    /// `m_t = GRU(fact_t, m_{t-1})`.
    Gru,
    /// `m_t = relu(bn(W [m_{t-1}; fact_t; q] + b))`.
    Concat,
}

/// How the attention gates are used to aggregate the facts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttentionMechanism {
    /// Gate-weighted sum of the facts.
    Soft,
    /// Attention based GRU where the gate replaces the update gate.
    Gru,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Solver {
    Adam,
    Momentum,
    Rmsprop,
    Sgd,
}

fn default_backbone() -> Backbone {
    Backbone::Vgg16
}
fn default_image_size() -> usize {
    224
}
fn default_true() -> bool {
    true
}
fn default_dim_hidden() -> usize {
    512
}
fn default_dim_embed() -> usize {
    300
}
fn default_max_ques_len() -> usize {
    30
}
fn default_memory_step() -> usize {
    3
}
fn default_memory_update() -> MemoryUpdate {
    MemoryUpdate::Gru
}
fn default_attention() -> AttentionMechanism {
    AttentionMechanism::Soft
}
fn default_memory_dropout() -> f32 {
    0.5
}
fn default_solver() -> Solver {
    Solver::Adam
}
fn default_learning_rate() -> f64 {
    1e-4
}
fn default_momentum() -> f64 {
    0.9
}
fn default_decay() -> f64 {
    0.9
}
fn default_weight_decay() -> f64 {
    1e-4
}
fn default_clip_gradients() -> f64 {
    3.0
}
fn default_class_balancing_factor() -> f64 {
    0.
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Config {
    /// Size V of the word table, questions and answers share it.
    pub num_words: usize,
    #[serde(default = "default_backbone")]
    pub backbone: Backbone,
    /// Side of the square input images.
    #[serde(default = "default_image_size")]
    pub image_size: usize,
    /// When false no backbone is built and the region features have to be supplied.
    #[serde(default)]
    pub train_cnn: bool,
    /// Toggles the batch normalization layers in the backbone and the concat memory update.
    #[serde(default = "default_true")]
    pub batch_norm: bool,
    #[serde(default = "default_dim_hidden")]
    pub dim_hidden: usize,
    #[serde(default = "default_dim_embed")]
    pub dim_embed: usize,
    #[serde(default = "default_max_ques_len")]
    pub max_ques_len: usize,
    /// Keep the word embeddings frozen to their initial (pretrained) values.
    #[serde(default)]
    pub fix_embed_weight: bool,
    /// Number of reasoning hops.
    #[serde(default = "default_memory_step")]
    pub memory_step: usize,
    #[serde(default = "default_memory_update")]
    pub memory_update: MemoryUpdate,
    #[serde(default = "default_attention")]
    pub attention: AttentionMechanism,
    /// Share a single parameter set between all the reasoning hops.
    #[serde(default = "default_true")]
    pub tie_memory_weight: bool,
    #[serde(default = "default_memory_dropout")]
    pub memory_dropout: f32,
    #[serde(default = "default_solver")]
    pub solver: Solver,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_momentum")]
    pub momentum: f64,
    #[serde(default = "default_decay")]
    pub decay: f64,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    /// Maximum global norm of the gradients.
    #[serde(default = "default_clip_gradients")]
    pub clip_gradients: f64,
    #[serde(default = "default_class_balancing_factor")]
    pub class_balancing_factor: f64,
}

impl Config {
    /// A small configuration running on pre-extracted features, handy for tests.
    pub fn tiny(num_words: usize) -> Self {
        Self {
            num_words,
            backbone: Backbone::ResnetCifar10,
            image_size: 32,
            train_cnn: false,
            batch_norm: true,
            dim_hidden: 8,
            dim_embed: 6,
            max_ques_len: 5,
            fix_embed_weight: false,
            memory_step: 2,
            memory_update: MemoryUpdate::Gru,
            attention: AttentionMechanism::Soft,
            tie_memory_weight: true,
            memory_dropout: 0.5,
            solver: Solver::Adam,
            learning_rate: 1e-3,
            momentum: default_momentum(),
            decay: default_decay(),
            weight_decay: default_weight_decay(),
            clip_gradients: default_clip_gradients(),
            class_balancing_factor: default_class_balancing_factor(),
        }
    }

    pub fn from_json_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read(path)?;
        let config: Self = serde_json::from_slice(&content)
            .map_err(|err| candle::Error::Msg(format!("invalid config {path:?}: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// The region grid fed to the reasoning module, as reported by the selected backbone.
    pub fn feature_grid(&self) -> Result<FeatureGrid> {
        self.backbone.grid(self.image_size)
    }

    /// Checks the invariants that cannot be recovered from at run time.
    pub fn validate(&self) -> Result<()> {
        if self.num_words == 0 {
            candle::bail!("the word table cannot be empty")
        }
        if self.dim_hidden == 0 || self.dim_embed == 0 {
            candle::bail!(
                "hidden and embedding sizes must be positive ({} {})",
                self.dim_hidden,
                self.dim_embed
            )
        }
        if self.max_ques_len == 0 {
            candle::bail!("max_ques_len must be positive")
        }
        if !(0. ..1.).contains(&self.memory_dropout) {
            candle::bail!("memory_dropout must be in [0, 1) {}", self.memory_dropout)
        }
        if self.clip_gradients <= 0. {
            candle::bail!("clip_gradients must be positive {}", self.clip_gradients)
        }
        if self.weight_decay < 0. {
            candle::bail!("weight_decay cannot be negative {}", self.weight_decay)
        }
        self.feature_grid()?;
        Ok(())
    }
}
