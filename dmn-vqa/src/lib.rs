//! Visual question answering with a dynamic memory network.
//!
//! A convolutional backbone turns each image into a grid of region features, the regions are
//! contextualised by a bidirectional GRU and an episodic memory attends over them for a fixed
//! number of hops, starting from the question encoding. The final memory and the question
//! are decoded into a single answer word.
//!
//! - Dynamic Memory Networks for Visual and Textual Question Answering, Xiong et al. 2016
//!   <https://arxiv.org/abs/1603.01417>
pub mod attention;
pub mod backbone;
pub mod config;
pub mod decoder;
pub mod encoder;
pub mod episodic;
pub mod loss;
pub mod model;
pub mod params;
pub mod rnn;
pub mod train;
pub mod with_tracing;
pub mod word_table;

pub use config::Config;
pub use model::{Batch, Output, QuestionAnswerer, Visual};
