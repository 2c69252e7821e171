//! Optimizers that complement the ones shipped with candle-nn.
//!
//! Both optimizers implement [`candle_nn::Optimizer`] so they can be swapped with
//! [`candle_nn::SGD`] and [`candle_nn::AdamW`] behind a common solver selection.
pub mod momentum;
pub mod rmsprop;

pub use momentum::{Momentum, ParamsMomentum};
pub use rmsprop::{ParamsRmsProp, RmsProp};
