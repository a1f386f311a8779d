//! Optimizers for head parameters

mod optimizer;
mod sgd;

pub use optimizer::{NamedParam, Optimizer};
pub use sgd::SGD;
