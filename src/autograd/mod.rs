//! Tape-based autograd engine
//!
//! Provides automatic differentiation over flat row-major tensors. Every op
//! records a [`BackwardOp`] on its result; [`backward`] runs them once each in
//! reverse topological order.

mod backward;
mod ops;
mod tensor;

#[cfg(test)]
pub(crate) mod tests;

pub use backward::{backward, BackwardOp};
pub use ops::*;
pub use tensor::Tensor;
