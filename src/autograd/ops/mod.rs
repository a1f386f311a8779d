//! Autograd operations with backward passes
//!
//! This module provides differentiable operations for automatic differentiation.

mod activations;
mod basic;
mod matmul;
mod normalize;
mod select;

// Re-export all public operations
pub use activations::{gelu, relu};
pub use basic::{add, add_row_bias};
pub use matmul::{linear, matmul, matmul_bt, matmul_compute, transpose};
pub use normalize::layer_norm_rows;
pub use select::{concat_cols, dropout, gather_rows, mask_columns};
