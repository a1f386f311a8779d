//! Optimizer trait

use crate::Tensor;

/// A trainable parameter borrowed by name from a head store
pub type NamedParam<'a> = (String, &'a mut Tensor);

/// Trait for optimization algorithms
///
/// Parameters arrive by stable name, so per-parameter state survives heads
/// being created between steps.
pub trait Optimizer {
    /// Perform a single optimization step
    fn step(&mut self, params: &mut [NamedParam<'_>]);

    /// Zero out all gradients
    fn zero_grad(&mut self, params: &mut [NamedParam<'_>]) {
        for (_, param) in params.iter_mut() {
            param.zero_grad();
        }
    }

    /// Get learning rate
    fn lr(&self) -> f32;

    /// Set learning rate
    fn set_lr(&mut self, lr: f32);
}
