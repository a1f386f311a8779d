//! Named parameters and the affine layer shared by the heads

use crate::autograd::linear;
use crate::optim::NamedParam;
use crate::Tensor;

/// A trainable tensor and its stable name
#[derive(Debug, Clone)]
pub(crate) struct Param {
    pub name: String,
    pub tensor: Tensor,
}

impl Param {
    pub fn new(name: String, tensor: Tensor) -> Self {
        Self { name, tensor }
    }

    pub fn named(&self) -> (String, &Tensor) {
        (self.name.clone(), &self.tensor)
    }

    pub fn named_mut(&mut self) -> NamedParam<'_> {
        (self.name.clone(), &mut self.tensor)
    }
}

/// `x @ kernel + bias` over row vectors
#[derive(Debug, Clone)]
pub(crate) struct Dense {
    pub kernel: Param,
    pub bias: Param,
    pub in_dim: usize,
    pub out_dim: usize,
}

impl Dense {
    /// Apply to `rows` rows of width `in_dim`
    pub fn forward(&self, x: &Tensor, rows: usize) -> Tensor {
        linear(x, &self.kernel.tensor, &self.bias.tensor, rows, self.in_dim)
    }

    pub fn parameters(&self) -> Vec<(String, &Tensor)> {
        vec![self.kernel.named(), self.bias.named()]
    }

    pub fn parameters_mut(&mut self) -> Vec<NamedParam<'_>> {
        vec![self.kernel.named_mut(), self.bias.named_mut()]
    }
}
