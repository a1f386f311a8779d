//! Normalization autograd operations: row-wise layer norm

use crate::autograd::{BackwardOp, Tensor};
use ndarray::Array1;
use std::cell::RefCell;
use std::rc::Rc;

/// Layer normalization applied independently to each row of `[rows, cols]`
///
/// LayerNorm(x) = gamma * (x - mean) / sqrt(var + epsilon) + beta,
/// with gamma and beta of length `cols`.
pub fn layer_norm_rows(
    x: &Tensor,
    gamma: &Tensor,
    beta: &Tensor,
    rows: usize,
    cols: usize,
    epsilon: f32,
) -> Tensor {
    assert_eq!(x.len(), rows * cols, "Input size mismatch");
    assert_eq!(gamma.len(), cols, "Gamma size mismatch");
    assert_eq!(beta.len(), cols, "Beta size mismatch");

    let mut normalized = Array1::zeros(rows * cols);
    let mut stds = Vec::with_capacity(rows);
    let mut data = Array1::zeros(rows * cols);

    for r in 0..rows {
        let row = x.data().slice(ndarray::s![r * cols..(r + 1) * cols]);
        let mean = row.sum() / cols as f32;
        let variance = row.mapv(|v| (v - mean).powi(2)).sum() / cols as f32;
        let std = (variance + epsilon).sqrt();
        stds.push(std);
        for c in 0..cols {
            let n = (row[c] - mean) / std;
            normalized[r * cols + c] = n;
            data[r * cols + c] = n * gamma.data()[c] + beta.data()[c];
        }
    }

    let requires_grad = x.requires_grad() || gamma.requires_grad() || beta.requires_grad();
    let mut result = Tensor::new(data, requires_grad);

    if requires_grad {
        let backward_op = Rc::new(LayerNormRowsBackward {
            x: x.clone(),
            gamma: gamma.clone(),
            beta: beta.clone(),
            normalized,
            stds,
            cols,
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(backward_op);
    }

    result
}

struct LayerNormRowsBackward {
    x: Tensor,
    gamma: Tensor,
    beta: Tensor,
    normalized: Array1<f32>,
    stds: Vec<f32>,
    cols: usize,
    result_grad: Rc<RefCell<Option<Array1<f32>>>>,
}

impl BackwardOp for LayerNormRowsBackward {
    fn backward(&self) {
        if let Some(grad_output) = self.result_grad.borrow().as_ref() {
            let cols = self.cols;

            if self.beta.requires_grad() || self.gamma.requires_grad() {
                let mut grad_beta = Array1::zeros(cols);
                let mut grad_gamma = Array1::zeros(cols);
                for (i, &g) in grad_output.iter().enumerate() {
                    grad_beta[i % cols] += g;
                    grad_gamma[i % cols] += g * self.normalized[i];
                }
                if self.beta.requires_grad() {
                    self.beta.accumulate_grad(grad_beta);
                }
                if self.gamma.requires_grad() {
                    self.gamma.accumulate_grad(grad_gamma);
                }
            }

            if self.x.requires_grad() {
                let n = cols as f32;
                let mut grad_x = Array1::zeros(grad_output.len());
                for (r, &std) in self.stds.iter().enumerate() {
                    let base = r * cols;
                    let grad_norm: Vec<f32> = (0..cols)
                        .map(|c| grad_output[base + c] * self.gamma.data()[c])
                        .collect();
                    let sum_grad: f32 = grad_norm.iter().sum();
                    let sum_grad_norm: f32 = grad_norm
                        .iter()
                        .enumerate()
                        .map(|(c, g)| g * self.normalized[base + c])
                        .sum();
                    // ∂L/∂x_i = (1/std) * [ĝ_i - mean(ĝ) - x̂_i * mean(ĝ ⊙ x̂)]
                    for (c, g) in grad_norm.iter().enumerate() {
                        let norm = self.normalized[base + c];
                        grad_x[base + c] = (g - sum_grad / n - norm * sum_grad_norm / n) / std;
                    }
                }
                self.x.accumulate_grad(grad_x);
            }
        }
    }

    fn inputs(&self) -> Vec<&Tensor> {
        vec![&self.x, &self.gamma, &self.beta]
    }
}
