//! Indexing and masking operations: gather, concat, column mask, dropout

use crate::autograd::{BackwardOp, Tensor};
use ndarray::Array1;
use rand::Rng;
use std::cell::RefCell;
use std::rc::Rc;

/// Gather rows of a `[n, width]` tensor by flat row index
///
/// Output is `[indices.len(), width]`. Out-of-range indices panic.
pub fn gather_rows(x: &Tensor, indices: &[usize], width: usize) -> Tensor {
    assert_eq!(x.len() % width.max(1), 0, "Input is not a whole number of rows");
    let n_rows = x.len() / width.max(1);

    let mut data = Vec::with_capacity(indices.len() * width);
    for &idx in indices {
        assert!(idx < n_rows, "Gather index {idx} out of range for {n_rows} rows");
        data.extend(x.data().slice(ndarray::s![idx * width..(idx + 1) * width]).iter());
    }

    let requires_grad = x.requires_grad();
    let mut result = Tensor::from_vec(data, requires_grad);

    if requires_grad {
        let backward_op = Rc::new(GatherBackward {
            x: x.clone(),
            indices: indices.to_vec(),
            width,
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(backward_op);
    }

    result
}

struct GatherBackward {
    x: Tensor,
    indices: Vec<usize>,
    width: usize,
    result_grad: Rc<RefCell<Option<Array1<f32>>>>,
}

impl BackwardOp for GatherBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            // Scatter-add: repeated indices accumulate
            let mut grad_x = Array1::zeros(self.x.len());
            for (slot, &idx) in self.indices.iter().enumerate() {
                for c in 0..self.width {
                    grad_x[idx * self.width + c] += grad[slot * self.width + c];
                }
            }
            self.x.accumulate_grad(grad_x);
        }
    }

    fn inputs(&self) -> Vec<&Tensor> {
        vec![&self.x]
    }
}

/// Concatenate `[rows, cols_i]` tensors along the trailing dimension
pub fn concat_cols(parts: &[(&Tensor, usize)], rows: usize) -> Tensor {
    let total: usize = parts.iter().map(|(_, cols)| cols).sum();
    for (t, cols) in parts {
        assert_eq!(t.len(), rows * cols, "Concat part size mismatch");
    }

    let mut data = Vec::with_capacity(rows * total);
    for r in 0..rows {
        for (t, cols) in parts {
            data.extend(t.data().slice(ndarray::s![r * cols..(r + 1) * cols]).iter());
        }
    }

    let requires_grad = parts.iter().any(|(t, _)| t.requires_grad());
    let mut result = Tensor::from_vec(data, requires_grad);

    if requires_grad {
        let backward_op = Rc::new(ConcatBackward {
            parts: parts.iter().map(|(t, c)| ((*t).clone(), *c)).collect(),
            rows,
            total,
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(backward_op);
    }

    result
}

struct ConcatBackward {
    parts: Vec<(Tensor, usize)>,
    rows: usize,
    total: usize,
    result_grad: Rc<RefCell<Option<Array1<f32>>>>,
}

impl BackwardOp for ConcatBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            let mut offset = 0;
            for (part, cols) in &self.parts {
                if part.requires_grad() {
                    let mut grad_part = Array1::zeros(self.rows * cols);
                    for r in 0..self.rows {
                        for c in 0..*cols {
                            grad_part[r * cols + c] = grad[r * self.total + offset + c];
                        }
                    }
                    part.accumulate_grad(grad_part);
                }
                offset += cols;
            }
        }
    }

    fn inputs(&self) -> Vec<&Tensor> {
        self.parts.iter().map(|(t, _)| t).collect()
    }
}

/// Multiply every row of `[rows, mask.len()]` element-wise by `mask`
pub fn mask_columns(x: &Tensor, mask: &[f32]) -> Tensor {
    let cols = mask.len();
    assert!(cols > 0 && x.len() % cols == 0, "Mask width does not divide input");

    let mask_full: Array1<f32> = (0..x.len()).map(|i| mask[i % cols]).collect();
    elementwise_mask(x, mask_full)
}

/// Inverted dropout: zero each element with probability `1 - keep_prob`,
/// scale survivors by `1 / keep_prob`. `keep_prob >= 1` is the identity.
pub fn dropout<R: Rng + ?Sized>(x: &Tensor, keep_prob: f32, rng: &mut R) -> Tensor {
    if keep_prob >= 1.0 {
        return x.clone();
    }
    let inv = 1.0 / keep_prob;
    let mask: Array1<f32> = (0..x.len())
        .map(|_| if rng.random::<f32>() < keep_prob { inv } else { 0.0 })
        .collect();
    elementwise_mask(x, mask)
}

fn elementwise_mask(x: &Tensor, mask: Array1<f32>) -> Tensor {
    let data = x.data() * &mask;
    let requires_grad = x.requires_grad();
    let mut result = Tensor::new(data, requires_grad);

    if requires_grad {
        let backward_op = Rc::new(MaskBackward {
            x: x.clone(),
            mask,
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(backward_op);
    }

    result
}

struct MaskBackward {
    x: Tensor,
    mask: Array1<f32>,
    result_grad: Rc<RefCell<Option<Array1<f32>>>>,
}

impl BackwardOp for MaskBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            self.x.accumulate_grad(grad * &self.mask);
        }
    }

    fn inputs(&self) -> Vec<&Tensor> {
        vec![&self.x]
    }
}
