//! Fused softmax cross-entropy over rows with per-row weights

use super::metrics::softmax_rows;
use crate::autograd::{BackwardOp, Tensor};
use ndarray::Array1;
use std::cell::RefCell;
use std::rc::Rc;

/// `Σ_r w_r · CE(softmax(logits_r), targets_r) / normalizer`
///
/// `logits` and `targets` are `[rows, cols]`; each target row is a
/// distribution. d(loss)/d(logits_r) = w_r · (softmax_r - targets_r) / normalizer.
pub fn softmax_cross_entropy(
    logits: &Tensor,
    targets: &[f32],
    weights: &[f32],
    cols: usize,
    normalizer: f32,
) -> Tensor {
    let rows = weights.len();
    assert_eq!(logits.len(), rows * cols, "Logits size mismatch");
    assert_eq!(targets.len(), rows * cols, "Targets size mismatch");

    let probs = softmax_rows(logits.data().as_slice().expect("logits must be contiguous"), cols);

    let mut total = 0.0f32;
    let mut grad = Array1::<f32>::zeros(logits.len());
    for (r, &w) in weights.iter().enumerate() {
        if w == 0.0 {
            continue;
        }
        let span = r * cols..(r + 1) * cols;
        let ce: f32 = targets[span.clone()]
            .iter()
            .zip(&probs[span.clone()])
            .map(|(&t, &p)| -t * (p + 1e-10).max(f32::MIN_POSITIVE).ln())
            .sum();
        total += w * ce;
        for i in span {
            grad[i] = w * (probs[i] - targets[i]) / normalizer;
        }
    }

    let mut loss = Tensor::from_vec(vec![total / normalizer], logits.requires_grad());
    if logits.requires_grad() {
        loss.set_backward_op(Rc::new(SoftmaxCrossEntropyBackward {
            logits: logits.clone(),
            grad,
            result_grad: loss.grad_cell(),
        }));
    }
    loss
}

struct SoftmaxCrossEntropyBackward {
    logits: Tensor,
    grad: Array1<f32>,
    result_grad: Rc<RefCell<Option<Array1<f32>>>>,
}

impl BackwardOp for SoftmaxCrossEntropyBackward {
    fn backward(&self) {
        if let Some(upstream) = self.result_grad.borrow().as_ref() {
            self.logits.accumulate_grad(&self.grad * upstream[0]);
        }
    }

    fn inputs(&self) -> Vec<&Tensor> {
        vec![&self.logits]
    }
}

/// One-hot rows, optionally smoothed to `onehot · (1 - ls) + ls / cols`
pub fn smoothed_targets(labels: &[usize], cols: usize, label_smoothing: f32) -> Vec<f32> {
    let floor = label_smoothing / cols as f32;
    let mut targets = vec![floor; labels.len() * cols];
    for (r, &label) in labels.iter().enumerate() {
        targets[r * cols + label] += 1.0 - label_smoothing;
    }
    targets
}
