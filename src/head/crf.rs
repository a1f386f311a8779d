//! Linear-chain CRF: exact log-likelihood, marginals and Viterbi decoding
//!
//! Emissions are `[len, num_tags]` row-major, transitions `[num_tags, num_tags]`
//! with `transitions[i * num_tags + j]` scoring tag `i` followed by tag `j`.
//! There are no start or end transitions.

use crate::autograd::{BackwardOp, Tensor};
use ndarray::Array1;
use std::cell::RefCell;
use std::rc::Rc;

/// `log(sum(exp(values)))`, stable for large magnitudes
fn log_sum_exp(values: &[f32]) -> f32 {
    let max = values.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    if max == f32::NEG_INFINITY {
        return f32::NEG_INFINITY;
    }
    max + values.iter().map(|&v| (v - max).exp()).sum::<f32>().ln()
}

/// Forward and backward log-messages of one sequence
struct Lattice {
    alpha: Vec<f32>,
    beta: Vec<f32>,
    log_z: f32,
}

fn lattice(emissions: &[f32], transitions: &[f32], len: usize, c: usize) -> Lattice {
    let mut alpha = vec![0.0; len * c];
    let mut beta = vec![0.0; len * c];
    let mut scratch = vec![0.0; c];

    alpha[..c].copy_from_slice(&emissions[..c]);
    for t in 1..len {
        for j in 0..c {
            for i in 0..c {
                scratch[i] = alpha[(t - 1) * c + i] + transitions[i * c + j];
            }
            alpha[t * c + j] = emissions[t * c + j] + log_sum_exp(&scratch);
        }
    }

    for t in (0..len.saturating_sub(1)).rev() {
        for i in 0..c {
            for j in 0..c {
                scratch[j] = transitions[i * c + j] + emissions[(t + 1) * c + j] + beta[(t + 1) * c + j];
            }
            beta[t * c + i] = log_sum_exp(&scratch);
        }
    }

    let log_z = log_sum_exp(&alpha[(len - 1) * c..len * c]);
    Lattice { alpha, beta, log_z }
}

/// Unnormalized score of a tag path
pub fn sequence_score(emissions: &[f32], transitions: &[f32], tags: &[usize], num_tags: usize) -> f32 {
    let unary: f32 = tags
        .iter()
        .enumerate()
        .map(|(t, &tag)| emissions[t * num_tags + tag])
        .sum();
    let binary: f32 = tags
        .windows(2)
        .map(|pair| transitions[pair[0] * num_tags + pair[1]])
        .sum();
    unary + binary
}

/// Log-probability of `tags` given the first `tags.len()` emission rows
///
/// An empty path has log-likelihood 0.
pub fn log_likelihood(emissions: &[f32], transitions: &[f32], tags: &[usize], num_tags: usize) -> f32 {
    let len = tags.len();
    if len == 0 {
        return 0.0;
    }
    let lattice = lattice(emissions, transitions, len, num_tags);
    sequence_score(emissions, transitions, tags, num_tags) - lattice.log_z
}

/// Highest-scoring tag path over the first `len` emission rows, with its score
pub fn viterbi_decode(emissions: &[f32], transitions: &[f32], len: usize, num_tags: usize) -> (Vec<usize>, f32) {
    if len == 0 || num_tags == 0 {
        return (Vec::new(), 0.0);
    }
    let c = num_tags;
    let mut score: Vec<f32> = emissions[..c].to_vec();
    let mut next = vec![0.0; c];
    let mut backpointers = vec![0usize; (len - 1) * c];

    for t in 1..len {
        for j in 0..c {
            let (best_i, best) = (0..c)
                .map(|i| (i, score[i] + transitions[i * c + j]))
                .fold((0, f32::NEG_INFINITY), |acc, cand| if cand.1 > acc.1 { cand } else { acc });
            next[j] = best + emissions[t * c + j];
            backpointers[(t - 1) * c + j] = best_i;
        }
        std::mem::swap(&mut score, &mut next);
    }

    let (mut last, best) = score
        .iter()
        .copied()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |acc, cand| if cand.1 > acc.1 { cand } else { acc });

    let mut path = vec![0; len];
    path[len - 1] = last;
    for t in (1..len).rev() {
        last = backpointers[(t - 1) * c + last];
        path[t - 1] = last;
    }
    (path, best)
}

/// Tag sequences of one batch for [`crf_loss`]
#[derive(Debug, Clone, Copy)]
pub struct CrfBatch<'a> {
    /// Gold (or sampled) tags, `[batch, seq_len]` flat
    pub tags: &'a [usize],
    /// Real length per sequence
    pub lengths: &'a [usize],
    /// Loss weight per sequence
    pub weights: &'a [f32],
    /// Padded sequence length
    pub seq_len: usize,
    /// Tag count
    pub num_tags: usize,
}

/// Weighted mean negative log-likelihood over the batch
///
/// `loss = Σ_b w_b · nll_b / batch`. Sequences with zero length or zero
/// weight contribute exactly zero and no gradient. Gradients are the
/// closed form: marginals minus gold indicators for emissions, pairwise
/// marginals minus observed transition counts for the transition matrix.
pub fn crf_loss(emissions: &Tensor, transitions: &Tensor, batch: &CrfBatch<'_>) -> Tensor {
    let c = batch.num_tags;
    let t_max = batch.seq_len;
    let b = batch.lengths.len();
    assert_eq!(emissions.len(), b * t_max * c, "Emission size mismatch");
    assert_eq!(transitions.len(), c * c, "Transition size mismatch");
    assert_eq!(batch.tags.len(), b * t_max, "Tag size mismatch");
    assert_eq!(batch.weights.len(), b, "Weight size mismatch");

    let em_all = emissions.data().as_slice().expect("emissions must be contiguous");
    let tr = transitions.data().as_slice().expect("transitions must be contiguous");

    let mut total = 0.0f32;
    let mut grad_em = Array1::<f32>::zeros(emissions.len());
    let mut grad_tr = Array1::<f32>::zeros(c * c);
    let normalizer = b.max(1) as f32;

    for (seq, (&len, &weight)) in batch.lengths.iter().zip(batch.weights).enumerate() {
        let len = len.min(t_max);
        if len == 0 || weight == 0.0 {
            continue;
        }
        let offset = seq * t_max * c;
        let em = &em_all[offset..offset + len * c];
        let tags = &batch.tags[seq * t_max..seq * t_max + len];

        let lattice = lattice(em, tr, len, c);
        let nll = lattice.log_z - sequence_score(em, tr, tags, c);
        total += weight * nll;

        let scale = weight / normalizer;
        for t in 0..len {
            for j in 0..c {
                let marginal = (lattice.alpha[t * c + j] + lattice.beta[t * c + j] - lattice.log_z).exp();
                grad_em[offset + t * c + j] += scale * marginal;
            }
            grad_em[offset + t * c + tags[t]] -= scale;
        }
        for t in 1..len {
            for i in 0..c {
                for j in 0..c {
                    let pairwise = (lattice.alpha[(t - 1) * c + i]
                        + tr[i * c + j]
                        + em[t * c + j]
                        + lattice.beta[t * c + j]
                        - lattice.log_z)
                        .exp();
                    grad_tr[i * c + j] += scale * pairwise;
                }
            }
            grad_tr[tags[t - 1] * c + tags[t]] -= scale;
        }
    }

    let requires_grad = emissions.requires_grad() || transitions.requires_grad();
    let mut loss = Tensor::from_vec(vec![total / normalizer], requires_grad);

    if requires_grad {
        loss.set_backward_op(Rc::new(CrfBackward {
            emissions: emissions.clone(),
            transitions: transitions.clone(),
            grad_emissions: grad_em,
            grad_transitions: grad_tr,
            result_grad: loss.grad_cell(),
        }));
    }

    loss
}

struct CrfBackward {
    emissions: Tensor,
    transitions: Tensor,
    grad_emissions: Array1<f32>,
    grad_transitions: Array1<f32>,
    result_grad: Rc<RefCell<Option<Array1<f32>>>>,
}

impl BackwardOp for CrfBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            let upstream = grad[0];
            if self.emissions.requires_grad() {
                self.emissions.accumulate_grad(&self.grad_emissions * upstream);
            }
            if self.transitions.requires_grad() {
                self.transitions.accumulate_grad(&self.grad_transitions * upstream);
            }
        }
    }

    fn inputs(&self) -> Vec<&Tensor> {
        vec![&self.emissions, &self.transitions]
    }
}
