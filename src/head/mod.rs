//! Task heads: output projections, losses, metrics and decoding
//!
//! One [`Head`] implementation per [`ProblemKind`], plus the masked-LM head
//! used on its own for augmentation. Heads are owned by a [`HeadStore`] and
//! keyed by effective identity, so tasks sharing an identity share one
//! instance and its parameters.

mod classification;
pub mod crf;
mod dense;
mod losses;
mod masked_lm;
pub mod metrics;
mod pretrain;
mod seq_tag;
pub mod smoothing;
mod store;
mod transfer;

pub use classification::ClassificationHead;
pub use masked_lm::MaskedLmHead;
pub use pretrain::PretrainHead;
pub use seq_tag::SequenceTagHead;
pub use store::HeadStore;
pub use transfer::FeatureTransferHead;

use crate::error::{MultitaskError, Result};
use crate::features::{BatchView, Hidden, RepresentationKind, Representations};
use crate::optim::NamedParam;
use crate::problem::Problem;
use crate::Tensor;
use ndarray::{Array1, Array2};
use std::collections::BTreeMap;

/// Computation requested from a head
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Differentiable loss
    Train,
    /// Metrics and a scalar loss
    Eval,
    /// Decoded output
    Predict,
}

/// Metric mapping plus the loss value of an EVAL compute
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvalBundle {
    /// Metric name to value
    pub metrics: BTreeMap<String, f32>,
    /// Loss on the evaluated batch
    pub loss: f32,
}

impl EvalBundle {
    /// Merge `other` into `self`, prefixing its metric names
    pub fn merge_prefixed(&mut self, prefix: &str, other: EvalBundle) {
        for (name, value) in other.metrics {
            self.metrics.insert(format!("{prefix}{name}"), value);
        }
        self.loss += other.loss;
    }
}

/// Decoded output of a PREDICT compute
#[derive(Debug, Clone, PartialEq)]
pub enum Prediction {
    /// Best label path per sequence (`[batch, seq_len]`, zero beyond the
    /// real length) and its unnormalized score (`[batch]`)
    Tags {
        labels: Array2<usize>,
        scores: Array1<f32>,
    },
    /// Class distribution per example, `[batch, classes]`
    Probabilities(Array2<f32>),
    /// Vocabulary log-probabilities per masked slot, `[slots, vocab]`
    LogProbabilities(Array2<f32>),
}

/// Result of [`Head::compute`]
#[derive(Debug, Clone)]
pub enum HeadOutput {
    /// TRAIN
    Loss(Tensor),
    /// EVAL
    Eval(EvalBundle),
    /// PREDICT
    Prediction(Prediction),
}

impl HeadOutput {
    /// Loss tensor of a TRAIN output
    pub fn into_loss(self) -> Result<Tensor> {
        match self {
            Self::Loss(loss) => Ok(loss),
            _ => Err(MultitaskError::invalid("mode", "expected a TRAIN output")),
        }
    }

    /// Metrics of an EVAL output
    pub fn into_eval(self) -> Result<EvalBundle> {
        match self {
            Self::Eval(bundle) => Ok(bundle),
            _ => Err(MultitaskError::invalid("mode", "expected an EVAL output")),
        }
    }

    /// Decoded output of a PREDICT output
    pub fn into_prediction(self) -> Result<Prediction> {
        match self {
            Self::Prediction(prediction) => Ok(prediction),
            _ => Err(MultitaskError::invalid("mode", "expected a PREDICT output")),
        }
    }
}

/// Per-instance scratch of the last compute
#[derive(Debug, Clone, Default)]
pub struct HeadState {
    /// Raw (unmasked) projection
    pub last_logits: Option<Hidden>,
    /// Last loss value, TRAIN or EVAL
    pub loss: Option<f32>,
    /// Last EVAL bundle
    pub eval: Option<EvalBundle>,
    /// Last PREDICT output
    pub prediction: Option<Prediction>,
}

/// Output layer and objective for one effective identity
///
/// `problem` is the task being computed, which may differ from the identity
/// whose parameters the head holds; its label fields and class mask are read
/// from the batch by the task's own name.
pub trait Head {
    /// Variant name, for logging
    fn name(&self) -> &'static str;

    /// Loss, metrics or decoded output for `problem` on this batch
    fn compute(
        &mut self,
        problem: &Problem,
        batch: &BatchView,
        reps: &Representations,
        mode: Mode,
    ) -> Result<HeadOutput>;

    /// Raw projection for feature transfer
    ///
    /// Returns `None` for heads whose output is not a per-token or
    /// per-sentence class score.
    fn project(
        &mut self,
        problem: &Problem,
        reps: &Representations,
        mode: Mode,
    ) -> Result<Option<(RepresentationKind, Hidden)>>;

    /// Scratch of the last compute
    fn state(&self) -> &HeadState;

    /// Parameters by stable name
    fn parameters(&self) -> Vec<(String, &Tensor)>;

    /// Mutable parameters by stable name, for optimizers and restore
    fn parameters_mut(&mut self) -> Vec<NamedParam<'_>>;
}

/// Column mask `problem` applies to a head of `width` classes
///
/// A task without a mask must match the head width exactly.
pub(crate) fn class_mask_for(problem: &Problem, width: usize) -> Result<Option<&[f32]>> {
    match &problem.class_mask {
        Some(mask) if mask.len() == width => Ok(Some(mask.as_slice())),
        Some(mask) => Err(MultitaskError::shape(
            format!("{}.class_mask", problem.name),
            vec![width],
            vec![mask.len()],
        )),
        None if problem.num_classes == width => Ok(None),
        None => Err(MultitaskError::shape(
            format!("{}.num_classes", problem.name),
            vec![width],
            vec![problem.num_classes],
        )),
    }
}

/// Label id as a class index, rejecting ids outside `0..width`
pub(crate) fn class_index(field: &str, id: i64, width: usize) -> Result<usize> {
    usize::try_from(id)
        .ok()
        .filter(|&c| c < width)
        .ok_or_else(|| MultitaskError::invalid(field, format!("label id {id} outside 0..{width}")))
}

/// [`class_index`] over a whole field
pub(crate) fn class_indices<'a>(
    field: &str,
    labels: impl IntoIterator<Item = &'a i64>,
    width: usize,
) -> Result<Vec<usize>> {
    labels
        .into_iter()
        .map(|&id| class_index(field, id, width))
        .collect()
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::config::HeadParams;
    use crate::features::{Hidden, RepresentationKind, Representations};
    use crate::Tensor;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// Head params without dropout or smoothing
    pub fn plain_params() -> HeadParams {
        HeadParams {
            dropout_keep_prob: 1.0,
            label_smoothing: 0.0,
            mask_lm_hidden_size: 4,
            vocab_size: 7,
            ..HeadParams::default()
        }
    }

    /// Random representation of `shape` that records gradients
    pub fn random_hidden(shape: &[usize], seed: u64) -> Hidden {
        let mut rng = StdRng::seed_from_u64(seed);
        let len = shape.iter().product();
        let data = (0..len).map(|_| rng.random_range(-1.0..1.0)).collect();
        Hidden::new(Tensor::from_vec(data, true), shape.to_vec()).expect("valid shape")
    }

    /// Sequence `[b, t, h]`, pooled `[b, h]` and embed table `[7, 4]`
    pub fn reps(b: usize, t: usize, h: usize) -> Representations {
        Representations::new()
            .with(RepresentationKind::Sequence, random_hidden(&[b, t, h], 1))
            .with(RepresentationKind::Pooled, random_hidden(&[b, h], 2))
            .with(RepresentationKind::EmbedTable, random_hidden(&[7, 4], 3))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::problem::ProblemKind;

    #[test]
    fn test_class_mask_must_match_width() {
        let plain = Problem::new("CWS", ProblemKind::SequenceTag, 5);
        assert!(class_mask_for(&plain, 5).expect("match").is_none());
        assert!(class_mask_for(&plain, 6).is_err());

        let masked = Problem::new("POS", ProblemKind::SequenceTag, 3).with_class_mask(vec![1.0, 1.0, 1.0, 0.0]);
        assert_eq!(class_mask_for(&masked, 4).expect("match").map(<[f32]>::len), Some(4));
        assert!(class_mask_for(&masked, 3).is_err());
    }

    #[test]
    fn test_class_indices_rejects_out_of_range() {
        assert_eq!(class_indices("x", &[0, 2, 1], 3).expect("valid"), vec![0, 2, 1]);
        assert!(class_indices("x", &[3], 3).is_err());
        assert!(class_indices("x", &[-1], 3).is_err());
    }

    #[test]
    fn test_eval_bundle_merge_prefixes_and_sums() {
        let mut a = EvalBundle {
            metrics: BTreeMap::from([("masked_lm_accuracy".to_string(), 0.5)]),
            loss: 1.0,
        };
        let b = EvalBundle {
            metrics: BTreeMap::from([("accuracy".to_string(), 0.75)]),
            loss: 2.0,
        };
        a.merge_prefixed("next_sentence_", b);
        assert_eq!(a.metrics["next_sentence_accuracy"], 0.75);
        assert_eq!(a.loss, 3.0);
    }

    #[test]
    fn test_output_mode_mismatch_is_error() {
        let out = HeadOutput::Eval(EvalBundle::default());
        assert!(out.clone().into_loss().is_err());
        assert!(out.into_eval().is_ok());
    }
}
