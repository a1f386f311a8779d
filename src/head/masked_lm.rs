//! Masked-token prediction head tied to the encoder's embedding table

use super::dense::{Dense, Param};
use super::losses::{smoothed_targets, softmax_cross_entropy};
use super::metrics::{argmax_rows, log_softmax_rows, weighted_accuracy};
use super::store::ParamInit;
use super::{class_index, EvalBundle, Head, HeadOutput, HeadState, Mode, Prediction};
use crate::autograd::{add_row_bias, gather_rows, gelu, layer_norm_rows, matmul_bt, relu};
use crate::config::{Activation, HeadParams};
use crate::error::{MultitaskError, Result};
use crate::features::{
    check_leading, BatchView, Hidden, RepresentationKind, Representations, MASKED_LM_IDS, MASKED_LM_POSITIONS,
    MASKED_LM_WEIGHTS,
};
use crate::optim::NamedParam;
use crate::problem::Problem;
use crate::Tensor;
use ndarray::Array2;
use std::collections::BTreeMap;

/// Floor added to the weight sum so an all-padding batch yields a zero loss
pub const WEIGHT_EPSILON: f32 = 1e-5;

const LAYER_NORM_EPSILON: f32 = 1e-12;

/// Masked-LM head
///
/// `logits = layer_norm(act(gather(seq) @ W + b)) @ embed_tableᵀ + output_bias`.
/// The embedding table is read from the representations every step and is
/// never owned here.
pub struct MaskedLmHead {
    transform: Dense,
    gamma: Param,
    beta: Param,
    output_bias: Param,
    activation: Activation,
    state: HeadState,
}

/// Masked-LM fields of one batch
struct MaskedSlots {
    ids: Vec<usize>,
    weights: Vec<f32>,
}

impl MaskedLmHead {
    pub(crate) fn new(init: &ParamInit, params: &HeadParams, reps: &Representations) -> Result<Self> {
        let seq = reps.get(RepresentationKind::Sequence)?;
        let embed = reps.get(RepresentationKind::EmbedTable)?;
        let (vocab, hidden) = (params.vocab_size, params.mask_lm_hidden_size);
        if embed.shape() != [vocab, hidden] {
            return Err(MultitaskError::shape(
                RepresentationKind::EmbedTable.to_string(),
                vec![vocab, hidden],
                embed.shape().to_vec(),
            ));
        }

        let scope = init.child("cls/predictions");
        let range = params.mask_lm_initializer_range;
        Ok(Self {
            transform: scope.dense_uniform("transform/dense", seq.width(), hidden, range),
            gamma: scope.ones("transform/LayerNorm/gamma", hidden),
            beta: scope.zeros("transform/LayerNorm/beta", hidden),
            output_bias: scope.zeros("output_bias", vocab),
            activation: params.mask_lm_hidden_act,
            state: HeadState::default(),
        })
    }

    /// Vocabulary size of the tied projection
    pub fn vocab_size(&self) -> usize {
        self.output_bias.tensor.len()
    }

    /// Flat `batch * seq_len + position` index of every masked slot
    fn slot_indices(batch: &BatchView, b: usize, t: usize) -> Result<(Vec<usize>, Vec<usize>)> {
        let positions = batch.int(MASKED_LM_POSITIONS)?;
        check_leading(MASKED_LM_POSITIONS, positions.shape(), b)?;
        let per_row = positions.len() / b.max(1);
        let flat = positions
            .iter()
            .enumerate()
            .map(|(i, &pos)| {
                let row = i / per_row.max(1);
                usize::try_from(pos)
                    .ok()
                    .filter(|&p| p < t)
                    .map(|p| row * t + p)
                    .ok_or_else(|| MultitaskError::invalid(MASKED_LM_POSITIONS, format!("position {pos} outside 0..{t}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok((flat, positions.shape().to_vec()))
    }

    fn slots(batch: &BatchView, shape: &[usize], vocab: usize) -> Result<MaskedSlots> {
        let ids = batch.int(MASKED_LM_IDS)?;
        if ids.shape() != shape {
            return Err(MultitaskError::shape(MASKED_LM_IDS, shape.to_vec(), ids.shape().to_vec()));
        }
        let weights = batch.float(MASKED_LM_WEIGHTS)?;
        if weights.shape() != shape {
            return Err(MultitaskError::shape(MASKED_LM_WEIGHTS, shape.to_vec(), weights.shape().to_vec()));
        }
        let weights: Vec<f32> = weights.iter().copied().collect();
        // Padding slots may carry any id
        let ids = ids
            .iter()
            .zip(&weights)
            .map(|(&id, &w)| if w == 0.0 { Ok(0) } else { class_index(MASKED_LM_IDS, id, vocab) })
            .collect::<Result<Vec<_>>>()?;
        Ok(MaskedSlots { ids, weights })
    }

    fn logits(&self, seq: &Hidden, embed: &Hidden, slots: &[usize]) -> Result<Tensor> {
        let (h, m, v) = (self.transform.in_dim, self.transform.out_dim, self.vocab_size());
        if seq.shape().len() != 3 || seq.width() != h {
            return Err(MultitaskError::shape(
                RepresentationKind::Sequence.to_string(),
                vec![seq.batch_size(), seq.seq_len(), h],
                seq.shape().to_vec(),
            ));
        }
        if embed.shape() != [v, m] {
            return Err(MultitaskError::shape(
                RepresentationKind::EmbedTable.to_string(),
                vec![v, m],
                embed.shape().to_vec(),
            ));
        }
        let n = slots.len();
        let gathered = gather_rows(seq.tensor(), slots, h);
        let projected = self.transform.forward(&gathered, n);
        let activated = match self.activation {
            Activation::Gelu => gelu(&projected),
            Activation::Relu => relu(&projected),
        };
        let normed = layer_norm_rows(
            &activated,
            &self.gamma.tensor,
            &self.beta.tensor,
            n,
            m,
            LAYER_NORM_EPSILON,
        );
        let tied = matmul_bt(&normed, embed.tensor(), n, m, v);
        Ok(add_row_bias(&tied, &self.output_bias.tensor, n, v))
    }
}

impl Head for MaskedLmHead {
    fn name(&self) -> &'static str {
        "masked_lm"
    }

    fn compute(
        &mut self,
        problem: &Problem,
        batch: &BatchView,
        reps: &Representations,
        mode: Mode,
    ) -> Result<HeadOutput> {
        let seq = reps.get(RepresentationKind::Sequence)?;
        let embed = reps.get(RepresentationKind::EmbedTable)?;
        let (slots, shape) = Self::slot_indices(batch, seq.batch_size(), seq.seq_len())?;
        let v = self.vocab_size();
        let logits = self.logits(seq, embed, &slots)?;
        let n = slots.len();
        self.state.last_logits = Some(Hidden::new(logits.clone(), vec![n, v])?);

        match mode {
            Mode::Train => {
                let MaskedSlots { ids, weights } = Self::slots(batch, &shape, v)?;
                let weight_sum: f32 = weights.iter().sum();
                if weight_sum == 0.0 {
                    tracing::warn!(task = %problem.name, "no real masked slots in batch");
                }
                let targets = smoothed_targets(&ids, v, 0.0);
                let loss = softmax_cross_entropy(&logits, &targets, &weights, v, weight_sum + WEIGHT_EPSILON);
                tracing::debug!(task = %problem.name, loss = loss.item(), "masked lm loss");
                self.state.loss = Some(loss.item());
                Ok(HeadOutput::Loss(loss))
            }
            Mode::Eval => {
                let MaskedSlots { ids, weights } = Self::slots(batch, &shape, v)?;
                let raw = logits.data().as_slice().unwrap_or(&[]);
                let log_probs = log_softmax_rows(raw, v);
                let weighted_nll: f32 = ids
                    .iter()
                    .zip(&weights)
                    .enumerate()
                    .map(|(slot, (&id, &w))| -w * log_probs[slot * v + id])
                    .sum();
                let weight_sum: f32 = weights.iter().sum();
                let mean_loss = if weight_sum > 0.0 { weighted_nll / weight_sum } else { 0.0 };
                let metrics = BTreeMap::from([
                    (
                        "masked_lm_accuracy".to_string(),
                        weighted_accuracy(&argmax_rows(raw, v), &ids, Some(&weights)),
                    ),
                    ("masked_lm_loss".to_string(), mean_loss),
                ]);
                let loss = weighted_nll / (weight_sum + WEIGHT_EPSILON);
                let bundle = EvalBundle { metrics, loss };
                self.state.loss = Some(loss);
                self.state.eval = Some(bundle.clone());
                Ok(HeadOutput::Eval(bundle))
            }
            Mode::Predict => {
                let log_probs = log_softmax_rows(logits.data().as_slice().unwrap_or(&[]), v);
                let log_probs = Array2::from_shape_vec((n, v), log_probs)
                    .map_err(|_| MultitaskError::shape("log_probabilities", vec![n, v], vec![logits.len()]))?;
                let prediction = Prediction::LogProbabilities(log_probs);
                self.state.prediction = Some(prediction.clone());
                Ok(HeadOutput::Prediction(prediction))
            }
        }
    }

    fn project(
        &mut self,
        _problem: &Problem,
        _reps: &Representations,
        _mode: Mode,
    ) -> Result<Option<(RepresentationKind, Hidden)>> {
        Ok(None)
    }

    fn state(&self) -> &HeadState {
        &self.state
    }

    fn parameters(&self) -> Vec<(String, &Tensor)> {
        let mut params = self.transform.parameters();
        params.extend([self.gamma.named(), self.beta.named(), self.output_bias.named()]);
        params
    }

    fn parameters_mut(&mut self) -> Vec<NamedParam<'_>> {
        let mut params = self.transform.parameters_mut();
        params.extend([
            self.gamma.named_mut(),
            self.beta.named_mut(),
            self.output_bias.named_mut(),
        ]);
        params
    }
}
