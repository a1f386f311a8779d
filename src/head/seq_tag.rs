//! Sequence tagging head: token projection + linear-chain CRF

use super::crf::{self, CrfBatch};
use super::dense::{Dense, Param};
use super::metrics::{argmax_rows, best_threshold_f1, sequence_accuracy, softmax_rows, weighted_accuracy};
use super::smoothing::LabelSampler;
use super::store::ParamInit;
use super::{class_index, class_mask_for, EvalBundle, Head, HeadOutput, HeadState, Mode, Prediction};
use crate::autograd::{dropout, mask_columns};
use crate::config::HeadParams;
use crate::error::{MultitaskError, Result};
use crate::features::{label_ids_key, BatchView, Hidden, RepresentationKind, Representations};
use crate::optim::NamedParam;
use crate::problem::Problem;
use crate::Tensor;
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use std::collections::BTreeMap;

/// Segmentation / NER / POS head
///
/// Projects every token to tag scores and scores tag paths with a learned
/// transition matrix. TRAIN smooths labels by sampling (see
/// [`LabelSampler`]).
pub struct SequenceTagHead {
    output: Dense,
    transitions: Param,
    keep_prob: f32,
    sampler: LabelSampler,
    rng: StdRng,
    state: HeadState,
}

impl SequenceTagHead {
    pub(crate) fn new(init: &ParamInit, params: &HeadParams, in_dim: usize, num_tags: usize) -> Result<Self> {
        Ok(Self {
            output: init.dense_xavier("output", in_dim, num_tags),
            transitions: init.xavier("crf_transition", num_tags, num_tags),
            keep_prob: params.dropout_keep_prob,
            sampler: LabelSampler::new(num_tags, params.label_smoothing)?,
            rng: init.rng(),
            state: HeadState::default(),
        })
    }

    /// Number of tags the head scores
    pub fn num_tags(&self) -> usize {
        self.output.out_dim
    }

    /// Transition scores, `[num_tags, num_tags]`
    pub fn transitions(&self) -> &Tensor {
        &self.transitions.tensor
    }

    fn logits(&mut self, seq: &Hidden, mode: Mode) -> Result<Tensor> {
        if seq.shape().len() != 3 || seq.width() != self.output.in_dim {
            return Err(MultitaskError::shape(
                RepresentationKind::Sequence.to_string(),
                vec![seq.batch_size(), seq.seq_len(), self.output.in_dim],
                seq.shape().to_vec(),
            ));
        }
        let x = match mode {
            Mode::Train => dropout(seq.tensor(), self.keep_prob, &mut self.rng),
            Mode::Eval | Mode::Predict => seq.tensor().clone(),
        };
        Ok(self.output.forward(&x, seq.rows()))
    }

    /// Gold tags `[batch, seq_len]` flat; padding positions read as 0
    fn gold_tags(&self, problem: &Problem, batch: &BatchView, lengths: &[usize], seq_len: usize) -> Result<Vec<usize>> {
        let key = label_ids_key(&problem.name);
        let ids = batch.label_ids(&problem.name, lengths.len())?;
        if ids.shape() != [lengths.len(), seq_len] {
            return Err(MultitaskError::shape(key, vec![lengths.len(), seq_len], ids.shape().to_vec()));
        }
        let mut tags = vec![0; lengths.len() * seq_len];
        for (i, &id) in ids.iter().enumerate() {
            if i % seq_len < lengths[i / seq_len] {
                tags[i] = class_index(&key, id, self.num_tags())?;
            }
        }
        Ok(tags)
    }

    fn eval_metrics(&self, scores: &[f32], tags: &[usize], mask: &[f32], seq_len: usize) -> BTreeMap<String, f32> {
        let c = self.num_tags();
        let predictions = argmax_rows(scores, c);
        let probs = softmax_rows(scores, c);
        BTreeMap::from([
            ("accuracy".to_string(), weighted_accuracy(&predictions, tags, Some(mask))),
            (
                "accuracy_per_sequence".to_string(),
                sequence_accuracy(&predictions, tags, mask, seq_len),
            ),
            ("f1_score".to_string(), best_threshold_f1(&probs, tags, c, Some(mask))),
        ])
    }
}

impl Head for SequenceTagHead {
    fn name(&self) -> &'static str {
        "sequence_tag"
    }

    fn compute(
        &mut self,
        problem: &Problem,
        batch: &BatchView,
        reps: &Representations,
        mode: Mode,
    ) -> Result<HeadOutput> {
        let seq = reps.get(RepresentationKind::Sequence)?;
        let (b, t, c) = (seq.batch_size(), seq.seq_len(), self.num_tags());
        let logits = self.logits(seq, mode)?;
        self.state.last_logits = Some(Hidden::new(logits.clone(), vec![b, t, c])?);

        let scores = match class_mask_for(problem, c)? {
            Some(mask) => mask_columns(&logits, mask),
            None => logits,
        };
        let lengths = batch.sequence_lengths(b, t)?;

        match mode {
            Mode::Train => {
                let tags = self.gold_tags(problem, batch, &lengths, t)?;
                let weights = batch.loss_multiplier(&problem.name, b)?;
                if lengths.contains(&0) {
                    tracing::warn!(task = %problem.name, "zero-length sequences in batch");
                }
                let tags = self.sampler.sample_sequences(&tags, &lengths, t, &mut self.rng);
                let crf_batch = CrfBatch {
                    tags: &tags,
                    lengths: &lengths,
                    weights: weights.as_slice().unwrap_or(&[]),
                    seq_len: t,
                    num_tags: c,
                };
                let loss = crf::crf_loss(&scores, &self.transitions.tensor, &crf_batch);
                tracing::debug!(task = %problem.name, loss = loss.item(), "sequence tag loss");
                self.state.loss = Some(loss.item());
                Ok(HeadOutput::Loss(loss))
            }
            Mode::Eval => {
                let tags = self.gold_tags(problem, batch, &lengths, t)?;
                let weights = batch.loss_multiplier(&problem.name, b)?;
                let crf_batch = CrfBatch {
                    tags: &tags,
                    lengths: &lengths,
                    weights: weights.as_slice().unwrap_or(&[]),
                    seq_len: t,
                    num_tags: c,
                };
                let loss = crf::crf_loss(&scores.detach(), &self.transitions.tensor.detach(), &crf_batch).item();
                let mask = batch.input_mask(b, t)?;
                let mask: Vec<f32> = mask.iter().copied().collect();
                let bundle = EvalBundle {
                    metrics: self.eval_metrics(scores.data().as_slice().unwrap_or(&[]), &tags, &mask, t),
                    loss,
                };
                self.state.loss = Some(loss);
                self.state.eval = Some(bundle.clone());
                Ok(HeadOutput::Eval(bundle))
            }
            Mode::Predict => {
                let em = scores.data().as_slice().unwrap_or(&[]);
                let tr = self.transitions.tensor.data().as_slice().unwrap_or(&[]);
                let mut labels = Array2::<usize>::zeros((b, t));
                let mut path_scores = Array1::<f32>::zeros(b);
                for (row, &len) in lengths.iter().enumerate() {
                    let (path, score) = crf::viterbi_decode(&em[row * t * c..(row + 1) * t * c], tr, len, c);
                    for (pos, tag) in path.into_iter().enumerate() {
                        labels[[row, pos]] = tag;
                    }
                    path_scores[row] = score;
                }
                let prediction = Prediction::Tags {
                    labels,
                    scores: path_scores,
                };
                self.state.prediction = Some(prediction.clone());
                Ok(HeadOutput::Prediction(prediction))
            }
        }
    }

    fn project(
        &mut self,
        _problem: &Problem,
        reps: &Representations,
        mode: Mode,
    ) -> Result<Option<(RepresentationKind, Hidden)>> {
        let seq = reps.get(RepresentationKind::Sequence)?;
        let shape = vec![seq.batch_size(), seq.seq_len(), self.num_tags()];
        let logits = self.logits(seq, mode)?;
        let hidden = Hidden::new(logits, shape)?;
        self.state.last_logits = Some(hidden.clone());
        Ok(Some((RepresentationKind::Sequence, hidden)))
    }

    fn state(&self) -> &HeadState {
        &self.state
    }

    fn parameters(&self) -> Vec<(String, &Tensor)> {
        let mut params = self.output.parameters();
        params.push(self.transitions.named());
        params
    }

    fn parameters_mut(&mut self) -> Vec<NamedParam<'_>> {
        let mut params = self.output.parameters_mut();
        params.push(self.transitions.named_mut());
        params
    }
}
