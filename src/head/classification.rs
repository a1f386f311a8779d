//! Sentence classification head over the pooled representation

use super::dense::Dense;
use super::losses::{smoothed_targets, softmax_cross_entropy};
use super::metrics::{argmax_rows, best_threshold_f1, softmax_rows, weighted_accuracy};
use super::store::ParamInit;
use super::{class_indices, class_mask_for, EvalBundle, Head, HeadOutput, HeadState, Mode, Prediction};
use crate::autograd::{dropout, mask_columns};
use crate::config::HeadParams;
use crate::error::{MultitaskError, Result};
use crate::features::{label_ids_key, BatchView, Hidden, RepresentationKind, Representations};
use crate::optim::NamedParam;
use crate::problem::Problem;
use crate::Tensor;
use ndarray::Array2;
use rand::rngs::StdRng;
use std::collections::BTreeMap;

/// Softmax classifier with optional label smoothing
pub struct ClassificationHead {
    output: Dense,
    keep_prob: f32,
    label_smoothing: f32,
    rng: StdRng,
    state: HeadState,
}

impl ClassificationHead {
    pub(crate) fn new(init: &ParamInit, params: &HeadParams, in_dim: usize, num_classes: usize) -> Self {
        Self {
            output: init.dense_xavier("output", in_dim, num_classes),
            keep_prob: params.dropout_keep_prob,
            label_smoothing: params.label_smoothing,
            rng: init.rng(),
            state: HeadState::default(),
        }
    }

    /// Number of output classes
    pub fn num_classes(&self) -> usize {
        self.output.out_dim
    }

    fn logits(&mut self, pooled: &Hidden, mode: Mode) -> Result<Tensor> {
        if pooled.shape().len() != 2 || pooled.width() != self.output.in_dim {
            return Err(MultitaskError::shape(
                RepresentationKind::Pooled.to_string(),
                vec![pooled.batch_size(), self.output.in_dim],
                pooled.shape().to_vec(),
            ));
        }
        let x = match mode {
            Mode::Train => dropout(pooled.tensor(), self.keep_prob, &mut self.rng),
            Mode::Eval | Mode::Predict => pooled.tensor().clone(),
        };
        Ok(self.output.forward(&x, pooled.batch_size()))
    }

    fn labels(&self, problem: &Problem, batch: &BatchView, b: usize) -> Result<Vec<usize>> {
        let key = label_ids_key(&problem.name);
        let ids = batch.label_ids(&problem.name, b)?;
        if ids.len() != b {
            return Err(MultitaskError::shape(key, vec![b], ids.shape().to_vec()));
        }
        class_indices(&key, ids.iter(), self.num_classes())
    }
}

impl Head for ClassificationHead {
    fn name(&self) -> &'static str {
        "classification"
    }

    fn compute(
        &mut self,
        problem: &Problem,
        batch: &BatchView,
        reps: &Representations,
        mode: Mode,
    ) -> Result<HeadOutput> {
        let pooled = reps.get(RepresentationKind::Pooled)?;
        let (b, c) = (pooled.batch_size(), self.num_classes());
        let logits = self.logits(pooled, mode)?;
        self.state.last_logits = Some(Hidden::new(logits.clone(), vec![b, c])?);

        let scores = match class_mask_for(problem, c)? {
            Some(mask) => mask_columns(&logits, mask),
            None => logits,
        };

        match mode {
            Mode::Train => {
                let labels = self.labels(problem, batch, b)?;
                let weights = batch.loss_multiplier(&problem.name, b)?;
                let targets = smoothed_targets(&labels, c, self.label_smoothing);
                let loss = softmax_cross_entropy(&scores, &targets, weights.as_slice().unwrap_or(&[]), c, b.max(1) as f32);
                tracing::debug!(task = %problem.name, loss = loss.item(), "classification loss");
                self.state.loss = Some(loss.item());
                Ok(HeadOutput::Loss(loss))
            }
            Mode::Eval => {
                let labels = self.labels(problem, batch, b)?;
                let weights = batch.loss_multiplier(&problem.name, b)?;
                let targets = smoothed_targets(&labels, c, 0.0);
                let loss = softmax_cross_entropy(&scores.detach(), &targets, weights.as_slice().unwrap_or(&[]), c, b.max(1) as f32).item();
                let raw = scores.data().as_slice().unwrap_or(&[]);
                let probs = softmax_rows(raw, c);
                let metrics = BTreeMap::from([
                    ("accuracy".to_string(), weighted_accuracy(&argmax_rows(raw, c), &labels, None)),
                    ("f1_score".to_string(), best_threshold_f1(&probs, &labels, c, None)),
                ]);
                let bundle = EvalBundle { metrics, loss };
                self.state.loss = Some(loss);
                self.state.eval = Some(bundle.clone());
                Ok(HeadOutput::Eval(bundle))
            }
            Mode::Predict => {
                let probs = softmax_rows(scores.data().as_slice().unwrap_or(&[]), c);
                let probs = Array2::from_shape_vec((b, c), probs)
                    .map_err(|_| MultitaskError::shape("probabilities", vec![b, c], vec![scores.len()]))?;
                let prediction = Prediction::Probabilities(probs);
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
        let pooled = reps.get(RepresentationKind::Pooled)?;
        let shape = vec![pooled.batch_size(), self.num_classes()];
        let hidden = Hidden::new(self.logits(pooled, mode)?, shape)?;
        self.state.last_logits = Some(hidden.clone());
        Ok(Some((RepresentationKind::Pooled, hidden)))
    }

    fn state(&self) -> &HeadState {
        &self.state
    }

    fn parameters(&self) -> Vec<(String, &Tensor)> {
        self.output.parameters()
    }

    fn parameters_mut(&mut self) -> Vec<NamedParam<'_>> {
        self.output.parameters_mut()
    }
}
