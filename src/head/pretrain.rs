//! Pretraining head: masked LM plus next-sentence classification

use super::classification::ClassificationHead;
use super::masked_lm::MaskedLmHead;
use super::store::ParamInit;
use super::{Head, HeadOutput, HeadState, Mode};
use crate::autograd::add;
use crate::config::HeadParams;
use crate::error::Result;
use crate::features::{BatchView, Hidden, RepresentationKind, Representations};
use crate::optim::NamedParam;
use crate::problem::{Problem, ProblemKind};
use crate::Tensor;

/// Batch fields of the segment-level objective are read under this name
pub const NEXT_SENTENCE: &str = "next_sentence";

/// Composite of a [`MaskedLmHead`] and a binary [`ClassificationHead`]
///
/// TRAIN sums both losses, EVAL merges both metric maps (next-sentence
/// metrics prefixed `next_sentence_`) and sums the losses, PREDICT returns
/// the masked-LM prediction only.
pub struct PretrainHead {
    masked_lm: MaskedLmHead,
    next_sentence: ClassificationHead,
    next_sentence_problem: Problem,
    state: HeadState,
}

impl PretrainHead {
    pub(crate) fn new(init: &ParamInit, params: &HeadParams, reps: &Representations) -> Result<Self> {
        let pooled = reps.get(RepresentationKind::Pooled)?;
        Ok(Self {
            masked_lm: MaskedLmHead::new(init, params, reps)?,
            next_sentence: ClassificationHead::new(&init.child(NEXT_SENTENCE), params, pooled.width(), 2),
            next_sentence_problem: Problem::new(NEXT_SENTENCE, ProblemKind::Classification, 2),
            state: HeadState::default(),
        })
    }
}

impl Head for PretrainHead {
    fn name(&self) -> &'static str {
        "pretrain"
    }

    fn compute(
        &mut self,
        problem: &Problem,
        batch: &BatchView,
        reps: &Representations,
        mode: Mode,
    ) -> Result<HeadOutput> {
        let masked = self.masked_lm.compute(problem, batch, reps, mode)?;
        self.state.last_logits = self.masked_lm.state().last_logits.clone();

        let output = match (mode, masked) {
            (Mode::Predict, masked) => masked,
            (_, HeadOutput::Loss(mlm_loss)) => {
                let ns_loss = self
                    .next_sentence
                    .compute(&self.next_sentence_problem, batch, reps, mode)?
                    .into_loss()?;
                HeadOutput::Loss(add(&mlm_loss, &ns_loss))
            }
            (_, HeadOutput::Eval(mut bundle)) => {
                let ns = self
                    .next_sentence
                    .compute(&self.next_sentence_problem, batch, reps, mode)?
                    .into_eval()?;
                bundle.merge_prefixed("next_sentence_", ns);
                self.state.eval = Some(bundle.clone());
                HeadOutput::Eval(bundle)
            }
            (_, other) => other,
        };

        match &output {
            HeadOutput::Loss(loss) => self.state.loss = Some(loss.item()),
            HeadOutput::Eval(bundle) => self.state.loss = Some(bundle.loss),
            HeadOutput::Prediction(p) => self.state.prediction = Some(p.clone()),
        }
        Ok(output)
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
        let mut params = self.masked_lm.parameters();
        params.extend(self.next_sentence.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<NamedParam<'_>> {
        let mut params = self.masked_lm.parameters_mut();
        params.extend(self.next_sentence.parameters_mut());
        params
    }
}
