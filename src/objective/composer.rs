//! Objective composer and training step

use crate::autograd::{add, backward};
use crate::config::{validate_config, HeadParams, MultitaskConfig};
use crate::error::{MultitaskError, Result};
use crate::features::{BatchView, RepresentationKind, Representations, MASKED_LM_POSITIONS};
use crate::head::{EvalBundle, FeatureTransferHead, Head, HeadOutput, HeadStore, Mode, Prediction};
use crate::optim::Optimizer;
use crate::problem::{GroupSequence, JointGroup, Problem, ProblemKind, ProblemRegistry};
use crate::Tensor;
use std::collections::BTreeMap;

/// Identity of the masked-LM head added by `augment_mask_lm`
pub const AUGMENT_MASK_LM: &str = "augment_mask_lm";

/// Parameter-name prefix of the augmentation store
pub const AUGMENT_NAMESPACE: &str = "augment/";

/// Combined output of one joint group
#[derive(Debug, Clone)]
pub enum CombinedResult {
    /// Sum of the task losses, differentiable
    Loss(Tensor),
    /// Metrics keyed `<task>/<metric>` and the summed loss
    Eval(EvalBundle),
    /// Decoded output per task
    Predictions(BTreeMap<String, Prediction>),
}

impl CombinedResult {
    /// Loss tensor of a TRAIN result
    pub fn into_loss(self) -> Result<Tensor> {
        match self {
            Self::Loss(loss) => Ok(loss),
            _ => Err(MultitaskError::invalid("mode", "expected a TRAIN result")),
        }
    }

    /// Metrics of an EVAL result
    pub fn into_eval(self) -> Result<EvalBundle> {
        match self {
            Self::Eval(bundle) => Ok(bundle),
            _ => Err(MultitaskError::invalid("mode", "expected an EVAL result")),
        }
    }

    /// Predictions of a PREDICT result
    pub fn into_predictions(self) -> Result<BTreeMap<String, Prediction>> {
        match self {
            Self::Predictions(predictions) => Ok(predictions),
            _ => Err(MultitaskError::invalid("mode", "expected a PREDICT result")),
        }
    }
}

/// Runs the heads of a joint group and combines their outputs
///
/// Owns the main [`HeadStore`] and, with label transfer on, a
/// [`FeatureTransferHead`] that covers every task of the group sequence.
/// The masked-LM augmentation head lives in a separate namespaced store, so
/// no registered task name can collide with it.
#[derive(Debug)]
pub struct ObjectiveComposer {
    registry: ProblemRegistry,
    groups: GroupSequence,
    store: HeadStore,
    augment: HeadStore,
    transfer: Option<FeatureTransferHead>,
    augment_mask_lm: bool,
}

impl ObjectiveComposer {
    /// Composer without transfer or augmentation
    ///
    /// Fails with `InvalidConfig` when `params` is out of range.
    pub fn new(registry: ProblemRegistry, groups: GroupSequence, params: HeadParams) -> Result<Self> {
        Ok(Self {
            registry,
            groups,
            store: HeadStore::new(params.clone())?,
            augment: HeadStore::with_namespace(AUGMENT_NAMESPACE, params)?,
            transfer: None,
            augment_mask_lm: false,
        })
    }

    /// Validate and resolve `config`
    pub fn from_config(config: &MultitaskConfig) -> Result<Self> {
        validate_config(config)?;
        let (registry, groups) = config.resolve()?;
        let composer = Self::new(registry, groups, config.head.clone())?
            .with_label_transfer(config.label_transfer.then(|| config.head.clone()))?
            .with_augment_mask_lm(config.augment_mask_lm);
        Ok(composer)
    }

    /// Enable feature transfer with donor heads built from `params`
    pub fn with_label_transfer(mut self, params: Option<HeadParams>) -> Result<Self> {
        self.transfer = params.map(FeatureTransferHead::new).transpose()?;
        Ok(self)
    }

    /// Add a masked-LM loss to TRAIN steps whose batch has masked-LM fields
    pub fn with_augment_mask_lm(mut self, enabled: bool) -> Self {
        self.augment_mask_lm = enabled;
        self
    }

    /// Resolved group sequence
    pub fn groups(&self) -> &GroupSequence {
        &self.groups
    }

    /// Task registry
    pub fn registry(&self) -> &ProblemRegistry {
        &self.registry
    }

    /// Main head store
    pub fn heads(&self) -> &HeadStore {
        &self.store
    }

    /// Main head store, mutably (restore)
    pub fn heads_mut(&mut self) -> &mut HeadStore {
        &mut self.store
    }

    /// Live head for an effective identity
    pub fn head(&self, identity: &str) -> Option<&dyn Head> {
        self.store.get(identity)
    }

    /// Masked-LM augmentation head, once a TRAIN step has created it
    pub fn augment_head(&self) -> Option<&dyn Head> {
        self.augment.get(AUGMENT_MASK_LM)
    }

    /// Feature-transfer head, when enabled
    pub fn transfer(&self) -> Option<&FeatureTransferHead> {
        self.transfer.as_ref()
    }

    /// Compute every task of `group` and combine the outputs
    pub fn run(
        &mut self,
        group: &JointGroup,
        batch: &BatchView,
        reps: &Representations,
        mode: Mode,
    ) -> Result<CombinedResult> {
        let augmented = match self.transfer.as_mut() {
            Some(transfer) => Some(transfer.run(&self.registry, &self.groups, reps, mode)?),
            None => None,
        };
        let head_reps = augmented.as_ref().unwrap_or(reps);

        let mut outputs = Vec::with_capacity(group.len());
        for task in group.tasks() {
            let problem = self.registry.get(task)?;
            let identity = self.registry.identity_problem(task)?;
            let head = self.store.get_or_create(identity, head_reps)?;
            outputs.push((task.clone(), head.compute(problem, batch, head_reps, mode)?));
        }

        match combine(outputs, mode)? {
            CombinedResult::Loss(loss) => {
                let loss = match self.augment_loss(group, batch, reps)? {
                    Some(extra) => add(&loss, &extra),
                    None => loss,
                };
                Ok(CombinedResult::Loss(loss))
            }
            other => Ok(other),
        }
    }

    /// Masked-LM loss on the encoder representations, if augmentation applies
    ///
    /// Skipped for groups that already train a pretraining task.
    fn augment_loss(&mut self, group: &JointGroup, batch: &BatchView, reps: &Representations) -> Result<Option<Tensor>> {
        if !self.augment_mask_lm
            || !batch.contains(MASKED_LM_POSITIONS)
            || !reps.contains(RepresentationKind::EmbedTable)
        {
            return Ok(None);
        }
        for task in group.tasks() {
            if self.registry.get(task)?.kind == ProblemKind::Pretrain {
                return Ok(None);
            }
        }
        let problem = Problem::new(AUGMENT_MASK_LM, ProblemKind::Pretrain, 0);
        let head = self.augment.get_or_create_masked_lm(AUGMENT_MASK_LM, reps)?;
        head.compute(&problem, batch, reps, Mode::Train)?.into_loss().map(Some)
    }

    /// One optimization step on `group`: TRAIN, backward, update, zero grads
    ///
    /// Updates every live parameter, donors included. Returns the loss value.
    pub fn train_step(
        &mut self,
        group: &JointGroup,
        batch: &BatchView,
        reps: &Representations,
        optimizer: &mut dyn Optimizer,
    ) -> Result<f32> {
        let mut loss = self.run(group, batch, reps, Mode::Train)?.into_loss()?;
        let value = loss.item();
        backward(&mut loss, None);

        let mut params = self.store.parameters_mut();
        params.extend(self.augment.parameters_mut());
        if let Some(transfer) = self.transfer.as_mut() {
            params.extend(transfer.donors_mut().parameters_mut());
        }
        optimizer.step(&mut params);
        optimizer.zero_grad(&mut params);

        tracing::debug!(group = %group.stable_id(), loss = value, "train step");
        Ok(value)
    }
}

fn combine(outputs: Vec<(String, HeadOutput)>, mode: Mode) -> Result<CombinedResult> {
    match mode {
        Mode::Train => {
            let mut total: Option<Tensor> = None;
            for (_, output) in outputs {
                let loss = output.into_loss()?;
                total = Some(match total {
                    Some(sum) => add(&sum, &loss),
                    None => loss,
                });
            }
            Ok(CombinedResult::Loss(total.unwrap_or_else(|| Tensor::scalar(0.0))))
        }
        Mode::Eval => {
            let mut merged = EvalBundle::default();
            for (task, output) in outputs {
                merged.merge_prefixed(&format!("{task}/"), output.into_eval()?);
            }
            Ok(CombinedResult::Eval(merged))
        }
        Mode::Predict => {
            let predictions = outputs
                .into_iter()
                .map(|(task, output)| Ok((task, output.into_prediction()?)))
                .collect::<Result<BTreeMap<_, _>>>()?;
            Ok(CombinedResult::Predictions(predictions))
        }
    }
}
