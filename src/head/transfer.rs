//! Label/feature transfer: donor projections concatenated into the representations

use super::{HeadStore, Mode};
use crate::autograd::concat_cols;
use crate::config::HeadParams;
use crate::error::{MultitaskError, Result};
use crate::features::{Hidden, RepresentationKind, Representations};
use crate::problem::{GroupSequence, ProblemKind, ProblemRegistry};
use crate::Tensor;

/// Parameter namespace of the donor heads
pub const TRANSFER_NAMESPACE: &str = "label_transfer/";

/// Runs a donor head for every task of the configuration and concatenates
/// their raw projections per representation kind
///
/// Donors are keyed by effective identity in their own [`HeadStore`], so
/// tasks sharing a head also share a donor. Pretraining tasks have no class
/// projection and do not contribute.
#[derive(Debug)]
pub struct FeatureTransferHead {
    donors: HeadStore,
}

impl FeatureTransferHead {
    /// Transfer head with an empty donor store
    pub fn new(params: HeadParams) -> Result<Self> {
        Ok(Self {
            donors: HeadStore::with_namespace(TRANSFER_NAMESPACE, params)?,
        })
    }

    /// Donor heads
    pub fn donors(&self) -> &HeadStore {
        &self.donors
    }

    /// Donor heads, mutably (optimizer steps, restore)
    pub fn donors_mut(&mut self) -> &mut HeadStore {
        &mut self.donors
    }

    /// Augmented copy of `reps`
    ///
    /// A kind with two or more contributions is replaced by their
    /// concatenation along the class dimension; a kind with fewer is left as
    /// it was.
    pub fn run(
        &mut self,
        registry: &ProblemRegistry,
        groups: &GroupSequence,
        reps: &Representations,
        mode: Mode,
    ) -> Result<Representations> {
        let mut sequence: Vec<Hidden> = Vec::new();
        let mut pooled: Vec<Hidden> = Vec::new();

        for task in groups.all_tasks() {
            let problem = registry.get(task)?;
            if problem.kind == ProblemKind::Pretrain {
                continue;
            }
            let identity = registry.identity_problem(task)?;
            let donor = self.donors.get_or_create(identity, reps)?;
            match donor.project(problem, reps, mode)? {
                Some((RepresentationKind::Sequence, hidden)) => sequence.push(hidden),
                Some((RepresentationKind::Pooled, hidden)) => pooled.push(hidden),
                Some((RepresentationKind::EmbedTable, _)) | None => {}
            }
        }

        let mut augmented = reps.clone();
        for (kind, parts) in [
            (RepresentationKind::Sequence, sequence),
            (RepresentationKind::Pooled, pooled),
        ] {
            if parts.len() < 2 {
                continue;
            }
            let hidden = concat(&parts)?;
            tracing::debug!(kind = %kind, contributors = parts.len(), width = hidden.width(), "transferred features");
            augmented.insert(kind, hidden);
        }
        Ok(augmented)
    }
}

fn concat(parts: &[Hidden]) -> Result<Hidden> {
    let rows = parts[0].rows();
    let mut shape = parts[0].shape().to_vec();
    for part in parts {
        let leading = &part.shape()[..part.shape().len() - 1];
        if leading != &shape[..shape.len() - 1] {
            return Err(MultitaskError::shape("label_transfer", shape.clone(), part.shape().to_vec()));
        }
    }
    let width: usize = parts.iter().map(Hidden::width).sum();
    let inputs: Vec<(&Tensor, usize)> = parts.iter().map(|p| (p.tensor(), p.width())).collect();
    let tensor = concat_cols(&inputs, rows);
    if let Some(last) = shape.last_mut() {
        *last = width;
    }
    Hidden::new(tensor, shape)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::head::test_support::{plain_params, reps};
    use crate::problem::{Problem, ProblemGroupResolver};

    fn registry() -> ProblemRegistry {
        ProblemRegistry::new([
            Problem::new("CWS", ProblemKind::SequenceTag, 5),
            Problem::new("NER", ProblemKind::SequenceTag, 10),
            Problem::new("WeiboNER", ProblemKind::SequenceTag, 10).sharing("NER"),
            Problem::new("WeiboFakeCLS", ProblemKind::Classification, 2),
            Problem::new("WeiboSenti", ProblemKind::Classification, 3),
            Problem::new("WeiboPretrain", ProblemKind::Pretrain, 2),
        ])
        .expect("valid registry")
    }

    fn run(expression: &str) -> (FeatureTransferHead, Representations, Representations) {
        let registry = registry();
        let groups = ProblemGroupResolver::new(&registry).resolve(expression).expect("resolves");
        let reps = reps(2, 3, 6);
        let mut transfer = FeatureTransferHead::new(plain_params()).expect("valid params");
        let augmented = transfer.run(&registry, &groups, &reps, Mode::Eval).expect("runs");
        (transfer, reps, augmented)
    }

    #[test]
    fn test_single_contributor_leaves_sequence_unchanged() {
        let (_, reps, augmented) = run("NER|WeiboFakeCLS");
        let before = reps.get(RepresentationKind::Sequence).expect("seq");
        let after = augmented.get(RepresentationKind::Sequence).expect("seq");
        assert_eq!(before.shape(), after.shape());
        assert_eq!(before.tensor().data(), after.tensor().data());
    }

    #[test]
    fn test_contributors_concatenate_class_dimension() {
        let (transfer, _, augmented) = run("CWS&NER|WeiboFakeCLS&WeiboSenti");
        assert_eq!(augmented.get(RepresentationKind::Sequence).expect("seq").shape(), &[2, 3, 15]);
        assert_eq!(augmented.get(RepresentationKind::Pooled).expect("pooled").shape(), &[2, 5]);
        assert_eq!(transfer.donors().len(), 4);
    }

    #[test]
    fn test_shared_identity_reuses_donor_but_contributes_per_task() {
        let (transfer, _, augmented) = run("NER|WeiboNER");
        assert_eq!(transfer.donors().len(), 1);
        assert!(transfer.donors().contains("NER"));
        assert_eq!(augmented.get(RepresentationKind::Sequence).expect("seq").width(), 20);
    }

    #[test]
    fn test_pretrain_tasks_do_not_contribute() {
        let (transfer, _, augmented) = run("CWS|WeiboPretrain");
        assert_eq!(transfer.donors().len(), 1);
        assert_eq!(augmented.get(RepresentationKind::Sequence).expect("seq").width(), 6);
    }

    #[test]
    fn test_donor_parameters_namespaced() {
        let (transfer, _, _) = run("CWS&NER");
        assert!(transfer
            .donors()
            .state_dict()
            .keys()
            .all(|name| name.starts_with(TRANSFER_NAMESPACE)));
    }
}
