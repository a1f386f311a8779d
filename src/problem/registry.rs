//! Static problem metadata and head-sharing resolution

use crate::error::{MultitaskError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Kind of task, selecting the head variant that serves it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProblemKind {
    /// Per-token labeling (segmentation, NER, POS)
    #[serde(rename = "seq_tag")]
    SequenceTag,
    /// Sentence-level classification
    #[serde(rename = "cls")]
    Classification,
    /// Masked-LM + next-segment pretraining
    #[serde(rename = "pretrain")]
    Pretrain,
}

impl std::fmt::Display for ProblemKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::SequenceTag => "seq_tag",
            Self::Classification => "cls",
            Self::Pretrain => "pretrain",
        };
        f.write_str(s)
    }
}

/// One registered task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Problem {
    /// Unique task name
    pub name: String,
    /// Head variant
    pub kind: ProblemKind,
    /// Output cardinality, padding class included
    pub num_classes: usize,
    /// Task whose head this task reuses
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_top: Option<String>,
    /// Binary mask over the head's classes; its length replaces `num_classes`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_mask: Option<Vec<f32>>,
}

impl Problem {
    /// Create a problem without sharing or masking
    pub fn new(name: impl Into<String>, kind: ProblemKind, num_classes: usize) -> Self {
        Self {
            name: name.into(),
            kind,
            num_classes,
            share_top: None,
            class_mask: None,
        }
    }

    /// Reuse the head of `target`
    pub fn sharing(mut self, target: impl Into<String>) -> Self {
        self.share_top = Some(target.into());
        self
    }

    /// Restrict the active classes with a binary mask
    pub fn with_class_mask(mut self, mask: Vec<f32>) -> Self {
        self.class_mask = Some(mask);
        self
    }

    /// Width of the projection serving this task
    pub fn output_width(&self) -> usize {
        self.class_mask.as_ref().map_or(self.num_classes, Vec::len)
    }
}

/// Immutable lookup of every configured task
#[derive(Debug, Clone, Default)]
pub struct ProblemRegistry {
    problems: BTreeMap<String, Problem>,
}

impl ProblemRegistry {
    /// Build a registry, failing fast on dangling, cyclic or incompatible share links
    pub fn new(problems: impl IntoIterator<Item = Problem>) -> Result<Self> {
        let registry = Self {
            problems: problems
                .into_iter()
                .map(|p| (p.name.clone(), p))
                .collect(),
        };
        for problem in registry.problems.values() {
            let identity = registry.identity_problem(&problem.name)?;
            check_share_compatible(problem, identity)?;
        }
        Ok(registry)
    }

    /// Look up a task
    pub fn get(&self, name: &str) -> Result<&Problem> {
        self.problems
            .get(name)
            .ok_or_else(|| MultitaskError::unknown_task(name))
    }

    /// Whether `name` is registered
    pub fn contains(&self, name: &str) -> bool {
        self.problems.contains_key(name)
    }

    /// Registered task names, sorted
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.problems.keys().map(String::as_str)
    }

    /// Number of registered tasks
    pub fn len(&self) -> usize {
        self.problems.len()
    }

    /// True when no task is registered
    pub fn is_empty(&self) -> bool {
        self.problems.is_empty()
    }

    /// Task whose head parameters `name` actually uses
    ///
    /// Follows `share_top` links to the end of the chain. A task without a
    /// link is its own identity.
    pub fn effective_identity(&self, name: &str) -> Result<&str> {
        let mut current = self.get(name)?;
        let mut chain = vec![current.name.clone()];
        while let Some(target) = current.share_top.as_deref() {
            if chain.iter().any(|seen| seen == target) {
                chain.push(target.to_string());
                return Err(MultitaskError::CyclicShare { chain });
            }
            current = self.get(target)?;
            chain.push(current.name.clone());
        }
        Ok(current.name.as_str())
    }

    /// Problem record of the effective identity of `name`
    pub fn identity_problem(&self, name: &str) -> Result<&Problem> {
        let identity = self.effective_identity(name)?;
        self.get(identity)
    }
}

/// A task served by another task's head must have that head's kind and width
fn check_share_compatible(problem: &Problem, identity: &Problem) -> Result<()> {
    if problem.name == identity.name {
        return Ok(());
    }
    let field = format!("problems.{}.share_top", problem.name);
    if problem.kind != identity.kind {
        return Err(MultitaskError::invalid(
            field,
            format!(
                "{} task cannot use the {} head of '{}'",
                problem.kind, identity.kind, identity.name
            ),
        ));
    }
    if problem.output_width() != identity.output_width() {
        return Err(MultitaskError::invalid(
            field,
            format!(
                "width {} differs from the head of '{}' (width {}); add a class_mask of that width",
                problem.output_width(),
                identity.name,
                identity.output_width()
            ),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ner_registry() -> ProblemRegistry {
        ProblemRegistry::new([
            Problem::new("NER", ProblemKind::SequenceTag, 10),
            Problem::new("WeiboNER", ProblemKind::SequenceTag, 10).sharing("NER"),
            Problem::new("bosonner", ProblemKind::SequenceTag, 10).sharing("WeiboNER"),
        ])
        .expect("valid registry")
    }

    #[test]
    fn test_identity_of_unlinked_task_is_itself() {
        let reg = ner_registry();
        assert_eq!(reg.effective_identity("NER").expect("known"), "NER");
    }

    #[test]
    fn test_identity_follows_chain() {
        let reg = ner_registry();
        assert_eq!(reg.effective_identity("WeiboNER").expect("known"), "NER");
        assert_eq!(reg.effective_identity("bosonner").expect("known"), "NER");
    }

    #[test]
    fn test_unknown_share_target_rejected_at_construction() {
        let err = ProblemRegistry::new([
            Problem::new("WeiboNER", ProblemKind::SequenceTag, 10).sharing("NER"),
        ])
        .unwrap_err();
        assert!(matches!(err, MultitaskError::UnknownTask { name } if name == "NER"));
    }

    #[test]
    fn test_share_cycle_rejected() {
        let err = ProblemRegistry::new([
            Problem::new("A", ProblemKind::SequenceTag, 3).sharing("B"),
            Problem::new("B", ProblemKind::SequenceTag, 3).sharing("A"),
        ])
        .unwrap_err();
        match err {
            MultitaskError::CyclicShare { chain } => {
                assert_eq!(chain.first(), chain.last());
                assert_eq!(chain.len(), 3);
            }
            other => panic!("expected cycle, got {other}"),
        }
    }

    #[test]
    fn test_self_share_is_a_cycle() {
        let err = ProblemRegistry::new([Problem::new("A", ProblemKind::Classification, 2).sharing("A")])
            .unwrap_err();
        assert!(matches!(err, MultitaskError::CyclicShare { .. }));
    }

    #[test]
    fn test_share_between_kinds_rejected() {
        let err = ProblemRegistry::new([
            Problem::new("NER", ProblemKind::SequenceTag, 4),
            Problem::new("Senti", ProblemKind::Classification, 4).sharing("NER"),
        ])
        .unwrap_err();
        assert!(matches!(err, MultitaskError::InvalidConfig { ref field, .. } if field == "problems.Senti.share_top"));
        assert!(err.is_configuration_error());
    }

    #[test]
    fn test_share_with_other_width_rejected() {
        let err = ProblemRegistry::new([
            Problem::new("NER", ProblemKind::SequenceTag, 4),
            Problem::new("WeiboNER", ProblemKind::SequenceTag, 3).sharing("NER"),
        ])
        .unwrap_err();
        assert!(matches!(err, MultitaskError::InvalidConfig { ref field, .. } if field == "problems.WeiboNER.share_top"));
    }

    #[test]
    fn test_share_with_mask_of_head_width_accepted() {
        let reg = ProblemRegistry::new([
            Problem::new("NER", ProblemKind::SequenceTag, 4),
            Problem::new("WeiboNER", ProblemKind::SequenceTag, 3).with_class_mask(vec![1.0, 1.0, 1.0, 0.0]).sharing("NER"),
        ])
        .expect("mask matches head width");
        assert_eq!(reg.effective_identity("WeiboNER").expect("known"), "NER");
    }

    #[test]
    fn test_output_width_uses_mask_length() {
        let p = Problem::new("POS", ProblemKind::SequenceTag, 62).with_class_mask(vec![1.0; 70]);
        assert_eq!(p.output_width(), 70);
        assert_eq!(Problem::new("CWS", ProblemKind::SequenceTag, 5).output_width(), 5);
    }

    #[test]
    fn test_kind_serde_names() {
        let kind: ProblemKind = serde_json::from_str("\"seq_tag\"").expect("parse");
        assert_eq!(kind, ProblemKind::SequenceTag);
        assert_eq!(serde_json::to_string(&ProblemKind::Classification).expect("ser"), "\"cls\"");
        assert_eq!(ProblemKind::Pretrain.to_string(), "pretrain");
    }
}
