//! Grouping expression parsing
//!
//! `|` separates joint groups trained in alternating steps, `&` separates the
//! tasks of one joint group whose losses are summed into a single objective.

use super::ProblemRegistry;
use crate::error::{MultitaskError, Result};
use serde::{Deserialize, Serialize};

/// Tasks trained together in one optimization step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JointGroup {
    tasks: Vec<String>,
}

impl JointGroup {
    /// Task names in expression order
    pub fn tasks(&self) -> &[String] {
        &self.tasks
    }

    /// Number of tasks in the group
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Always false for a resolved group
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Whether `task` belongs to this group
    pub fn contains(&self, task: &str) -> bool {
        self.tasks.iter().any(|t| t == task)
    }

    /// Order-independent identifier (`"B&A"` and `"A&B"` agree)
    pub fn stable_id(&self) -> String {
        let mut names: Vec<&str> = self.tasks.iter().map(String::as_str).collect();
        names.sort_unstable();
        names.join("_")
    }
}

/// Ordered joint groups defining task alternation across steps
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GroupSequence {
    groups: Vec<JointGroup>,
}

impl GroupSequence {
    /// Groups in expression order
    pub fn groups(&self) -> &[JointGroup] {
        &self.groups
    }

    /// Number of groups
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Always false for a resolved sequence
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Group used at `step` under round-robin scheduling
    pub fn group_for_step(&self, step: usize) -> Option<&JointGroup> {
        if self.groups.is_empty() {
            return None;
        }
        self.groups.get(step % self.groups.len())
    }

    /// Every task of every group, first occurrence order, without repeats
    pub fn all_tasks(&self) -> Vec<&str> {
        let mut seen = Vec::new();
        for task in self.groups.iter().flat_map(|g| g.tasks.iter()) {
            if !seen.contains(&task.as_str()) {
                seen.push(task.as_str());
            }
        }
        seen
    }

    /// Stable run identifier: sorted task names joined by `_`
    pub fn stable_id(&self) -> String {
        let mut names = self.all_tasks();
        names.sort_unstable();
        names.join("_")
    }
}

/// Parses grouping expressions against a registry
pub struct ProblemGroupResolver<'a> {
    registry: &'a ProblemRegistry,
}

impl<'a> ProblemGroupResolver<'a> {
    /// Resolver bound to `registry`
    pub fn new(registry: &'a ProblemRegistry) -> Self {
        Self { registry }
    }

    /// Parse `expression` into a [`GroupSequence`]
    ///
    /// Fails with `EmptyExpression` on an empty expression, chunk or task
    /// name, and with `UnknownTask` for names absent from the registry.
    /// Surrounding whitespace around names is ignored; a name repeated inside
    /// one chunk is kept once.
    pub fn resolve(&self, expression: &str) -> Result<GroupSequence> {
        if expression.trim().is_empty() {
            return Err(MultitaskError::EmptyExpression {
                detail: "expression is empty".to_string(),
            });
        }

        let mut groups = Vec::new();
        for (chunk_idx, chunk) in expression.split('|').enumerate() {
            let mut tasks: Vec<String> = Vec::new();
            for name in chunk.split('&').map(str::trim) {
                if name.is_empty() {
                    return Err(MultitaskError::EmptyExpression {
                        detail: format!("empty task name in chunk {chunk_idx} of '{expression}'"),
                    });
                }
                if !self.registry.contains(name) {
                    return Err(MultitaskError::unknown_task(name));
                }
                if !tasks.iter().any(|t| t == name) {
                    tasks.push(name.to_string());
                }
            }
            groups.push(JointGroup { tasks });
        }

        let sequence = GroupSequence { groups };
        tracing::info!(
            expression,
            groups = sequence.len(),
            tasks = sequence.all_tasks().len(),
            "resolved problem groups"
        );
        Ok(sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::problem::{Problem, ProblemKind};
    use proptest::prelude::*;

    const NAMES: [&str; 5] = ["CWS", "NER", "POS", "WeiboNER", "WeiboFakeCLS"];

    fn registry() -> ProblemRegistry {
        ProblemRegistry::new([
            Problem::new("CWS", ProblemKind::SequenceTag, 5),
            Problem::new("NER", ProblemKind::SequenceTag, 10),
            Problem::new("POS", ProblemKind::SequenceTag, 62),
            Problem::new("WeiboNER", ProblemKind::SequenceTag, 10).sharing("NER"),
            Problem::new("WeiboFakeCLS", ProblemKind::Classification, 2),
        ])
        .expect("valid registry")
    }

    #[test]
    fn test_resolve_joint_and_alternating() {
        let reg = registry();
        let seq = ProblemGroupResolver::new(&reg).resolve("CWS&POS|NER").expect("resolves");
        assert_eq!(seq.len(), 2);
        assert_eq!(seq.groups()[0].tasks(), ["CWS", "POS"]);
        assert_eq!(seq.groups()[1].tasks(), ["NER"]);
    }

    #[test]
    fn test_unknown_task_in_joint_group() {
        let reg = registry();
        let err = ProblemGroupResolver::new(&reg).resolve("CWS&Z").unwrap_err();
        assert!(matches!(err, MultitaskError::UnknownTask { name } if name == "Z"));
    }

    #[test]
    fn test_empty_expression() {
        let reg = registry();
        let resolver = ProblemGroupResolver::new(&reg);
        assert!(matches!(
            resolver.resolve("").unwrap_err(),
            MultitaskError::EmptyExpression { .. }
        ));
        assert!(matches!(
            resolver.resolve("CWS||NER").unwrap_err(),
            MultitaskError::EmptyExpression { .. }
        ));
        assert!(matches!(
            resolver.resolve("CWS&").unwrap_err(),
            MultitaskError::EmptyExpression { .. }
        ));
    }

    #[test]
    fn test_stable_ids_sort_names() {
        let reg = registry();
        let seq = ProblemGroupResolver::new(&reg).resolve("POS&CWS|NER|CWS").expect("resolves");
        assert_eq!(seq.groups()[0].stable_id(), "CWS_POS");
        assert_eq!(seq.stable_id(), "CWS_NER_POS");
        assert_eq!(seq.all_tasks(), vec!["POS", "CWS", "NER"]);
    }

    #[test]
    fn test_duplicate_in_chunk_kept_once() {
        let reg = registry();
        let seq = ProblemGroupResolver::new(&reg).resolve("NER & NER").expect("resolves");
        assert_eq!(seq.groups()[0].tasks(), ["NER"]);
    }

    #[test]
    fn test_round_robin_group_for_step() {
        let reg = registry();
        let seq = ProblemGroupResolver::new(&reg).resolve("CWS|NER").expect("resolves");
        assert_eq!(seq.group_for_step(0).map(JointGroup::stable_id).as_deref(), Some("CWS"));
        assert_eq!(seq.group_for_step(3).map(JointGroup::stable_id).as_deref(), Some("NER"));
    }

    proptest! {
        #[test]
        fn prop_pipe_only_yields_singletons(picks in prop::collection::vec(0usize..NAMES.len(), 1..12)) {
            let reg = registry();
            let expr = picks.iter().map(|&i| NAMES[i]).collect::<Vec<_>>().join("|");
            let seq = ProblemGroupResolver::new(&reg).resolve(&expr).expect("resolves");
            prop_assert_eq!(seq.len(), picks.len());
            for (group, &i) in seq.groups().iter().zip(&picks) {
                prop_assert_eq!(group.tasks(), [NAMES[i].to_string()]);
            }
        }

        #[test]
        fn prop_chunk_count_preserved(
            chunks in prop::collection::vec(prop::collection::vec(0usize..NAMES.len(), 1..4), 1..6)
        ) {
            let reg = registry();
            let expr = chunks
                .iter()
                .map(|c| c.iter().map(|&i| NAMES[i]).collect::<Vec<_>>().join("&"))
                .collect::<Vec<_>>()
                .join("|");
            let seq = ProblemGroupResolver::new(&reg).resolve(&expr).expect("resolves");
            prop_assert_eq!(seq.len(), chunks.len());
            for group in seq.groups() {
                prop_assert!(!group.is_empty());
            }
        }
    }
}
