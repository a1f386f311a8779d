//! Declarative multi-task configuration (YAML or JSON)

use crate::error::{MultitaskError, Result};
use crate::problem::{GroupSequence, Problem, ProblemGroupResolver, ProblemKind, ProblemRegistry};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// One task definition under `problems`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemSpec {
    /// Head variant: `seq_tag` | `cls` | `pretrain`
    pub kind: ProblemKind,

    /// Output cardinality, padding class included
    pub num_classes: usize,

    /// Reuse the head of another task
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_top: Option<String>,

    /// Optional binary class mask
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_mask: Option<Vec<f32>>,
}

/// Non-linearity of the masked-LM transform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    /// Gaussian error linear unit
    #[default]
    Gelu,
    /// Rectified linear unit
    Relu,
}

/// Head hyper-parameters shared by every head
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeadParams {
    /// Keep probability of the dropout applied in TRAIN
    #[serde(default = "default_keep_prob")]
    pub dropout_keep_prob: f32,

    /// Label smoothing factor; 0 disables smoothing
    #[serde(default = "default_label_smoothing")]
    pub label_smoothing: f32,

    /// Width of the masked-LM transform (must equal the encoder width)
    #[serde(default = "default_mask_lm_hidden_size")]
    pub mask_lm_hidden_size: usize,

    /// Activation of the masked-LM transform
    #[serde(default)]
    pub mask_lm_hidden_act: Activation,

    /// Std of the masked-LM transform initializer
    #[serde(default = "default_initializer_range")]
    pub mask_lm_initializer_range: f32,

    /// Vocabulary size of the tied embedding table
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,

    /// Seed for parameter init, dropout and label sampling
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for HeadParams {
    fn default() -> Self {
        Self {
            dropout_keep_prob: default_keep_prob(),
            label_smoothing: default_label_smoothing(),
            mask_lm_hidden_size: default_mask_lm_hidden_size(),
            mask_lm_hidden_act: Activation::default(),
            mask_lm_initializer_range: default_initializer_range(),
            vocab_size: default_vocab_size(),
            seed: default_seed(),
        }
    }
}

impl HeadParams {
    /// Reject out-of-range hyper-parameters
    ///
    /// Every head store checks this on construction, so heads never see a
    /// negative smoothing factor or an empty embedding.
    pub fn validate(&self) -> Result<()> {
        if !(self.label_smoothing >= 0.0) {
            return Err(MultitaskError::invalid(
                "head.label_smoothing",
                format!("{} (must be >= 0.0)", self.label_smoothing),
            ));
        }
        if !(self.dropout_keep_prob > 0.0 && self.dropout_keep_prob <= 1.0) {
            return Err(MultitaskError::invalid(
                "head.dropout_keep_prob",
                format!("{} (must be in (0.0, 1.0])", self.dropout_keep_prob),
            ));
        }
        if self.vocab_size == 0 {
            return Err(MultitaskError::invalid("head.vocab_size", "must be > 0"));
        }
        if self.mask_lm_hidden_size == 0 {
            return Err(MultitaskError::invalid("head.mask_lm_hidden_size", "must be > 0"));
        }
        Ok(())
    }
}

fn default_keep_prob() -> f32 {
    0.9
}

fn default_label_smoothing() -> f32 {
    0.1
}

fn default_mask_lm_hidden_size() -> usize {
    768
}

fn default_initializer_range() -> f32 {
    0.02
}

fn default_vocab_size() -> usize {
    21128
}

fn default_seed() -> u64 {
    42
}

/// How joint groups are weighted when a scheduler samples them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceType {
    /// Proportional to the number of training examples
    #[default]
    DataBalanced,
    /// Uniform over groups
    ProblemBalanced,
}

/// Run-planning parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingParams {
    /// Learning rate for a single device
    #[serde(default = "default_init_lr")]
    pub init_lr: f32,

    /// Per-device batch size
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Epochs over the combined data
    #[serde(default = "default_train_epoch")]
    pub train_epoch: usize,

    /// Duplication of pretraining data
    #[serde(default = "default_dupe_factor")]
    pub dupe_factor: usize,

    /// Group weighting scheme
    #[serde(default)]
    pub multitask_balance_type: BalanceType,

    /// Training example count per task
    #[serde(default)]
    pub data_num: BTreeMap<String, u64>,
}

impl Default for TrainingParams {
    fn default() -> Self {
        Self {
            init_lr: default_init_lr(),
            batch_size: default_batch_size(),
            train_epoch: default_train_epoch(),
            dupe_factor: default_dupe_factor(),
            multitask_balance_type: BalanceType::default(),
            data_num: BTreeMap::new(),
        }
    }
}

fn default_init_lr() -> f32 {
    2e-5
}

fn default_batch_size() -> usize {
    32
}

fn default_train_epoch() -> usize {
    15
}

fn default_dupe_factor() -> usize {
    10
}

/// Complete multi-task configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultitaskConfig {
    /// Grouping expression, e.g. `"CWS|NER&POS"`
    pub problem: String,

    /// Task definitions by name
    pub problems: BTreeMap<String, ProblemSpec>,

    /// Head hyper-parameters
    #[serde(default)]
    pub head: HeadParams,

    /// Feed every task's raw projections to the heads of the current group
    #[serde(default)]
    pub label_transfer: bool,

    /// Add a masked-LM loss to TRAIN steps whose batch carries masked-LM fields
    #[serde(default)]
    pub augment_mask_lm: bool,

    /// Run-planning parameters
    #[serde(default)]
    pub training: TrainingParams,
}

impl MultitaskConfig {
    /// Parse from YAML text
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| MultitaskError::Serialization {
            path: None,
            message: e.to_string(),
        })
    }

    /// Parse from JSON text
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| MultitaskError::Serialization {
            path: None,
            message: e.to_string(),
        })
    }

    /// Load from a `.yaml`/`.yml` or JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| MultitaskError::io(format!("reading {}", path.display()), e))?;
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml" | "yml")
        );
        let parsed = if is_yaml {
            Self::from_yaml_str(&text)
        } else {
            Self::from_json_str(&text)
        };
        parsed.map_err(|e| match e {
            MultitaskError::Serialization { message, .. } => MultitaskError::Serialization {
                path: Some(path.to_path_buf()),
                message,
            },
            other => other,
        })
    }

    /// Registry of every configured task
    pub fn registry(&self) -> Result<ProblemRegistry> {
        ProblemRegistry::new(self.problems.iter().map(|(name, spec)| Problem {
            name: name.clone(),
            kind: spec.kind,
            num_classes: spec.num_classes,
            share_top: spec.share_top.clone(),
            class_mask: spec.class_mask.clone(),
        }))
    }

    /// Resolve the grouping expression against the registry
    pub fn resolve(&self) -> Result<(ProblemRegistry, GroupSequence)> {
        let registry = self.registry()?;
        let groups = ProblemGroupResolver::new(&registry).resolve(&self.problem)?;
        Ok((registry, groups))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
problem: "CWS|NER&WeiboNER"
problems:
  CWS: { kind: seq_tag, num_classes: 5 }
  NER: { kind: seq_tag, num_classes: 10 }
  WeiboNER: { kind: seq_tag, num_classes: 10, share_top: NER }
head:
  label_smoothing: 0.0
  mask_lm_hidden_act: relu
training:
  multitask_balance_type: problem_balanced
  data_num: { CWS: 100, NER: 50 }
"#;

    #[test]
    fn test_parse_yaml_with_defaults() {
        let config = MultitaskConfig::from_yaml_str(YAML).expect("parses");
        assert_eq!(config.problems.len(), 3);
        assert_eq!(config.head.label_smoothing, 0.0);
        assert_eq!(config.head.dropout_keep_prob, 0.9);
        assert_eq!(config.head.mask_lm_hidden_act, Activation::Relu);
        assert_eq!(config.training.batch_size, 32);
        assert_eq!(config.training.multitask_balance_type, BalanceType::ProblemBalanced);
        assert!(!config.label_transfer);
    }

    #[test]
    fn test_resolve_from_config() {
        let config = MultitaskConfig::from_yaml_str(YAML).expect("parses");
        let (registry, groups) = config.resolve().expect("resolves");
        assert_eq!(groups.len(), 2);
        assert_eq!(registry.effective_identity("WeiboNER").expect("known"), "NER");
    }

    #[test]
    fn test_json_round_trip_preserves_config() {
        let config = MultitaskConfig::from_yaml_str(YAML).expect("parses");
        let json = serde_json::to_string(&config).expect("serializes");
        assert_eq!(MultitaskConfig::from_json_str(&json).expect("parses"), config);
    }

    #[test]
    fn test_load_reports_path_on_parse_error() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, "problem: [").expect("write");
        match MultitaskConfig::load(&path).unwrap_err() {
            MultitaskError::Serialization { path: Some(p), .. } => assert_eq!(p, path),
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let err = MultitaskConfig::load("/nonexistent/multitask.yaml").unwrap_err();
        assert!(matches!(err, MultitaskError::Io { .. }));
    }
}
