//! Run planning: checkpoint naming, step counts and group weights

use super::schema::{BalanceType, MultitaskConfig};
use super::validate::validate_config;
use crate::error::{MultitaskError, Result};
use crate::problem::{GroupSequence, ProblemKind, ProblemRegistry};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Everything derived from a configuration before the first step
#[derive(Debug, Clone)]
pub struct RunPlan {
    /// Resolved grouping expression
    pub groups: GroupSequence,
    /// Task registry
    pub registry: ProblemRegistry,
    /// `<base>/<sorted task names>_ckpt` unless overridden
    pub ckpt_dir: PathBuf,
    /// Total training examples over every resolved task
    pub data_num: u64,
    /// Optimizer steps for the whole run
    pub train_steps: u64,
    /// Linear-warmup steps (10% of `train_steps`)
    pub warmup_steps: u64,
    /// Learning rate scaled linearly with the device count
    pub lr: f32,
    /// Sampling weight per joint group, summing to 1
    pub group_weights: Vec<f64>,
}

impl RunPlan {
    /// Validate `config` and derive the plan for `gpus` devices
    pub fn new(
        config: &MultitaskConfig,
        gpus: usize,
        base_dir: Option<&Path>,
        dir_name: Option<&str>,
    ) -> Result<Self> {
        validate_config(config)?;
        if gpus == 0 {
            return Err(MultitaskError::invalid("gpus", "must be > 0"));
        }
        let (registry, groups) = config.resolve()?;

        let dir_name = dir_name.map_or_else(|| format!("{}_ckpt", groups.stable_id()), str::to_string);
        let ckpt_dir = base_dir.unwrap_or_else(|| Path::new("tmp")).join(dir_name);

        let count = |task: &str| config.training.data_num.get(task).copied().unwrap_or(0);
        let data_num: u64 = groups.all_tasks().into_iter().map(count).sum();

        let mut has_pretrain = false;
        for task in groups.all_tasks() {
            has_pretrain |= registry.get(task)?.kind == ProblemKind::Pretrain;
        }
        let dup = if has_pretrain { config.training.dupe_factor as u64 } else { 1 };

        let training = &config.training;
        let denom = (training.batch_size * gpus) as u64;
        let train_steps = data_num * training.train_epoch as u64 * dup / denom;
        let warmup_steps = train_steps / 10;
        let lr = training.init_lr * gpus as f32;

        let group_counts: Vec<u64> = groups
            .groups()
            .iter()
            .map(|g| g.tasks().iter().map(|t| count(t)).sum())
            .collect();
        let group_weights = balance_weights(&group_counts, training.multitask_balance_type);

        tracing::info!(
            ckpt_dir = %ckpt_dir.display(),
            data_num,
            train_steps,
            warmup_steps,
            lr,
            "planned multi-task run"
        );

        Ok(Self {
            groups,
            registry,
            ckpt_dir,
            data_num,
            train_steps,
            warmup_steps,
            lr,
            group_weights,
        })
    }

    /// Parameters that must survive a restore, as JSON
    pub fn to_json(&self, config: &MultitaskConfig) -> Result<String> {
        let params = RunParams {
            config: config.clone(),
            groups: self.groups.clone(),
        };
        serde_json::to_string_pretty(&params).map_err(|e| MultitaskError::Serialization {
            path: None,
            message: e.to_string(),
        })
    }

    /// Write `params.json` into `ckpt_dir`, creating it if needed
    pub fn save_params(&self, config: &MultitaskConfig) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.ckpt_dir)
            .map_err(|e| MultitaskError::io(format!("creating {}", self.ckpt_dir.display()), e))?;
        let path = self.ckpt_dir.join("params.json");
        std::fs::write(&path, self.to_json(config)?)
            .map_err(|e| MultitaskError::io(format!("writing {}", path.display()), e))?;
        Ok(path)
    }
}

/// Dumped run parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunParams {
    /// Configuration the run started from
    pub config: MultitaskConfig,
    /// Groups resolved at start
    pub groups: GroupSequence,
}

impl RunParams {
    /// Parse dumped parameters
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| MultitaskError::Serialization {
            path: None,
            message: e.to_string(),
        })
    }

    /// Load `params.json`
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| MultitaskError::io(format!("reading {}", path.display()), e))?;
        Self::from_json(&text)
    }
}

fn balance_weights(counts: &[u64], balance: BalanceType) -> Vec<f64> {
    let n = counts.len();
    if n == 0 {
        return Vec::new();
    }
    let total: u64 = counts.iter().sum();
    match balance {
        BalanceType::DataBalanced if total > 0 => {
            counts.iter().map(|&c| c as f64 / total as f64).collect()
        }
        _ => vec![1.0 / n as f64; n],
    }
}
