//! Declarative configuration for multi-task runs
//!
//! Problem definitions, head hyper-parameters and the grouping expression are
//! read once at process start and are immutable afterwards.

mod plan;
mod schema;
mod validate;

pub use plan::{RunParams, RunPlan};
pub use schema::{
    Activation, BalanceType, HeadParams, MultitaskConfig, ProblemSpec, TrainingParams,
};
pub use validate::validate_config;
