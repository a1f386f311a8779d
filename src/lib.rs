//! Multitarea: multi-task head composition and training objectives
//!
//! One shared text encoder, many task heads. This crate resolves which tasks
//! train together and which share output layers, builds the loss, metric and
//! decoding computation of every task kind, and combines simultaneous losses
//! into one objective.
//!
//! # Architecture
//!
//! - `problem`: task registry, head-sharing resolution, grouping expressions
//! - `features`: batch fields and encoder representations
//! - `head`: sequence tagging (CRF), classification, masked LM, pretraining,
//!   feature transfer, and the identity-keyed head store
//! - `objective`: per-group composition and the training step
//! - `autograd` / `optim`: the tensor graph and optimizers the heads train with
//! - `config`: YAML/JSON configuration and run planning
//!
//! # Example
//!
//! ```no_run
//! use multitarea::config::MultitaskConfig;
//! use multitarea::objective::ObjectiveComposer;
//!
//! let config = MultitaskConfig::load("multitask.yaml")?;
//! let composer = ObjectiveComposer::from_config(&config)?;
//! for group in composer.groups().groups() {
//!     println!("{}", group.stable_id());
//! }
//! # Ok::<(), multitarea::MultitaskError>(())
//! ```

pub mod autograd;
pub mod config;
pub mod error;
pub mod features;
pub mod head;
pub mod objective;
pub mod optim;
pub mod problem;

pub use autograd::Tensor;
pub use error::{MultitaskError, Result};
pub use head::{Head, HeadStore, Mode, Prediction};
pub use objective::{CombinedResult, ObjectiveComposer};
pub use problem::{GroupSequence, JointGroup, ProblemGroupResolver, ProblemKind, ProblemRegistry};
