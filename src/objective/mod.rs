//! Combining per-task head outputs into one objective
//!
//! [`ObjectiveComposer`] runs the heads of a joint group and sums their
//! losses (TRAIN), merges their metrics (EVAL) or collects their decoded
//! outputs (PREDICT).

mod composer;

pub use composer::{CombinedResult, ObjectiveComposer, AUGMENT_MASK_LM, AUGMENT_NAMESPACE};
