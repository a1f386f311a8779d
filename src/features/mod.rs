//! Step inputs: the batch view and the encoder representations
//!
//! Both are supplied by external collaborators and only read by heads; the
//! feature-transfer step builds a new [`Representations`] rather than editing
//! the encoder's.

mod batch;
mod hidden;

pub use batch::{
    label_ids_key, loss_multiplier_key, BatchView, Feature, INPUT_MASK, MASKED_LM_IDS,
    MASKED_LM_POSITIONS, MASKED_LM_WEIGHTS,
};
pub use hidden::{Hidden, RepresentationKind, Representations};

pub(crate) use batch::check_leading;
