//! Task metadata and grouping
//!
//! - [`ProblemRegistry`]: name → kind, cardinality and head-sharing link
//! - [`ProblemGroupResolver`]: `"A&B|C"` → ordered [`GroupSequence`]

mod registry;
mod resolver;

pub use registry::{Problem, ProblemKind, ProblemRegistry};
pub use resolver::{GroupSequence, JointGroup, ProblemGroupResolver};
