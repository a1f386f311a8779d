//! Configuration validation logic
//!
//! Validates a multi-task configuration before any step runs.

use super::schema::MultitaskConfig;
use crate::error::{MultitaskError, Result};

/// Validate a multi-task configuration
///
/// Checks:
/// - Hyper-parameters are in range
/// - Every problem has at least one class and a non-empty mask
/// - Share links resolve without cycles, to a head of the same kind and width
/// - The grouping expression names only registered problems
pub fn validate_config(config: &MultitaskConfig) -> Result<()> {
    config.head.validate()?;

    for (name, spec) in &config.problems {
        if spec.num_classes == 0 {
            return Err(MultitaskError::invalid(
                format!("problems.{name}.num_classes"),
                "must be > 0",
            ));
        }
        if let Some(mask) = &spec.class_mask {
            if mask.is_empty() {
                return Err(MultitaskError::invalid(
                    format!("problems.{name}.class_mask"),
                    "must not be empty",
                ));
            }
        }
    }

    if config.training.batch_size == 0 {
        return Err(MultitaskError::invalid("training.batch_size", "must be > 0"));
    }

    // Unknown or incompatible share targets, cycles, unknown or empty grouping entries
    config.resolve()?;

    Ok(())
}
