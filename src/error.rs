//! Error types for multi-task configuration and head computation
//!
//! Configuration-time errors (unknown tasks, share cycles, empty grouping
//! expressions) are fatal. Shape errors surface at the first step that sees them.

use std::path::PathBuf;
use thiserror::Error;

/// Result type for multitarea operations
pub type Result<T> = std::result::Result<T, MultitaskError>;

/// Errors raised while resolving a multi-task configuration or running a head
#[derive(Debug, Error)]
pub enum MultitaskError {
    /// A task named in a grouping expression or a share link is not registered
    #[error("Unknown task: '{name}'\n  → Register it under `problems` in the config")]
    UnknownTask { name: String },

    /// Grouping expression (or one of its chunks / task names) is empty
    #[error("Empty grouping expression: {detail}\n  → Use the form 'A&B|C'")]
    EmptyExpression { detail: String },

    /// Following `share_top` links does not terminate
    #[error("Cyclic head sharing: {}", chain.join(" -> "))]
    CyclicShare { chain: Vec<String> },

    /// A batch field or representation has an unexpected shape
    #[error("Shape mismatch for {field}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        field: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// A batch field or representation the head needs is absent
    #[error("Missing feature: '{name}'")]
    MissingFeature { name: String },

    /// Configuration value is out of range
    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidConfig { field: String, message: String },

    /// IO error with context
    #[error("IO error: {context}\n  Cause: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Serialization/deserialization error
    #[error("Serialization error in {path:?}: {message}")]
    Serialization {
        path: Option<PathBuf>,
        message: String,
    },
}

impl MultitaskError {
    /// Create an unknown-task error
    pub fn unknown_task(name: impl Into<String>) -> Self {
        Self::UnknownTask { name: name.into() }
    }

    /// Create a shape mismatch error
    pub fn shape(field: impl Into<String>, expected: Vec<usize>, actual: Vec<usize>) -> Self {
        Self::ShapeMismatch {
            field: field.into(),
            expected,
            actual,
        }
    }

    /// Create a missing-feature error
    pub fn missing(name: impl Into<String>) -> Self {
        Self::MissingFeature { name: name.into() }
    }

    /// Create an invalid-config error
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Check if this error comes from configuration resolution
    ///
    /// These are never recovered: a run must not start with a partially valid
    /// group sequence.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownTask { .. }
                | Self::EmptyExpression { .. }
                | Self::CyclicShare { .. }
                | Self::InvalidConfig { .. }
        )
    }
}
