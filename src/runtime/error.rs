//! Runtime error types.
//!
//! Construction and generation failures never cross the capability boundary
//! as panics: they are converted to data (an initialize outcome or a final
//! error chunk). Release failures are logged and swallowed.

use thiserror::Error;

/// Errors surfaced by the session runtime.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("Model '{0}' is not initialized")]
    UninitializedModel(String),

    #[error("{0}")]
    ConstructionFailure(String),

    #[error("{0}")]
    GenerationFailure(String),

    #[error("Failed to release {resource}: {message}")]
    ResourceRelease {
        resource: &'static str,
        message: String,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Model '{model}' holds a {found} instance, expected {expected}")]
    BackendMismatch {
        model: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("No {0} backend is configured")]
    BackendUnavailable(&'static str),
}

impl RuntimeError {
    /// Returns true if this error should be logged as a warning rather than an error.
    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            Self::UninitializedModel(_) | Self::ResourceRelease { .. }
        )
    }

    /// Returns true if the error is reported to the caller (as an error
    /// chunk or initialize outcome) rather than only logged.
    pub fn is_user_visible(&self) -> bool {
        !matches!(self, Self::ResourceRelease { .. })
    }

    /// Message suitable for a completion sink or final error chunk.
    pub fn user_message(&self) -> String {
        super::sanitize::sanitize_error_message(&self.to_string())
    }
}
