//! Contract every backend fulfils.
//!
//! All operations take the model by reference and mutate only its instance
//! slot. Construction and generation failures come back as data; nothing
//! here panics on a backend error.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::model::{BackendKind, ImageInput, Model};

use super::controller::ChunkSink;
use super::registry::{CleanupFn, ModelInstance, SessionCell};
use super::RuntimeError;

/// The current session of an initialized model, for callers that drive it
/// directly (benchmarks, diagnostics).
#[derive(Clone)]
pub enum SessionHandle {
    Native(SessionCell),
    /// Deterministic identifier derived from the model name.
    Echo(String),
}

impl SessionHandle {
    /// Echo session identifier, if this is an echo session.
    pub fn echo_id(&self) -> Option<&str> {
        match self {
            Self::Echo(id) => Some(id),
            Self::Native(_) => None,
        }
    }

    pub fn native(&self) -> Option<&SessionCell> {
        match self {
            Self::Native(cell) => Some(cell),
            Self::Echo(_) => None,
        }
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Native(_) => f.write_str("SessionHandle::Native(..)"),
            Self::Echo(id) => f.debug_tuple("SessionHandle::Echo").field(id).finish(),
        }
    }
}

/// Runtime capability implemented by each backend.
#[async_trait]
pub trait LlmRuntime: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Build the engine and initial session and store them in the model's
    /// instance slot. On failure the slot is left empty and the error
    /// carries a sanitized message.
    async fn initialize(&self, model: &Arc<Model>) -> Result<(), RuntimeError>;

    fn create_session(&self, model: &Model) -> Result<SessionHandle, RuntimeError>;

    /// Start a streaming generation. Chunks go to `sink` from the
    /// generation task; `cleanup` runs exactly once when it ends. When the
    /// model is not initialized, `sink` gets an error chunk and `cleanup`
    /// runs before this returns.
    fn generate_response(
        &self,
        model: &Arc<Model>,
        text: &str,
        images: &[ImageInput],
        sink: ChunkSink,
        cleanup: CleanupFn,
    ) -> Result<(), RuntimeError>;

    /// Replace the session with a fresh one built from the current config.
    async fn reset_session(&self, model: &Model) -> Result<(), RuntimeError>;

    /// Release session and engine, fire any pending cleanup, clear the slot.
    /// Safe to call on an uninitialized model.
    async fn clean_up(&self, model: &Model);

    /// Token estimate for `text`; 0 when uninitialized or on failure.
    async fn size_in_tokens(&self, model: &Model, text: &str) -> usize;

    /// Returns whether a generation was in flight.
    fn cancel_generate_response(&self, model: &Model) -> Result<bool, RuntimeError>;
}

/// Reject requests carrying more images than the model accepts.
pub(crate) fn check_image_count(count: usize, max: u32) -> Result<(), RuntimeError> {
    if count > max as usize {
        return Err(RuntimeError::GenerationFailure(format!(
            "{count} images attached, model accepts at most {max}"
        )));
    }
    Ok(())
}

/// Error for an instance slot holding another backend's shape.
///
/// Must not lock the instance slot: callers already hold it.
pub(crate) fn mismatch(model: &Model, expected: BackendKind, found: &ModelInstance) -> RuntimeError {
    RuntimeError::BackendMismatch {
        model: model.name().to_string(),
        expected: expected.as_str(),
        found: found.kind().as_str(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_limit_is_inclusive() {
        assert!(check_image_count(0, 0).is_ok());
        assert!(check_image_count(2, 2).is_ok());
        assert!(matches!(
            check_image_count(3, 2),
            Err(RuntimeError::GenerationFailure(_))
        ));
    }

    #[test]
    fn echo_handle_exposes_id() {
        let handle = SessionHandle::Echo("echo-session:m".into());
        assert_eq!(handle.echo_id(), Some("echo-session:m"));
        assert!(handle.native().is_none());
    }
}
