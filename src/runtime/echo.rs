//! Echo test backend.
//!
//! No engine behind it: `initialize` marks the model ready, and a
//! generation echoes the input one character at a time behind a tag
//! derived from the model name. Its pacing and formatting are what the
//! controller's cancellation and cleanup tests are written against.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::model::{BackendKind, ImageInput, Model};
use crate::telemetry;

use super::capability::{check_image_count, LlmRuntime, SessionHandle};
use super::controller::{ChunkProducer, ChunkSink, GenerationController, ResponseChunk};
use super::registry::{CleanupFn, EchoInstance, ModelInstance};
use super::RuntimeError;

/// Appended to the last partial text when a generation is cancelled.
pub const CANCELLED_MARKER: &str = " (Cancelled)";

/// Pacing of echoed output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoConfig {
    /// Delay before each echoed character.
    pub char_delay: Duration,
    /// Pause between the last character and the final chunk.
    pub trailing_pause: Duration,
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            char_delay: Duration::from_millis(20),
            trailing_pause: Duration::from_millis(100),
        }
    }
}

/// Tag every echoed response starts with.
pub fn response_prefix(model_name: &str) -> String {
    format!("[{model_name}] ")
}

/// Identifier returned by `create_session`.
pub fn session_id(model_name: &str) -> String {
    format!("echo-session:{model_name}")
}

fn instance_marker(model_name: &str) -> String {
    format!("echo-instance:{model_name}")
}

/// Token estimate: each whitespace-delimited word costs `len / 4 + 1`.
///
/// An empty string is one empty word and costs 1.
pub fn estimate_tokens(text: &str) -> usize {
    text.split(char::is_whitespace)
        .map(|word| word.chars().count() / 4 + 1)
        .sum()
}

pub struct EchoRuntime {
    config: EchoConfig,
    controller: GenerationController,
}

impl EchoRuntime {
    pub fn new(config: EchoConfig, controller: GenerationController) -> Self {
        Self { config, controller }
    }

    pub fn config(&self) -> &EchoConfig {
        &self.config
    }
}

impl Default for EchoRuntime {
    fn default() -> Self {
        Self::new(EchoConfig::default(), GenerationController::default())
    }
}

#[async_trait]
impl LlmRuntime for EchoRuntime {
    fn kind(&self) -> BackendKind {
        BackendKind::Echo
    }

    async fn initialize(&self, model: &Arc<Model>) -> Result<(), RuntimeError> {
        let previous = model.instance().take();
        if let Some(old) = previous {
            tracing::info!(model = model.name(), "replacing existing instance");
            old.release(model.name(), &self.controller).await;
        }
        let instance = ModelInstance::Echo(EchoInstance::new(instance_marker(model.name())));
        *model.instance() = Some(instance);
        telemetry::record_initialize(BackendKind::Echo.as_str(), true);
        tracing::info!(model = model.name(), "echo model ready");
        Ok(())
    }

    fn create_session(&self, model: &Model) -> Result<SessionHandle, RuntimeError> {
        match model.instance().as_ref() {
            Some(ModelInstance::Echo(echo)) => {
                tracing::debug!(model = model.name(), marker = echo.marker(), "echo session handle");
                Ok(SessionHandle::Echo(session_id(model.name())))
            }
            Some(other) => Err(super::capability::mismatch(model, BackendKind::Echo, other)),
            None => Err(RuntimeError::UninitializedModel(model.name().to_string())),
        }
    }

    fn generate_response(
        &self,
        model: &Arc<Model>,
        text: &str,
        images: &[ImageInput],
        sink: ChunkSink,
        cleanup: CleanupFn,
    ) -> Result<(), RuntimeError> {
        let max_images = model.config().effective_max_images();
        let image_count = images.len();
        let producer = EchoProducer::new(model.name(), text, self.config.clone());
        self.controller.start(model, sink, cleanup, |instance| {
            check_image_count(image_count, max_images)?;
            match instance {
                ModelInstance::Echo(_) => Ok(producer),
                other => Err(super::capability::mismatch(model, BackendKind::Echo, other)),
            }
        })
    }

    async fn reset_session(&self, model: &Model) -> Result<(), RuntimeError> {
        if !model.is_initialized() {
            tracing::warn!(model = model.name(), "reset_session on uninitialized model");
            return Err(RuntimeError::UninitializedModel(model.name().to_string()));
        }
        // Nothing to rebuild; only the in-flight generation goes away.
        self.controller.stop_active(model).await;
        tracing::debug!(model = model.name(), "echo session reset");
        Ok(())
    }

    async fn clean_up(&self, model: &Model) {
        let instance = model.instance().take();
        match instance {
            Some(instance) => {
                instance.release(model.name(), &self.controller).await;
                tracing::info!(model = model.name(), "echo model cleaned up");
            }
            None => tracing::debug!(model = model.name(), "clean_up on uninitialized model"),
        }
    }

    async fn size_in_tokens(&self, model: &Model, text: &str) -> usize {
        if !model.is_initialized() {
            return 0;
        }
        estimate_tokens(text)
    }

    fn cancel_generate_response(&self, model: &Model) -> Result<bool, RuntimeError> {
        self.controller.cancel(model)
    }
}

/// Emits `prefix + input[..i]` for each character, then the full text.
struct EchoProducer {
    pending: std::vec::IntoIter<char>,
    text: String,
    config: EchoConfig,
    finished: bool,
}

impl EchoProducer {
    fn new(model_name: &str, input: &str, config: EchoConfig) -> Self {
        Self {
            pending: input.chars().collect::<Vec<_>>().into_iter(),
            text: response_prefix(model_name),
            config,
            finished: false,
        }
    }
}

#[async_trait]
impl ChunkProducer for EchoProducer {
    async fn prepare(&mut self) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn next_chunk(&mut self) -> Option<Result<ResponseChunk, RuntimeError>> {
        if self.finished {
            return None;
        }
        if !self.pending.as_slice().is_empty() {
            tokio::time::sleep(self.config.char_delay).await;
            self.text.extend(self.pending.next());
            return Some(Ok(ResponseChunk::partial(self.text.clone())));
        }
        tokio::time::sleep(self.config.trailing_pause).await;
        self.finished = true;
        Some(Ok(ResponseChunk::final_text(self.text.clone())))
    }

    async fn cancel(&mut self) -> ResponseChunk {
        self.finished = true;
        ResponseChunk::final_text(format!("{}{}", self.text, CANCELLED_MARKER))
    }
}
