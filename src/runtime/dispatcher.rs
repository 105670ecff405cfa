//! Routes capability calls to the backend named by each model.
//!
//! Holds one runtime per backend kind. Uninitialized use is caught here
//! before any backend sees the call: it is logged as a warning and reported
//! through the operation's usual failure channel.

use std::sync::Arc;

use crate::config::RuntimeConfig;
use crate::model::{BackendKind, ImageInput, Model};

use super::capability::{LlmRuntime, SessionHandle};
use super::controller::{
    reject, ChunkSink, GenerationController, GenerationOutcome, GenerationState,
};
use super::echo::EchoRuntime;
use super::engine::EngineFactory;
use super::native::NativeRuntime;
use super::registry::{CleanupFn, CleanupOnce};
use super::RuntimeError;

pub struct RuntimeDispatcher {
    echo: EchoRuntime,
    native: Option<NativeRuntime>,
    controller: GenerationController,
}

impl RuntimeDispatcher {
    /// Dispatcher with only the echo backend available.
    pub fn new(config: &RuntimeConfig) -> Self {
        let controller = GenerationController::new(config.cleanup_grace);
        Self {
            echo: EchoRuntime::new(config.echo.clone(), controller.clone()),
            native: None,
            controller,
        }
    }

    /// Dispatcher that builds native models through `factory`.
    pub fn with_engine_factory(config: &RuntimeConfig, factory: Arc<dyn EngineFactory>) -> Self {
        let mut dispatcher = Self::new(config);
        dispatcher.native = Some(NativeRuntime::new(factory, dispatcher.controller.clone()));
        dispatcher
    }

    /// Runtime serving `kind`.
    pub fn runtime_for(&self, kind: BackendKind) -> Result<&dyn LlmRuntime, RuntimeError> {
        match kind {
            BackendKind::Echo => Ok(&self.echo as &dyn LlmRuntime),
            BackendKind::Native => self
                .native
                .as_ref()
                .map(|native| native as &dyn LlmRuntime)
                .ok_or(RuntimeError::BackendUnavailable(BackendKind::Native.as_str())),
        }
    }

    fn ensure_initialized(&self, model: &Model, operation: &str) -> Result<(), RuntimeError> {
        if model.is_initialized() {
            return Ok(());
        }
        tracing::warn!(model = model.name(), operation, "model is not initialized");
        Err(RuntimeError::UninitializedModel(model.name().to_string()))
    }

    pub async fn initialize(&self, model: &Arc<Model>) -> Result<(), RuntimeError> {
        let runtime = self.runtime_for(model.backend())?;
        tracing::info!(model = model.name(), backend = %model.backend(), "initializing");
        runtime.initialize(model).await
    }

    /// Initialize and report through a completion sink: `""` on success,
    /// the sanitized error message otherwise.
    pub async fn initialize_with<F>(&self, model: &Arc<Model>, on_done: F)
    where
        F: FnOnce(String),
    {
        match self.initialize(model).await {
            Ok(()) => on_done(String::new()),
            Err(err) => on_done(err.user_message()),
        }
    }

    pub fn create_session(&self, model: &Model) -> Result<SessionHandle, RuntimeError> {
        self.ensure_initialized(model, "create_session")?;
        self.runtime_for(model.backend())?.create_session(model)
    }

    /// Start a streaming generation; see [`LlmRuntime::generate_response`].
    pub fn generate_response(
        &self,
        model: &Arc<Model>,
        text: &str,
        images: &[ImageInput],
        sink: ChunkSink,
        cleanup: CleanupFn,
    ) -> Result<(), RuntimeError> {
        let runtime = match self.runtime_for(model.backend()) {
            Ok(runtime) => runtime,
            Err(err) => return Err(reject(model.name(), sink, &CleanupOnce::new(cleanup), err)),
        };
        runtime.generate_response(model, text, images, sink, cleanup)
    }

    pub async fn reset_session(&self, model: &Model) -> Result<(), RuntimeError> {
        self.ensure_initialized(model, "reset_session")?;
        self.runtime_for(model.backend())?.reset_session(model).await
    }

    pub async fn clean_up(&self, model: &Model) {
        match self.runtime_for(model.backend()) {
            Ok(runtime) => runtime.clean_up(model).await,
            Err(err) => tracing::warn!(model = model.name(), error = %err, "clean_up skipped"),
        }
    }

    pub async fn size_in_tokens(&self, model: &Model, text: &str) -> usize {
        if self.ensure_initialized(model, "size_in_tokens").is_err() {
            return 0;
        }
        match self.runtime_for(model.backend()) {
            Ok(runtime) => runtime.size_in_tokens(model, text).await,
            Err(_) => 0,
        }
    }

    /// Request cancellation; returns whether a generation was in flight.
    pub fn cancel_generate_response(&self, model: &Model) -> Result<bool, RuntimeError> {
        self.ensure_initialized(model, "cancel_generate_response")?;
        self.runtime_for(model.backend())?.cancel_generate_response(model)
    }

    pub fn generation_state(&self, model: &Model) -> GenerationState {
        self.controller.state(model)
    }

    pub fn last_outcome(&self, model: &Model) -> Option<GenerationOutcome> {
        self.controller.last_outcome(model)
    }
}

impl Default for RuntimeDispatcher {
    fn default() -> Self {
        Self::new(&RuntimeConfig::default())
    }
}
