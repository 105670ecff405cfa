//! Engine-backed runtime.
//!
//! Builds one engine and one session per model through an `EngineFactory`
//! and streams generations from the session. Engine and session calls are
//! blocking, so they run on the blocking pool.

use std::sync::Arc;

use async_trait::async_trait;

use crate::model::{BackendKind, ImageInput, Model};
use crate::telemetry;

use super::capability::{check_image_count, mismatch, LlmRuntime, SessionHandle};
use super::controller::{
    ChunkProducer, ChunkSink, GenerationController, GenerationState, ResponseChunk,
};
use super::engine::{
    EngineFactory, EngineOptions, InferenceEngine, InferenceSession, SessionParams, SessionStream,
};
use super::registry::{CleanupFn, ModelInstance, NativeInstance, SessionCell};
use super::RuntimeError;

pub struct NativeRuntime {
    factory: Arc<dyn EngineFactory>,
    controller: GenerationController,
}

impl NativeRuntime {
    pub fn new(factory: Arc<dyn EngineFactory>, controller: GenerationController) -> Self {
        Self { factory, controller }
    }

    /// Engine and session of an initialized native model.
    fn parts(&self, model: &Model) -> Result<(Arc<dyn InferenceEngine>, SessionCell), RuntimeError> {
        match model.instance().as_ref() {
            Some(ModelInstance::Native(native)) => Ok((native.engine.clone(), native.session.clone())),
            Some(other) => Err(mismatch(model, BackendKind::Native, other)),
            None => Err(RuntimeError::UninitializedModel(model.name().to_string())),
        }
    }

    /// Tear the model down after a failed session rebuild, unless someone
    /// already replaced the instance.
    async fn discard_after_failed_reset(&self, model: &Model, session: &SessionCell) {
        let taken = {
            let mut slot = model.instance();
            let same = matches!(
                slot.as_ref(),
                Some(ModelInstance::Native(native)) if Arc::ptr_eq(&native.session, session)
            );
            if same {
                slot.take()
            } else {
                None
            }
        };
        if let Some(instance) = taken {
            instance.release(model.name(), &self.controller).await;
        }
    }
}

fn build_instance(
    factory: &dyn EngineFactory,
    options: &EngineOptions,
    params: &SessionParams,
) -> Result<NativeInstance, RuntimeError> {
    let engine = factory.create_engine(options)?;
    match engine.create_session(params) {
        Ok(session) => Ok(NativeInstance::new(engine, session)),
        Err(err) => {
            if let Err(close_err) = engine.close() {
                tracing::warn!(error = %close_err, "failed to close engine after session error");
            }
            Err(err)
        }
    }
}

/// Run a blocking call against the open session on the blocking pool,
/// holding the session lock for its duration.
async fn with_session<T, F>(cell: &SessionCell, call: F) -> Result<T, RuntimeError>
where
    T: Send + 'static,
    F: FnOnce(&mut Box<dyn InferenceSession>) -> Result<T, RuntimeError> + Send + 'static,
{
    let mut guard = cell.clone().lock_owned().await;
    tokio::task::spawn_blocking(move || match guard.as_mut() {
        Some(session) => call(session),
        None => Err(RuntimeError::GenerationFailure("session is closed".into())),
    })
    .await
    .unwrap_or_else(|join_err| {
        Err(RuntimeError::GenerationFailure(format!("session call aborted: {join_err}")))
    })
}

fn construction_failure(err: RuntimeError) -> RuntimeError {
    match err {
        RuntimeError::InvalidConfig(_) => err,
        other => RuntimeError::ConstructionFailure(other.user_message()),
    }
}

#[async_trait]
impl LlmRuntime for NativeRuntime {
    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    async fn initialize(&self, model: &Arc<Model>) -> Result<(), RuntimeError> {
        if model.is_initialized() {
            tracing::info!(model = model.name(), "re-initializing, releasing current instance");
            self.clean_up(model).await;
        }

        let config = model.config();
        let result = match config.validate() {
            Err(err) => Err(err),
            Ok(()) => {
                let factory = self.factory.clone();
                let options = EngineOptions::for_model(model);
                let params = SessionParams::from_config(&config);
                tracing::debug!(model = model.name(), ?options, ?params, "building engine");
                tokio::task::spawn_blocking(move || build_instance(factory.as_ref(), &options, &params))
                    .await
                    .unwrap_or_else(|join_err| {
                        Err(RuntimeError::ConstructionFailure(format!(
                            "engine construction aborted: {join_err}"
                        )))
                    })
            }
        };

        match result {
            Ok(instance) => {
                let replaced = model.instance().replace(ModelInstance::Native(instance));
                if let Some(old) = replaced {
                    old.release(model.name(), &self.controller).await;
                }
                telemetry::record_initialize(BackendKind::Native.as_str(), true);
                tracing::info!(model = model.name(), "engine and session ready");
                Ok(())
            }
            Err(err) => {
                let err = construction_failure(err);
                telemetry::record_initialize(BackendKind::Native.as_str(), false);
                tracing::error!(model = model.name(), error = %err, "initialize failed");
                Err(err)
            }
        }
    }

    fn create_session(&self, model: &Model) -> Result<SessionHandle, RuntimeError> {
        self.parts(model).map(|(_, session)| SessionHandle::Native(session))
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
        let text = text.to_string();
        let images = images.to_vec();
        self.controller.start(model, sink, cleanup, move |instance| {
            check_image_count(images.len(), max_images)?;
            match instance {
                ModelInstance::Native(native) => {
                    Ok(NativeProducer::new(native.session.clone(), text, images))
                }
                other => Err(mismatch(model, BackendKind::Native, other)),
            }
        })
    }

    async fn reset_session(&self, model: &Model) -> Result<(), RuntimeError> {
        let (engine, session) = match self.parts(model) {
            Ok(parts) => parts,
            Err(err) => {
                tracing::warn!(model = model.name(), error = %err, "reset_session skipped");
                return Err(err);
            }
        };

        // Stop until idle with the session lock held: a generation started
        // while the previous one was stopping may be feeding the old session.
        let mut current = loop {
            self.controller.stop_active(model).await;
            let guard = session.lock().await;
            if self.controller.state(model) == GenerationState::Idle {
                break guard;
            }
            drop(guard);
            tracing::debug!(model = model.name(), "generation started during reset, stopping it");
        };

        let params = SessionParams::from_config(&model.config());
        if let Some(mut old) = current.take() {
            if let Err(err) = old.close() {
                tracing::warn!(model = model.name(), error = %err, "failed to close old session");
            }
        }

        let rebuilt = tokio::task::spawn_blocking(move || engine.create_session(&params))
            .await
            .unwrap_or_else(|join_err| {
                Err(RuntimeError::ConstructionFailure(format!(
                    "session construction aborted: {join_err}"
                )))
            });

        match rebuilt {
            Ok(fresh) => {
                *current = Some(fresh);
                tracing::info!(model = model.name(), "session reset");
                Ok(())
            }
            Err(err) => {
                drop(current);
                let err = construction_failure(err);
                tracing::error!(model = model.name(), error = %err, "session rebuild failed, releasing model");
                self.discard_after_failed_reset(model, &session).await;
                Err(err)
            }
        }
    }

    async fn clean_up(&self, model: &Model) {
        let instance = model.instance().take();
        match instance {
            Some(instance) => {
                instance.release(model.name(), &self.controller).await;
                tracing::info!(model = model.name(), "engine and session released");
            }
            None => tracing::debug!(model = model.name(), "clean_up on uninitialized model"),
        }
    }

    async fn size_in_tokens(&self, model: &Model, text: &str) -> usize {
        let Ok((_, session)) = self.parts(model) else {
            return 0;
        };
        let text = text.to_string();
        match with_session(&session, move |session| session.size_in_tokens(&text)).await {
            Ok(count) => count,
            Err(err) => {
                tracing::warn!(model = model.name(), error = %err, "token estimate failed");
                0
            }
        }
    }

    fn cancel_generate_response(&self, model: &Model) -> Result<bool, RuntimeError> {
        self.controller.cancel(model)
    }
}

/// Feeds one request into the session and relays its output.
struct NativeProducer {
    session: SessionCell,
    text: String,
    images: Vec<ImageInput>,
    /// Set once input may have reached the session.
    fed: bool,
    stream: Option<SessionStream>,
}

impl NativeProducer {
    fn new(session: SessionCell, text: String, images: Vec<ImageInput>) -> Self {
        Self { session, text, images, fed: false, stream: None }
    }
}

#[async_trait]
impl ChunkProducer for NativeProducer {
    async fn prepare(&mut self) -> Result<(), RuntimeError> {
        self.fed = true;
        let text = std::mem::take(&mut self.text);
        let images = std::mem::take(&mut self.images);
        let stream = with_session(&self.session, move |session| {
            if !text.trim().is_empty() {
                session.add_query_chunk(&text)?;
            }
            for image in &images {
                session.add_image(image)?;
            }
            session.generate_async()
        })
        .await?;
        self.stream = Some(stream);
        Ok(())
    }

    async fn next_chunk(&mut self) -> Option<Result<ResponseChunk, RuntimeError>> {
        let output = self.stream.as_mut()?.next().await?;
        Some(output.map(|out| ResponseChunk {
            text: out.text,
            done: out.done,
            error: None,
        }))
    }

    async fn cancel(&mut self) -> ResponseChunk {
        self.stream = None;
        if self.fed {
            if let Err(err) = with_session(&self.session, |session| session.cancel_async()).await {
                tracing::warn!(error = %err, "engine rejected cancellation");
            }
        }
        ResponseChunk::final_text(String::new())
    }
}
