//! Outbound contract to the native inference engine.
//!
//! The engine itself is opaque: given weights and options it produces an
//! engine, and an engine produces sessions that accept query chunks and
//! images and emit a stream of text pieces. Calls are synchronous and may
//! block; the runtime only calls them from blocking threads.

use std::path::PathBuf;
use std::sync::Arc;

use futures::stream::{BoxStream, Stream, StreamExt};
use tokio::sync::mpsc;

use crate::model::{Accelerator, ImageInput, Model, ModelConfig};
use crate::runtime::RuntimeError;

/// Options an engine is built with.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineOptions {
    pub model_path: PathBuf,
    pub max_tokens: u32,
    pub accelerator: Accelerator,
    /// Zero disables the vision modality entirely.
    pub max_num_images: u32,
}

impl EngineOptions {
    pub fn for_model(model: &Model) -> Self {
        let config = model.config();
        Self {
            model_path: model.path().to_path_buf(),
            max_tokens: config.max_tokens,
            accelerator: config.accelerator,
            max_num_images: config.effective_max_images(),
        }
    }
}

/// Sampling parameters a session is built with.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionParams {
    pub top_k: u32,
    pub top_p: f32,
    pub temperature: f32,
    pub vision_enabled: bool,
}

impl SessionParams {
    pub fn from_config(config: &ModelConfig) -> Self {
        Self {
            top_k: config.top_k,
            top_p: config.top_p,
            temperature: config.temperature,
            vision_enabled: config.effective_max_images() > 0,
        }
    }
}

/// Builds engines from model weights.
pub trait EngineFactory: Send + Sync {
    fn create_engine(
        &self,
        options: &EngineOptions,
    ) -> Result<Arc<dyn InferenceEngine>, RuntimeError>;
}

/// A loaded engine. Expensive to build, owned by one model's registry entry.
pub trait InferenceEngine: Send + Sync {
    fn create_session(
        &self,
        params: &SessionParams,
    ) -> Result<Box<dyn InferenceSession>, RuntimeError>;

    fn close(&self) -> Result<(), RuntimeError>;
}

/// A mutable generation context bound to an engine.
pub trait InferenceSession: Send {
    fn add_query_chunk(&mut self, text: &str) -> Result<(), RuntimeError>;

    fn add_image(&mut self, image: &ImageInput) -> Result<(), RuntimeError>;

    /// Start generating over everything added so far.
    fn generate_async(&mut self) -> Result<SessionStream, RuntimeError>;

    /// Ask the engine to stop the running generation. Best effort: a step
    /// already executing is not interrupted.
    fn cancel_async(&mut self) -> Result<(), RuntimeError>;

    fn size_in_tokens(&self, text: &str) -> Result<usize, RuntimeError>;

    fn close(&mut self) -> Result<(), RuntimeError>;
}

/// A single piece of engine output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutput {
    pub text: String,
    pub done: bool,
}

type OutputItem = Result<SessionOutput, RuntimeError>;

/// Ordered stream of engine output for one generation.
pub struct SessionStream {
    inner: BoxStream<'static, OutputItem>,
}

impl SessionStream {
    /// Create a stream fed through a bounded channel, for engines that
    /// deliver output through callbacks.
    pub fn channel(buffer_size: usize) -> (SessionStreamSender, Self) {
        let (sender, receiver) = mpsc::channel(buffer_size.max(1));
        let inner = futures::stream::unfold(receiver, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed();
        (SessionStreamSender { sender }, Self { inner })
    }

    /// Wrap any stream of engine output.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = OutputItem> + Send + 'static,
    {
        Self { inner: stream.boxed() }
    }

    /// Receive the next piece, if the engine produced one.
    pub async fn next(&mut self) -> Option<OutputItem> {
        self.inner.next().await
    }
}

/// Sender half for pushing engine output into a `SessionStream`.
#[derive(Clone)]
pub struct SessionStreamSender {
    sender: mpsc::Sender<OutputItem>,
}

impl SessionStreamSender {
    pub async fn send(&self, text: impl Into<String>, done: bool) -> Result<(), StreamSendError> {
        let output = SessionOutput { text: text.into(), done };
        self.sender.send(Ok(output)).await.map_err(|_| StreamSendError)
    }

    /// Send from an engine callback thread outside the async runtime.
    pub fn blocking_send(&self, text: impl Into<String>, done: bool) -> Result<(), StreamSendError> {
        let output = SessionOutput { text: text.into(), done };
        self.sender.blocking_send(Ok(output)).map_err(|_| StreamSendError)
    }

    pub async fn fail(&self, error: RuntimeError) -> Result<(), StreamSendError> {
        self.sender.send(Err(error)).await.map_err(|_| StreamSendError)
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

#[derive(Debug)]
pub struct StreamSendError;

impl std::fmt::Display for StreamSendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session stream closed")
    }
}

impl std::error::Error for StreamSendError {}
