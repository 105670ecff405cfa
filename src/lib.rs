//! On-device LLM session runtime
//!
//! Lifecycle and streaming generation for locally executed language models.
//! The inference engine itself is an outside collaborator behind the
//! `EngineFactory` / `InferenceEngine` / `InferenceSession` traits; this
//! crate owns everything around it.
//!
//! # Responsibilities
//!
//! - **Lifecycle**: build an engine and session per model, reset, release
//! - **Streaming**: one generation per model, chunks delivered in order,
//!   exactly one final chunk and one cleanup call per generation
//! - **Cancellation**: cooperative, observed between chunks
//! - **Errors as data**: sanitized messages, never panics across the API
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ondevice_runtime::{
//!     BackendKind, Model, ModelConfig, ResponseChunk, RuntimeConfig, RuntimeDispatcher,
//! };
//!
//! # async fn demo() -> Result<(), ondevice_runtime::RuntimeError> {
//! let dispatcher = RuntimeDispatcher::new(&RuntimeConfig::default());
//! let model = Arc::new(Model::new("tiny", BackendKind::Echo, ModelConfig::default()));
//! dispatcher.initialize(&model).await?;
//! dispatcher.generate_response(
//!     &model,
//!     "hello",
//!     &[],
//!     Box::new(|chunk: ResponseChunk| print!("\r{}", chunk.text)),
//!     Box::new(|| println!()),
//! )?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod model;
pub mod runtime;
pub mod telemetry;

pub use config::RuntimeConfig;
pub use model::{Accelerator, BackendKind, ImageInput, Model, ModelConfig};
pub use runtime::{
    ChunkSink, CleanupFn, GenerationOutcome, GenerationState, LlmRuntime, ResponseChunk,
    RuntimeDispatcher, RuntimeError, SessionHandle,
};
