//! Session runtime: lifecycle and streaming generation for on-device models.
//!
//! Backends implement `LlmRuntime`; the `RuntimeDispatcher` picks one per
//! model. Generations run as tokio tasks driven by the `GenerationController`.

pub mod capability;
pub mod controller;
pub mod dispatcher;
pub mod echo;
pub mod engine;
pub mod error;
pub mod native;
pub(crate) mod registry;
pub mod sanitize;

pub use capability::{LlmRuntime, SessionHandle};
pub use controller::{
    ChunkSink, GenerationController, GenerationOutcome, GenerationState, ResponseChunk,
    DEFAULT_CLEANUP_GRACE,
};
pub use dispatcher::RuntimeDispatcher;
pub use echo::{estimate_tokens, EchoConfig, EchoRuntime, CANCELLED_MARKER};
pub use engine::{
    EngineFactory, EngineOptions, InferenceEngine, InferenceSession, SessionOutput,
    SessionParams, SessionStream, SessionStreamSender, StreamSendError,
};
pub use error::RuntimeError;
pub use native::NativeRuntime;
pub use registry::{CleanupFn, CleanupOnce, InstanceKind, SessionCell};
pub use sanitize::{sanitize_error_message, UNKNOWN_ERROR};
