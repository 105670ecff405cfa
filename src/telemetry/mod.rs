//! Telemetry for the session runtime.
//!
//! Structured logging through `tracing`, one span per generation, and
//! counters through the `metrics` facade. The library never installs a
//! metrics exporter; the embedding application decides where they go.

mod logging;
mod metrics;
mod spans;

pub use logging::{init_logging, LogConfig, LogError, LogFormat};
pub use self::metrics::{
    record_generation_finished, record_generation_started, record_initialize,
    GENERATION_DURATION, GENERATION_FINISHED, GENERATION_STARTED, INITIALIZE_TOTAL,
};
pub use spans::GenerationSpan;
