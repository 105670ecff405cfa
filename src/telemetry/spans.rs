//! Span factory for generation tasks.

use tracing::{debug_span, Span};

/// Factory for the span wrapping one generation task.
pub struct GenerationSpan;

impl GenerationSpan {
    /// Fields:
    /// - `model`: model name
    /// - `generation`: per-model generation id
    /// - `outcome`: filled in when the generation ends
    /// - `chunks`: number of chunks delivered, filled in at the end
    pub fn new(model: &str, generation: u64) -> Span {
        debug_span!(
            "generation",
            model = %model,
            generation,
            outcome = tracing::field::Empty,
            chunks = tracing::field::Empty,
        )
    }
}
