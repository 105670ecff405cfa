//! Generation and lifecycle counters.

use std::time::Duration;

use crate::runtime::GenerationOutcome;

pub const GENERATION_STARTED: &str = "ondevice_generation_started_total";
pub const GENERATION_FINISHED: &str = "ondevice_generation_finished_total";
pub const GENERATION_DURATION: &str = "ondevice_generation_duration_seconds";
pub const INITIALIZE_TOTAL: &str = "ondevice_initialize_total";

pub fn record_generation_started(model: &str) {
    metrics::counter!(GENERATION_STARTED, "model" => model.to_string()).increment(1);
}

pub fn record_generation_finished(model: &str, outcome: GenerationOutcome, elapsed: Duration) {
    metrics::counter!(
        GENERATION_FINISHED,
        "model" => model.to_string(),
        "outcome" => outcome.as_str()
    )
    .increment(1);
    metrics::histogram!(GENERATION_DURATION, "model" => model.to_string())
        .record(elapsed.as_secs_f64());
}

pub fn record_initialize(backend: &'static str, success: bool) {
    let result = if success { "ok" } else { "error" };
    metrics::counter!(INITIALIZE_TOTAL, "backend" => backend, "result" => result).increment(1);
}
