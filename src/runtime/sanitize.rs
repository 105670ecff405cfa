//! Error message sanitization.
//!
//! Native engines report failures with implementation-identifying
//! boilerplate: a fully qualified exception class name in front, a source
//! location trace behind. Callers only ever see the part in between.

use std::sync::OnceLock;

use regex::Regex;

/// Marker after which native engines append a source location dump.
const SOURCE_TRACE_MARKER: &str = "=== Source Location Trace";

/// Message used when nothing is left after stripping.
pub const UNKNOWN_ERROR: &str = "Unknown error";

fn class_prefix() -> &'static Regex {
    static PREFIX: OnceLock<Regex> = OnceLock::new();
    // `a.b.C: `, `a.b.Outer$Inner: `, possibly repeated for wrapped causes
    PREFIX.get_or_init(|| {
        Regex::new(r"^(?:[A-Za-z_][\w]*\.)+[A-Za-z_][\w$]*(?:Exception|Error|Throwable)\s*:\s*")
            .expect("class prefix pattern compiles")
    })
}

/// Strip known backend prefixes and trailers from an error message.
pub fn sanitize_error_message(message: &str) -> String {
    let mut text = match message.find(SOURCE_TRACE_MARKER) {
        Some(idx) => &message[..idx],
        None => message,
    }
    .trim();

    while let Some(found) = class_prefix().find(text) {
        text = text[found.end()..].trim_start();
    }

    let text = text.trim();
    if text.is_empty() {
        UNKNOWN_ERROR.to_string()
    } else {
        text.to_string()
    }
}
