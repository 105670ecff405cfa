//! Fuzz target for error message sanitization.
//!
//! Arbitrary backend error strings must never panic the sanitizer, and the
//! result must be non-empty, trimmed and free of the source trace marker.

#![no_main]

use libfuzzer_sys::fuzz_target;
use ondevice_runtime::runtime::{estimate_tokens, sanitize_error_message};

fuzz_target!(|data: &str| {
    let cleaned = sanitize_error_message(data);

    assert!(!cleaned.is_empty(), "sanitized message must never be empty");
    assert_eq!(cleaned, cleaned.trim());
    assert!(!cleaned.contains("=== Source Location Trace"));
    assert!(cleaned.len() <= data.len().max("Unknown error".len()));

    // Token estimate accepts any text and counts at least one word.
    assert!(estimate_tokens(data) >= 1);
});
