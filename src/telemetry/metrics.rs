//! Metric instrument factories for axnc-rs.
//!
//! Instruments come from the `"axnc-rs"` meter on the global provider, so
//! they are no-ops until [`init_telemetry`](super::init_telemetry) installs one.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("axnc-rs")
}

/// Counter: produce calls.
/// Labels: `code`, `result` ("ok" | "invalid" | "error").
pub fn events_produced() -> Counter<u64> {
    meter()
        .u64_counter("axnc.events.produced")
        .with_description("Number of produce calls")
        .build()
}

/// Counter: transport-level operations (append, fetch, commit, purge).
/// Labels: `topic`, `operation`.
pub fn transport_operations() -> Counter<u64> {
    meter()
        .u64_counter("axnc.transport.operations")
        .with_description("Number of transport operations")
        .build()
}

/// Counter: per-message handler outcomes.
/// Labels: `channel`, `outcome` ("ok" | "dropped" | "abandoned" | "retry").
pub fn handler_outcomes() -> Counter<u64> {
    meter()
        .u64_counter("axnc.handler.outcomes")
        .with_description("Number of handled transport messages by outcome")
        .build()
}

/// Counter: rules skipped during routing because they reference unknown codes.
pub fn rules_skipped() -> Counter<u64> {
    meter()
        .u64_counter("axnc.rules.skipped")
        .with_description("Rules skipped during routing")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("axnc.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
