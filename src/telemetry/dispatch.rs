//! Span helpers for the produce and handle paths.

use tracing::Span;

/// Start a span for a produce call.
///
/// `event.id` is declared empty and filled once the identifier is known.
pub fn start_produce_span(code: &str) -> Span {
    tracing::info_span!(
        "event.produce",
        "event.code" = code,
        "event.id" = tracing::field::Empty,
        "event.trace_id" = tracing::field::Empty,
    )
}

/// Record the identifiers assigned to a produced event.
pub fn record_event_ids(span: &Span, event_id: &str, trace_id: &str) {
    span.record("event.id", event_id);
    span.record("event.trace_id", trace_id);
}

/// Start a span for handling one transport message on a channel.
pub fn start_handle_span(channel: &str, partition: u32, offset: i64, handling_trace: &str) -> Span {
    tracing::info_span!(
        "event.handle",
        "handler.channel" = channel,
        "transport.partition" = partition,
        "transport.offset" = offset,
        "handler.trace_id" = handling_trace,
        "event.id" = tracing::field::Empty,
        "handler.outcome" = tracing::field::Empty,
    )
}

/// Record the handler outcome on the given span.
///
/// Emits a tracing `info` event scoped to the span as well.
pub fn record_outcome(span: &Span, outcome: &str) {
    span.record("handler.outcome", outcome);
    span.in_scope(|| {
        tracing::info!(outcome = outcome, "handled");
    });
}
