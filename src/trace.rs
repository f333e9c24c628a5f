//! Trace-context propagation across the publish/consume boundary.
//!
//! The producer writes its current span as a W3C `traceparent` header (plus
//! `tracestate` when non-empty); the consumer reads it back and parents its
//! processing span on it. Spans come from the `opentelemetry` global tracer,
//! so with no SDK installed they are no-ops that still carry ids end to end.

use opentelemetry::propagation::TextMapPropagator;
use opentelemetry::trace::{SpanContext, SpanKind, TraceContextExt, Tracer};
use opentelemetry::{global, Context};
use opentelemetry_sdk::propagation::TraceContextPropagator;

use crate::Headers;

/// Header carrying the serialized span context.
pub const TRACEPARENT_HEADER: &str = "traceparent";

/// Vendor-specific trace state, written only when non-empty.
pub const TRACESTATE_HEADER: &str = "tracestate";

const TRACER_NAME: &str = "amqp-rpc";

/// Write the current context's span into `headers`.
///
/// Does nothing when no valid span is active.
pub fn inject(headers: &mut Headers) {
    inject_context(&Context::current(), headers);
}

/// Write `cx`'s span into `headers`. Does nothing for an invalid span.
pub fn inject_context(cx: &Context, headers: &mut Headers) {
    // ---
    if !cx.span().span_context().is_valid() {
        return;
    }
    TraceContextPropagator::new().inject_context(cx, headers);
}

/// Rebuild the producer's span context from `headers`.
///
/// The returned span context is flagged remote only when `is_remote` is set
/// and no valid span is active locally. Missing or malformed headers give an
/// empty context.
pub fn extract(headers: &Headers, is_remote: bool) -> Context {
    // ---
    let parsed = TraceContextPropagator::new().extract_with_context(&Context::new(), headers);
    let sc = parsed.span().span_context().clone();
    if !sc.is_valid() {
        return Context::new();
    }

    let local_active = Context::current().span().span_context().is_valid();
    let remote = is_remote && !local_active;

    let rebuilt = SpanContext::new(
        sc.trace_id(),
        sc.span_id(),
        sc.trace_flags(),
        remote,
        sc.trace_state().clone(),
    );
    Context::new().with_remote_span_context(rebuilt)
}

/// Start a producer span `SEND <routing_key>` under the current context.
pub(crate) fn producer_context(routing_key: &str) -> Context {
    // ---
    let parent = Context::current();
    let tracer = global::tracer(TRACER_NAME);
    let span = tracer
        .span_builder(format!("SEND {routing_key}"))
        .with_kind(SpanKind::Producer)
        .start_with_context(&tracer, &parent);
    parent.with_span(span)
}

/// Start a consumer span `RECEIVE <queue>` parented on the context found in
/// `headers`.
pub(crate) fn consumer_context(queue: &str, headers: &Headers) -> Context {
    // ---
    let parent = extract(headers, true);
    let tracer = global::tracer(TRACER_NAME);
    let span = tracer
        .span_builder(format!("RECEIVE {queue}"))
        .with_kind(SpanKind::Consumer)
        .start_with_context(&tracer, &parent);
    parent.with_span(span)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use opentelemetry::trace::{SpanId, TraceFlags, TraceId, TraceState};

    const TRACE: &str = "4bf92f3577b34da6a3ce929d0e0e4736";
    const SPAN: &str = "00f067aa0ba902b7";

    fn sampled_context() -> Context {
        let sc = SpanContext::new(
            TraceId::from_hex(TRACE).unwrap(),
            SpanId::from_hex(SPAN).unwrap(),
            TraceFlags::SAMPLED,
            false,
            TraceState::default(),
        );
        Context::new().with_remote_span_context(sc)
    }

    #[test]
    fn inject_writes_traceparent() {
        // ---
        let mut headers = Headers::new();
        inject_context(&sampled_context(), &mut headers);

        assert_eq!(
            headers.get(TRACEPARENT_HEADER).map(String::as_str),
            Some("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01")
        );
    }

    #[test]
    fn inject_without_span_is_a_no_op() {
        // ---
        let mut headers = Headers::new();
        inject_context(&Context::new(), &mut headers);
        assert!(headers.is_empty());
    }

    #[test]
    fn extract_restores_ids_and_flags_remote() {
        // ---
        let mut headers = Headers::new();
        inject_context(&sampled_context(), &mut headers);

        let cx = extract(&headers, true);
        let sc = cx.span().span_context().clone();
        assert_eq!(sc.trace_id(), TraceId::from_hex(TRACE).unwrap());
        assert_eq!(sc.span_id(), SpanId::from_hex(SPAN).unwrap());
        assert!(sc.is_sampled());
        assert!(sc.is_remote());

        let cx = extract(&headers, false);
        assert!(!cx.span().span_context().is_remote());
    }

    #[test]
    fn extract_is_local_while_a_span_is_active() {
        // ---
        let mut headers = Headers::new();
        inject_context(&sampled_context(), &mut headers);

        let _guard = sampled_context().attach();
        let cx = extract(&headers, true);
        assert!(cx.span().span_context().is_valid());
        assert!(!cx.span().span_context().is_remote());
    }

    #[test]
    fn malformed_header_gives_empty_context() {
        // ---
        let mut headers = Headers::new();
        headers.insert(TRACEPARENT_HEADER.into(), "not-a-trace".into());

        let cx = extract(&headers, true);
        assert!(!cx.span().span_context().is_valid());
    }

    #[test]
    fn consumer_span_keeps_producer_trace_id() {
        // ---
        let mut headers = Headers::new();
        inject_context(&sampled_context(), &mut headers);

        let cx = consumer_context("rpc_queue", &headers);
        assert_eq!(
            cx.span().span_context().trace_id(),
            TraceId::from_hex(TRACE).unwrap()
        );
    }
}
