// src/macros.rs

//! Logging glue.
//!
//! `logging` enabled: everything goes to `tracing`.
//! `logging` disabled: errors and warnings go to stderr, the rest compiles
//! away, and request spans become plain futures.

#![allow(unused_macros)]

#[cfg(feature = "logging")]
macro_rules! log_error {
    ($($arg:tt)*) => { tracing::error!($($arg)*) };
}

#[cfg(not(feature = "logging"))]
macro_rules! log_error {
    ($($arg:tt)*) => { eprintln!("ERROR {}", format_args!($($arg)*)) };
}

#[cfg(feature = "logging")]
macro_rules! log_warn {
    ($($arg:tt)*) => { tracing::warn!($($arg)*) };
}

#[cfg(not(feature = "logging"))]
macro_rules! log_warn {
    ($($arg:tt)*) => { eprintln!("WARN {}", format_args!($($arg)*)) };
}

#[cfg(feature = "logging")]
macro_rules! log_info {
    ($($arg:tt)*) => { tracing::info!($($arg)*) };
}

#[cfg(not(feature = "logging"))]
macro_rules! log_info {
    ($($arg:tt)*) => { () };
}

#[cfg(feature = "logging")]
macro_rules! log_debug {
    ($($arg:tt)*) => { tracing::debug!($($arg)*) };
}

#[cfg(not(feature = "logging"))]
macro_rules! log_debug {
    ($($arg:tt)*) => { () };
}

pub(crate) use log_debug;
pub(crate) use log_error;
pub(crate) use log_info;
pub(crate) use log_warn;

/// Run `fut` inside a `rpc.request` span tagged with the queue and
/// correlation id.
#[cfg(feature = "logging")]
pub(crate) fn in_request_span<F>(
    fut: F,
    queue: &str,
    correlation_id: &str,
) -> tracing::instrument::Instrumented<F>
where
    F: std::future::Future,
{
    // ---
    use tracing::Instrument;
    fut.instrument(tracing::info_span!(
        "rpc.request",
        queue = %queue,
        correlation_id = %correlation_id
    ))
}

#[cfg(not(feature = "logging"))]
pub(crate) fn in_request_span<F>(fut: F, _queue: &str, _correlation_id: &str) -> F
where
    F: std::future::Future,
{
    fut
}
