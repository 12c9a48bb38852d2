//! Metric instrument factories for workbatch.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created from the `"workbatch"` meter; without an
//! OTLP endpoint they are no-ops.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("workbatch")
}

/// Counter: spawns of the external tool.
/// Labels: `backend`, `result` ("ok" | "timeout" | "exit_code" | "empty_output" | ...).
pub fn invocations() -> Counter<u64> {
    meter()
        .u64_counter("workbatch.invocations")
        .with_description("Number of external tool invocations")
        .build()
}

/// Counter: retries scheduled by the retry controller.
/// Labels: `rate_limited`.
pub fn retries() -> Counter<u64> {
    meter()
        .u64_counter("workbatch.retries")
        .with_description("Number of invocation retries")
        .build()
}

/// Counter: invocations classified as rate limited.
/// Labels: `backend`.
pub fn rate_limited() -> Counter<u64> {
    meter()
        .u64_counter("workbatch.rate_limited")
        .with_description("Invocations where the tool signaled throttling")
        .build()
}

/// Counter: tasks reaching a terminal state.
/// Labels: `batch`, `status`.
pub fn task_outcomes() -> Counter<u64> {
    meter()
        .u64_counter("workbatch.task.outcomes")
        .with_description("Tasks reaching a terminal state")
        .build()
}

/// Histogram: wall time of a single invocation in milliseconds.
/// Labels: `backend`.
pub fn invocation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("workbatch.invocation.duration_ms")
        .with_description("External tool invocation duration in milliseconds")
        .with_unit("ms")
        .build()
}
