//! Latency logging for the hot path, compiled in with the `timings` feature.
//! Without it both helpers are zero-cost pass-throughs.

use std::{future::Future, time::Duration};

#[cfg(feature = "timings")]
use std::time::Instant;

#[cfg(feature = "timings")]
pub(crate) fn time_block<T>(label: &'static str, f: impl FnOnce() -> T) -> T {
    let start = Instant::now();
    let value = f();
    tracing::debug!(
        target: "timings",
        label,
        elapsed_us = start.elapsed().as_micros() as u64
    );
    value
}

#[cfg(not(feature = "timings"))]
pub(crate) fn time_block<T>(_: &'static str, f: impl FnOnce() -> T) -> T {
    f()
}

/// Awaits `fut` and logs its latency, warning when it overran `budget`.
#[cfg(feature = "timings")]
pub(crate) async fn time_async_block<T>(
    label: &'static str,
    budget: Duration,
    fut: impl Future<Output = T>,
) -> T {
    let start = Instant::now();
    let output = fut.await;
    let elapsed = start.elapsed();
    let elapsed_ms = elapsed.as_secs_f64() * 1e3;
    if elapsed > budget {
        tracing::warn!(
            target: "timings",
            label,
            elapsed_ms,
            budget_ms = budget.as_millis() as u64,
            "over budget"
        );
    } else {
        tracing::info!(target: "timings", label, elapsed_ms);
    }
    output
}

#[cfg(not(feature = "timings"))]
pub(crate) async fn time_async_block<T>(
    _: &'static str,
    _: Duration,
    fut: impl Future<Output = T>,
) -> T {
    fut.await
}
