//! Structured tracing and in-process metrics.
//!
//! Everything logs through `tracing`. Installing a subscriber is left to the
//! embedding process; with the `telemetry` feature, [`init_tracing`] sets up
//! an env-filtered formatter.

mod metrics;
mod spans;

pub use metrics::{Counter, Gauge, GatewayMetrics, Histogram, MetricsSnapshot};
pub use spans::SessionSpan;

/// Installs a global `fmt` subscriber filtered by `RUST_LOG`, falling back to
/// `default_directive` (e.g. `"inference_proxy=info"`).
///
/// Returns `false` if a global subscriber was already set.
#[cfg(feature = "telemetry")]
#[cfg_attr(docsrs, doc(cfg(feature = "telemetry")))]
pub fn init_tracing(default_directive: &str) -> bool {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}
