use std::sync::OnceLock;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::models::CloseReason;

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus exporter and register all application metrics.
/// Returns a `PrometheusHandle` whose `render()` method produces the
/// text/plain Prometheus scrape payload.
///
/// The recorder is installed once per process; later calls return the same
/// handle.
pub fn init_metrics() -> PrometheusHandle {
    HANDLE.get_or_init(install).clone()
}

fn install() -> PrometheusHandle {
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();
    if let Err(e) = metrics::set_global_recorder(recorder) {
        tracing::warn!(error = %e, "Metrics recorder already installed");
    }

    // Pre-register counters so they appear even before the first increment.
    counter!("price_ticks_total").absolute(0);
    counter!("orders_placed_total").absolute(0);
    counter!("orders_rejected_total").absolute(0);
    counter!("feed_reconnects_total").absolute(0);
    counter!("broadcast_failures_total").absolute(0);
    for reason in [
        CloseReason::Liquidation,
        CloseReason::TakeProfit,
        CloseReason::StopLoss,
        CloseReason::Manual,
        CloseReason::Reversal,
    ] {
        counter!("positions_closed_total", "reason" => reason.as_str()).absolute(0);
    }

    // Pre-register gauges at zero.
    gauge!("open_positions").set(0.0);
    gauge!("tracked_pairs").set(0.0);

    // Histogram is lazily created on first record; force creation.
    histogram!("tick_processing_seconds").record(0.0);

    handle
}
