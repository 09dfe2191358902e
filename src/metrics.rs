// Prometheus metrics for the overlay session.

use lazy_static::lazy_static;
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // ── Gauges ───────────────────────────────────────────────────────

    /// Blips currently held by the registry.
    pub static ref BLIPS_TRACKED: IntGauge =
        IntGauge::new("blipmap_blips_tracked", "Blips currently tracked").unwrap();

    /// Marker slots holding a live handle.
    pub static ref MARKER_SLOTS_LIVE: IntGauge =
        IntGauge::new("blipmap_marker_slots_live", "Marker slots holding a live handle").unwrap();

    /// Marker table epoch (number of full resets).
    pub static ref MARKER_EPOCH: IntGauge =
        IntGauge::new("blipmap_marker_epoch", "Marker table epoch").unwrap();

    /// Current server generation.
    pub static ref SERVER_GENERATION: IntGauge =
        IntGauge::new("blipmap_server_generation", "Server switch generation").unwrap();

    /// 1 while a live feed connection is open.
    pub static ref FEED_CONNECTED: IntGauge =
        IntGauge::new("blipmap_feed_connected", "Live feed connection open").unwrap();

    // ── Counters ─────────────────────────────────────────────────────

    /// Feed events handled, by kind and outcome (applied, ignored).
    pub static ref FEED_EVENTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("blipmap_feed_events_total", "Feed events handled"),
        &["kind", "outcome"],
    )
    .unwrap();

    /// Feed frames that failed to decode.
    pub static ref FEED_DECODE_ERRORS_TOTAL: IntCounter = IntCounter::new(
        "blipmap_feed_decode_errors_total",
        "Feed frames that failed to decode",
    )
    .unwrap();

    /// Results dropped because their generation was superseded, by source.
    pub static ref STALE_RESULTS_DISCARDED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "blipmap_stale_results_discarded_total",
            "Results discarded after a server switch",
        ),
        &["source"],
    )
    .unwrap();

    /// Server switch requests, by outcome (accepted, rejected).
    pub static ref SERVER_SWITCHES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("blipmap_server_switches_total", "Server switch requests"),
        &["outcome"],
    )
    .unwrap();

    /// Snapshot fetches, by outcome (ok, error).
    pub static ref SNAPSHOT_FETCHES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("blipmap_snapshot_fetches_total", "Snapshot fetches"),
        &["outcome"],
    )
    .unwrap();

    // ── Histograms ───────────────────────────────────────────────────

    /// Snapshot fetch plus decode time in seconds.
    pub static ref SNAPSHOT_FETCH_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new("blipmap_snapshot_fetch_seconds", "Snapshot fetch duration in seconds")
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
    )
    .unwrap();
}

/// Register all metrics with the custom registry. Safe to call more than once.
pub fn register_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(BLIPS_TRACKED.clone()),
        Box::new(MARKER_SLOTS_LIVE.clone()),
        Box::new(MARKER_EPOCH.clone()),
        Box::new(SERVER_GENERATION.clone()),
        Box::new(FEED_CONNECTED.clone()),
        Box::new(FEED_EVENTS_TOTAL.clone()),
        Box::new(FEED_DECODE_ERRORS_TOTAL.clone()),
        Box::new(STALE_RESULTS_DISCARDED_TOTAL.clone()),
        Box::new(SERVER_SWITCHES_TOTAL.clone()),
        Box::new(SNAPSHOT_FETCHES_TOTAL.clone()),
        Box::new(SNAPSHOT_FETCH_SECONDS.clone()),
    ];

    for c in collectors {
        if let Err(e) = REGISTRY.register(c) {
            tracing::debug!("metric already registered: {e}");
        }
    }
}

/// Serialize all registered metrics to the Prometheus text exposition format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_else(|e| {
            tracing::error!("Failed to encode metrics: {e}");
            String::new()
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_metrics_returns_string() {
        register_metrics();
        register_metrics();
        let output = gather_metrics();
        assert!(output.is_empty() || output.contains("blipmap_"));
    }

    #[test]
    fn test_metric_increments() {
        SERVER_GENERATION.set(3);
        assert_eq!(SERVER_GENERATION.get(), 3);

        FEED_CONNECTED.set(1);
        FEED_CONNECTED.set(0);

        FEED_EVENTS_TOTAL
            .with_label_values(&["addBlip", "applied"])
            .inc();
        STALE_RESULTS_DISCARDED_TOTAL
            .with_label_values(&["snapshot"])
            .inc();
        SERVER_SWITCHES_TOTAL.with_label_values(&["rejected"]).inc();
        SNAPSHOT_FETCHES_TOTAL.with_label_values(&["ok"]).inc();
        FEED_DECODE_ERRORS_TOTAL.inc();
        SNAPSHOT_FETCH_SECONDS.observe(0.2);
    }
}
