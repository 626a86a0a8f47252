//! Prometheus metrics for the client

use once_cell::sync::Lazy;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, Counter, CounterVec, Encoder, Gauge,
    TextEncoder,
};

// ── Dispatch ─────────────────────────────────────────────────────────────────

pub static FRAMES_DISPATCHED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "toolgear_frames_dispatched_total",
        "Frames received from collectors, by tag",
        &["tag"]
    )
    .expect("register toolgear_frames_dispatched_total")
});

pub static FATAL_ERRORS: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "toolgear_fatal_errors_total",
        "Sessions ended by a protocol or schema error"
    )
    .expect("register toolgear_fatal_errors_total")
});

// ── Database ─────────────────────────────────────────────────────────────────

pub static DROPPED_VALUES: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "toolgear_dropped_values_total",
        "NaN or infinite values discarded on write"
    )
    .expect("register toolgear_dropped_values_total")
});

pub static STATS_REBUILDS: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "toolgear_stats_rebuilds_total",
        "Statistics recomputed from scratch after invalidation"
    )
    .expect("register toolgear_stats_rebuilds_total")
});

pub static SNAPSHOT_MERGES: Lazy<Counter> = Lazy::new(|| {
    register_counter!("toolgear_snapshot_merges_total", "Snapshots merged")
        .expect("register toolgear_snapshot_merges_total")
});

// ── File fetch ───────────────────────────────────────────────────────────────

pub static PENDING_FETCHES: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "toolgear_pending_fetches",
        "File and directory requests awaiting a reply"
    )
    .expect("register toolgear_pending_fetches")
});

/// Render all registered metrics to Prometheus text format.
pub fn encode_metrics() -> prometheus::Result<String> {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
