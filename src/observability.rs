use std::net::SocketAddr;

use metrics_exporter_prometheus::BuildError;

// ── Booking flow ────────────────────────────────────────────────

/// Counter: holds successfully placed.
pub const HOLDS_PLACED_TOTAL: &str = "slopebook_holds_placed_total";

/// Counter: place_hold rejected because the span is taken. Labels: source.
pub const HOLD_CONFLICTS_TOTAL: &str = "slopebook_hold_conflicts_total";

/// Counter: holds expired by the reaper or reclaimed inline.
pub const HOLDS_EXPIRED_TOTAL: &str = "slopebook_holds_expired_total";

/// Counter: booking status transitions. Labels: to.
pub const BOOKING_TRANSITIONS_TOTAL: &str = "slopebook_booking_transitions_total";

/// Counter: inbound payment events. Labels: outcome.
pub const PAYMENT_EVENTS_TOTAL: &str = "slopebook_payment_events_total";

/// Counter: records the reaper failed to process.
pub const REAPER_FAILURES_TOTAL: &str = "slopebook_reaper_failures_total";

/// Histogram: slot generation latency in seconds.
pub const SLOT_QUERY_DURATION_SECONDS: &str = "slopebook_slot_query_duration_seconds";

// ── Storage ─────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slopebook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slopebook_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
