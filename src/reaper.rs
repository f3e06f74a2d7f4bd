use serde::Serialize;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::observability;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ReapFailure {
    pub booking_id: Ulid,
    pub error: String,
}

/// What one sweep did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub processed_count: usize,
    pub deposit_ids: Vec<Ulid>,
    pub booking_ids: Vec<Ulid>,
    pub failures: Vec<ReapFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompactReport {
    pub compacted: bool,
    pub appends_since_compact: u64,
    pub records: Option<usize>,
}

/// Expire every pending booking whose hold ran out.
///
/// Each record is handled under its own instructor lock; a failure is logged
/// and reported without stopping the sweep, and the record is retried on the
/// next one.
pub async fn process_expired_deposits(engine: &Engine) -> CleanupReport {
    let now = engine.now();
    let mut report = CleanupReport::default();

    for (booking_id, instructor_id) in engine.collect_expired_holds(now).await {
        match engine.expire_hold(booking_id).await {
            Ok(Some(entry)) => {
                report.processed_count += 1;
                report.booking_ids.push(booking_id);
                if let Some(deposit) = &entry.deposit {
                    report.deposit_ids.push(deposit.id);
                }
                info!(%booking_id, %instructor_id, "reaped expired hold");
            }
            // Closed by someone else since collection.
            Ok(None) => debug!(%booking_id, "reaper skip: no longer pending"),
            Err(e) => {
                metrics::counter!(observability::REAPER_FAILURES_TOTAL).increment(1);
                warn!(%booking_id, %instructor_id, "reaper failed: {e}");
                report.failures.push(ReapFailure {
                    booking_id,
                    error: e.to_string(),
                });
            }
        }
    }

    report
}

/// Compact the WAL once it has grown past `threshold` appends.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> Result<CompactReport, EngineError> {
    let appends_since_compact = engine.wal_appends_since_compact().await;
    if appends_since_compact < threshold {
        return Ok(CompactReport {
            compacted: false,
            appends_since_compact,
            records: None,
        });
    }
    let records = engine.compact_wal().await?;
    Ok(CompactReport {
        compacted: true,
        appends_since_compact,
        records: Some(records),
    })
}
