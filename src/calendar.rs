use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use ulid::Ulid;

use crate::engine::merge_overlapping;
use crate::model::{Ms, Span};

#[derive(Debug, Clone)]
pub struct CalendarError(pub String);

impl std::fmt::Display for CalendarError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for CalendarError {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub instructors: usize,
    pub pruned: usize,
}

/// Read side of an instructor's synced external calendar.
///
/// Freshness is eventual: data is only as new as the last sync.
#[async_trait]
pub trait CalendarBusyTimeProvider: Send + Sync {
    /// Busy intervals overlapping `window`, sorted and merged.
    async fn busy_intervals(&self, instructor_id: Ulid, window: Span) -> Result<Vec<Span>, CalendarError>;

    /// Periodic maintenance triggered by the cron tick.
    async fn sync(&self, now: Ms) -> Result<SyncReport, CalendarError>;
}

/// Busy intervals pushed by the external calendar sync job, kept in memory.
#[derive(Default)]
pub struct CalendarCache {
    busy: DashMap<Ulid, Vec<Span>>,
}

impl CalendarCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace everything known about one instructor's calendar.
    pub fn replace(&self, instructor_id: Ulid, mut intervals: Vec<Span>) {
        intervals.sort_by_key(|s| s.start);
        let merged = merge_overlapping(&intervals);
        if merged.is_empty() {
            self.busy.remove(&instructor_id);
        } else {
            self.busy.insert(instructor_id, merged);
        }
    }
}

#[async_trait]
impl CalendarBusyTimeProvider for CalendarCache {
    async fn busy_intervals(&self, instructor_id: Ulid, window: Span) -> Result<Vec<Span>, CalendarError> {
        Ok(self
            .busy
            .get(&instructor_id)
            .map(|spans| spans.iter().filter(|s| s.overlaps(&window)).copied().collect())
            .unwrap_or_default())
    }

    /// Drop intervals that ended before `now`; they can never block a slot again.
    async fn sync(&self, now: Ms) -> Result<SyncReport, CalendarError> {
        let mut report = SyncReport::default();
        for mut entry in self.busy.iter_mut() {
            report.instructors += 1;
            let before = entry.len();
            entry.retain(|s| s.end > now);
            report.pruned += before - entry.len();
        }
        self.busy.retain(|_, spans| !spans.is_empty());
        Ok(report)
    }
}
