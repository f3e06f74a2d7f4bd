use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

// ── Slot Generation ───────────────────────────────────────────────

/// Check a slot query before anything touches the ledger.
pub fn validate_slot_query(
    start_date: NaiveDate,
    end_date: NaiveDate,
    slot_minutes: u32,
) -> Result<(), EngineError> {
    if start_date > end_date {
        return Err(EngineError::InvalidRange("start date after end date"));
    }
    if (end_date - start_date).num_days() > MAX_SLOT_RANGE_DAYS {
        return Err(EngineError::InvalidRange("date range too wide"));
    }
    if slot_minutes == 0 || slot_minutes > MAX_SLOT_MINUTES {
        return Err(EngineError::InvalidRange("slot duration out of range"));
    }
    Ok(())
}

/// Instant window covering every day of `[start_date, end_date]`.
pub fn query_window(start_date: NaiveDate, end_date: NaiveDate) -> Span {
    let end = day_start_ms(end_date) + Ms::from(MINUTES_PER_DAY) * MINUTE_MS;
    Span::new(day_start_ms(start_date), end)
}

/// Compute bookable slots from weekly hours minus busy time.
///
/// For each day the weekday rule (if any) is walked from `start_minute` in
/// `slot_minutes` steps. A candidate survives if it ends no later than
/// `end_minute` and overlaps no busy interval. Output is ascending by start.
pub fn generate_slots(
    instructor_id: Ulid,
    hours: &WeeklyHours,
    busy: &[BusyInterval],
    start_date: NaiveDate,
    end_date: NaiveDate,
    slot_minutes: u32,
) -> Result<Vec<Slot>, EngineError> {
    validate_slot_query(start_date, end_date, slot_minutes)?;

    let mut spans: Vec<Span> = busy.iter().map(|b| b.span).collect();
    spans.sort_by_key(|s| s.start);
    let blocked = merge_overlapping(&spans);

    let stride = Ms::from(slot_minutes) * MINUTE_MS;
    let mut slots = Vec::new();

    for date in start_date.iter_days().take_while(|d| *d <= end_date) {
        let Some(rule) = hours.get(day_of_week(date)) else {
            continue;
        };
        let window = rule.window_on(day_start_ms(date));

        let mut start = window.start;
        while start + stride <= window.end {
            let candidate = Span::new(start, start + stride);
            if !overlaps_any(&blocked, &candidate) {
                slots.push(Slot {
                    instructor_id,
                    start: candidate.start,
                    end: candidate.end,
                });
            }
            start += stride;
        }
    }

    Ok(slots)
}

/// `blocked` must be sorted and disjoint (output of `merge_overlapping`).
fn overlaps_any(blocked: &[Span], candidate: &Span) -> bool {
    // Disjoint + sorted by start means ends are sorted too.
    let idx = blocked.partition_point(|b| b.end <= candidate.start);
    blocked
        .get(idx)
        .is_some_and(|b| b.start < candidate.end)
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end {
                last.end = last.end.max(span.end);
                continue;
            }
        merged.push(span);
    }
    merged
}
