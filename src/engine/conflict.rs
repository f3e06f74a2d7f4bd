use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{EngineError, InstructorLedger};

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as Ms
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_BOOKING_DURATION_MS {
        return Err(EngineError::LimitExceeded("booking longer than a day"));
    }
    Ok(())
}

pub(crate) fn validate_email(email: &str) -> Result<(), EngineError> {
    if email.is_empty() || !email.contains('@') {
        return Err(EngineError::InvalidInput("client email must be an address".into()));
    }
    if email.len() > MAX_EMAIL_LEN {
        return Err(EngineError::LimitExceeded("client email too long"));
    }
    Ok(())
}

/// The span must sit inside the working-hours window of the day it starts on.
pub(crate) fn check_within_working_hours(hours: &WeeklyHours, span: &Span) -> Result<(), EngineError> {
    let inside = date_of(span.start).is_some_and(|date| {
        hours
            .get(day_of_week(date))
            .is_some_and(|rule| rule.window_on(day_start_ms(date)).contains_span(span))
    });
    if inside {
        Ok(())
    } else {
        Err(EngineError::OutsideWorkingHours(*span))
    }
}

/// Fail on the first blocking hold that overlaps `span`.
/// On success, returns the overlapping stale holds the caller must reclaim.
pub(crate) fn check_no_conflict(
    ledger: &InstructorLedger,
    span: &Span,
    now: Ms,
) -> Result<Vec<Ulid>, EngineError> {
    let mut stale = Vec::new();
    for entry in ledger.overlapping_active(span) {
        if entry.blocks(now) {
            return Err(EngineError::SlotUnavailable {
                conflicting: Some(entry.booking.id),
            });
        }
        if entry.is_stale(now) {
            stale.push(entry.booking.id);
        }
    }
    Ok(stale)
}
