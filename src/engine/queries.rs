use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;
use crate::observability;

use super::{BookingEntry, Engine, EngineError};
use super::slots::{self, query_window, validate_slot_query};

impl Engine {
    pub async fn working_hours(&self, instructor_id: &Ulid) -> Vec<WorkingHourRule> {
        match self.ledger(instructor_id) {
            Some(ledger) => ledger.read().await.hours.rules().copied().collect(),
            None => Vec::new(),
        }
    }

    /// Bookable slots for `[start_date, end_date]` at `now`.
    pub async fn generate_slots(
        &self,
        instructor_id: Ulid,
        start_date: NaiveDate,
        end_date: NaiveDate,
        slot_minutes: u32,
    ) -> Result<Vec<Slot>, EngineError> {
        validate_slot_query(start_date, end_date, slot_minutes)?;
        let Some(ledger) = self.ledger(&instructor_id) else {
            return Ok(Vec::new());
        };
        let started = std::time::Instant::now();
        let window = query_window(start_date, end_date);

        let mut busy: Vec<BusyInterval> = self
            .calendar
            .busy_intervals(instructor_id, window)
            .await?
            .into_iter()
            .map(|span| BusyInterval {
                span,
                source: BusySource::Calendar,
            })
            .collect();

        let hours = {
            let guard = ledger.read().await;
            busy.extend(guard.busy_intervals(&window, self.now()));
            guard.hours.clone()
        };

        let result = slots::generate_slots(instructor_id, &hours, &busy, start_date, end_date, slot_minutes);
        metrics::histogram!(observability::SLOT_QUERY_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        result
    }

    pub async fn booking(&self, booking_id: &Ulid) -> Result<BookingEntry, EngineError> {
        let ledger = self
            .instructor_for(booking_id)
            .and_then(|instructor_id| self.ledger(&instructor_id))
            .ok_or(EngineError::NotFound(*booking_id))?;
        let guard = ledger.read().await;
        guard
            .booking(booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(*booking_id))
    }
}
