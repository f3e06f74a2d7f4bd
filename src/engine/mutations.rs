use std::collections::HashSet;

use tokio::sync::oneshot;
use tracing::info;
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError, WalCommand};

impl Engine {
    /// Insert or replace working-hour rules for several weekdays at once.
    /// The whole batch is one log record.
    pub async fn upsert_working_hours(
        &self,
        instructor_id: Ulid,
        windows: Vec<DayWindow>,
    ) -> Result<Vec<WorkingHourRule>, EngineError> {
        if windows.is_empty() {
            return Err(EngineError::InvalidInput("no working hours given".into()));
        }
        let mut seen = HashSet::new();
        let mut rules = Vec::with_capacity(windows.len());
        for window in windows {
            let rule = WorkingHourRule {
                instructor_id,
                day_of_week: window.day_of_week,
                start_minute: window.start_minute,
                end_minute: window.end_minute,
            };
            if !rule.is_valid() {
                return Err(EngineError::InvalidInput(format!(
                    "invalid window for day {}: {}..{}",
                    rule.day_of_week, rule.start_minute, rule.end_minute
                )));
            }
            if !seen.insert(rule.day_of_week) {
                return Err(EngineError::InvalidInput(format!(
                    "day {} given more than once",
                    rule.day_of_week
                )));
            }
            rules.push(rule);
        }

        // A first write must land either in the compaction snapshot or after it.
        let _creating = match self.ledger(&instructor_id) {
            Some(_) => None,
            None => Some(self.creation_gate.read().await),
        };
        let ledger = self.ledger_or_create(instructor_id);
        let mut guard = ledger.write().await;
        let event = Event::WorkingHoursUpserted {
            instructor_id,
            rules,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        info!(%instructor_id, "working hours updated");
        Ok(guard.hours.rules().copied().collect())
    }

    pub async fn remove_working_hours(
        &self,
        instructor_id: Ulid,
        day_of_week: u8,
    ) -> Result<WorkingHourRule, EngineError> {
        if day_of_week > 6 {
            return Err(EngineError::InvalidInput(format!("no weekday {day_of_week}")));
        }
        let ledger = self
            .ledger(&instructor_id)
            .ok_or(EngineError::NotFound(instructor_id))?;
        let mut guard = ledger.write().await;
        let rule = *guard
            .hours
            .get(day_of_week)
            .ok_or(EngineError::NotFound(instructor_id))?;

        let event = Event::WorkingHoursRemoved {
            instructor_id,
            day_of_week,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(rule)
    }

    /// Pending bookings whose pending hold expired before `now`,
    /// as `(booking_id, instructor_id)`.
    pub async fn collect_expired_holds(&self, now: Ms) -> Vec<(Ulid, Ulid)> {
        let ledgers: Vec<_> = self.ledgers.iter().map(|e| e.value().clone()).collect();
        let mut expired = Vec::new();
        for ledger in ledgers {
            let guard = ledger.read().await;
            for entry in guard.bookings() {
                if entry.booking.status == BookingStatus::Pending
                    && entry.hold.status == HoldStatus::Pending
                    && entry.hold.is_expired(now)
                {
                    expired.push((entry.booking.id, guard.instructor_id));
                }
            }
        }
        expired
    }

    /// Rewrite the WAL as the minimal record set that rebuilds current state.
    ///
    /// Read locks on every ledger are held until the swap completes, so no
    /// record can land between the snapshot and the new file. The creation gate
    /// keeps ledgers created mid-snapshot from writing until then.
    pub async fn compact_wal(&self) -> Result<usize, EngineError> {
        let gate = self.creation_gate.write().await;
        let ledgers: Vec<_> = self.ledgers.iter().map(|e| e.value().clone()).collect();
        let mut guards = Vec::with_capacity(ledgers.len());
        for ledger in ledgers {
            guards.push(ledger.read_owned().await);
        }

        let mut events = Vec::new();
        for guard in &guards {
            if !guard.hours.is_empty() {
                events.push(Event::WorkingHoursUpserted {
                    instructor_id: guard.instructor_id,
                    rules: guard.hours.rules().copied().collect(),
                });
            }
            for entry in guard.bookings() {
                events.push(Event::BookingRequested {
                    booking: entry.booking.clone(),
                    hold: entry.hold.clone(),
                    deposit: entry.deposit.clone(),
                });
            }
        }
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        drop(guards);
        drop(gate);

        info!(records = count, "WAL compacted");
        Ok(count)
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
