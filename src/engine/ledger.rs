use std::collections::HashMap;

use serde::Serialize;
use ulid::Ulid;

use crate::model::*;

/// A booking request with its embedded hold and optional deposit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookingEntry {
    pub booking: BookingRequest,
    pub hold: TentativeHold,
    pub deposit: Option<Deposit>,
}

impl BookingEntry {
    pub fn deposit_status(&self) -> Option<DepositStatus> {
        self.deposit.as_ref().map(|d| d.status)
    }

    /// Whether the hold keeps its span unavailable at `now`.
    ///
    /// A pending hold past its expiry still blocks while a paid deposit sits
    /// on it; the reaper refunds that deposit before the span frees up.
    pub fn blocks(&self, now: Ms) -> bool {
        match self.hold.status {
            HoldStatus::Confirmed => true,
            HoldStatus::Pending => {
                !self.hold.is_expired(now) || self.deposit_status() == Some(DepositStatus::Held)
            }
            HoldStatus::Released | HoldStatus::Expired => false,
        }
    }

    /// Pending, past expiry, and safe to expire without a gateway call.
    pub fn is_stale(&self, now: Ms) -> bool {
        self.hold.status == HoldStatus::Pending && !self.blocks(now)
    }
}

/// Everything known about one instructor: weekly hours plus the booking ledger.
#[derive(Debug)]
pub struct InstructorLedger {
    pub instructor_id: Ulid,
    pub hours: WeeklyHours,
    bookings: HashMap<Ulid, BookingEntry>,
    /// Spans of pending/confirmed holds with their booking id, sorted by start.
    active: Vec<(Span, Ulid)>,
    /// deposit id → booking id
    deposits: HashMap<Ulid, Ulid>,
}

impl InstructorLedger {
    pub fn new(instructor_id: Ulid) -> Self {
        Self {
            instructor_id,
            hours: WeeklyHours::default(),
            bookings: HashMap::new(),
            active: Vec::new(),
            deposits: HashMap::new(),
        }
    }

    pub fn booking(&self, id: &Ulid) -> Option<&BookingEntry> {
        self.bookings.get(id)
    }

    pub fn booking_for_deposit(&self, deposit_id: &Ulid) -> Option<&BookingEntry> {
        self.deposits
            .get(deposit_id)
            .and_then(|booking_id| self.bookings.get(booking_id))
    }

    pub fn bookings(&self) -> impl Iterator<Item = &BookingEntry> {
        self.bookings.values()
    }

    pub fn booking_count(&self) -> usize {
        self.bookings.len()
    }

    pub fn insert_booking(&mut self, entry: BookingEntry) {
        let id = entry.booking.id;
        if entry.hold.status.is_active() {
            self.insert_active(entry.hold.span, id);
        }
        if let Some(deposit) = &entry.deposit {
            self.deposits.insert(deposit.id, id);
        }
        self.bookings.insert(id, entry);
    }

    /// Return the entries whose active hold overlaps `query`.
    /// Uses binary search to skip holds starting at or after `query.end`.
    pub fn overlapping_active(&self, query: &Span) -> impl Iterator<Item = &BookingEntry> {
        let right_bound = self.active.partition_point(|(span, _)| span.start < query.end);
        self.active[..right_bound]
            .iter()
            .filter(move |(span, _)| span.end > query.start)
            .filter_map(|(_, id)| self.bookings.get(id))
    }

    /// Booking-sourced busy time inside `window` at `now`.
    pub fn busy_intervals(&self, window: &Span, now: Ms) -> Vec<BusyInterval> {
        self.overlapping_active(window)
            .filter(|entry| entry.blocks(now))
            .map(|entry| BusyInterval {
                span: entry.hold.span,
                source: BusySource::Booking,
            })
            .collect()
    }

    /// Apply a ledger event. The caller holds the write lock.
    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::WorkingHoursUpserted { rules, .. } => {
                for rule in rules {
                    self.hours.upsert(*rule);
                }
            }
            Event::WorkingHoursRemoved { day_of_week, .. } => {
                self.hours.remove(*day_of_week);
            }
            Event::BookingRequested {
                booking,
                hold,
                deposit,
            } => {
                self.insert_booking(BookingEntry {
                    booking: booking.clone(),
                    hold: hold.clone(),
                    deposit: deposit.clone(),
                });
            }
            Event::HoldConfirmed { booking_id, .. } => {
                self.set_hold_status(booking_id, HoldStatus::Confirmed);
            }
            Event::BookingAccepted {
                booking_id,
                deposit,
                at,
                ..
            } => {
                if let Some(entry) = self.bookings.get_mut(booking_id) {
                    entry.booking.status = BookingStatus::Accepted;
                    entry.booking.updated_at = *at;
                    set_deposit_status(entry, *deposit);
                }
                self.set_hold_status(booking_id, HoldStatus::Confirmed);
            }
            Event::DepositUpdated {
                booking_id,
                deposit,
                hold_expires_at,
                ..
            } => {
                if let Some(entry) = self.bookings.get_mut(booking_id) {
                    entry.hold.expires_at = *hold_expires_at;
                    set_deposit_status(entry, Some(*deposit));
                }
            }
            Event::BookingClosed {
                booking_id,
                booking,
                hold,
                deposit,
                reason,
                at,
                ..
            } => {
                if let Some(entry) = self.bookings.get_mut(booking_id) {
                    entry.booking.status = *booking;
                    entry.booking.close_reason = Some(*reason);
                    entry.booking.updated_at = *at;
                    set_deposit_status(entry, *deposit);
                }
                self.set_hold_status(booking_id, *hold);
            }
            Event::BookingCompleted { booking_id, at, .. } => {
                if let Some(entry) = self.bookings.get_mut(booking_id) {
                    entry.booking.status = BookingStatus::Completed;
                    entry.booking.updated_at = *at;
                }
            }
        }
    }

    fn set_hold_status(&mut self, booking_id: &Ulid, status: HoldStatus) {
        let Some(entry) = self.bookings.get_mut(booking_id) else {
            return;
        };
        let was_active = entry.hold.status.is_active();
        entry.hold.status = status;
        let span = entry.hold.span;
        match (was_active, status.is_active()) {
            (false, true) => self.insert_active(span, *booking_id),
            (true, false) => self.active.retain(|(_, id)| id != booking_id),
            _ => {}
        }
    }

    /// Insert maintaining sort order by span.start.
    fn insert_active(&mut self, span: Span, booking_id: Ulid) {
        let pos = self
            .active
            .binary_search_by_key(&span.start, |(s, _)| s.start)
            .unwrap_or_else(|e| e);
        self.active.insert(pos, (span, booking_id));
    }
}

fn set_deposit_status(entry: &mut BookingEntry, status: Option<DepositStatus>) {
    if let (Some(deposit), Some(status)) = (entry.deposit.as_mut(), status) {
        deposit.status = status;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(instructor_id: Ulid, start: Ms, end: Ms, expires_at: Ms) -> BookingEntry {
        let id = Ulid::new();
        BookingEntry {
            booking: BookingRequest {
                id,
                instructor_id,
                client_email: "rider@example.com".into(),
                span: Span::new(start, end),
                status: BookingStatus::Pending,
                deposit_id: None,
                close_reason: None,
                created_at: 0,
                updated_at: 0,
            },
            hold: TentativeHold {
                id: Ulid::new(),
                booking_request_id: id,
                instructor_id,
                span: Span::new(start, end),
                status: HoldStatus::Pending,
                created_at: 0,
                expires_at,
            },
            deposit: None,
        }
    }

    fn with_deposit(mut e: BookingEntry, status: DepositStatus) -> BookingEntry {
        let deposit_id = Ulid::new();
        e.booking.deposit_id = Some(deposit_id);
        e.deposit = Some(Deposit {
            id: deposit_id,
            booking_request_id: e.booking.id,
            amount_cents: 5_000,
            status,
            payment_reference: "ref".into(),
        });
        e
    }

    #[test]
    fn overlapping_active_skips_disjoint_holds() {
        let iid = Ulid::new();
        let mut ledger = InstructorLedger::new(iid);
        ledger.insert_booking(entry(iid, 100, 200, 10_000));
        ledger.insert_booking(entry(iid, 450, 600, 10_000));
        ledger.insert_booking(entry(iid, 1000, 1100, 10_000));

        let hits: Vec<_> = ledger.overlapping_active(&Span::new(500, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].hold.span, Span::new(450, 600));

        // Half-open: a hold ending at query.start does not overlap.
        assert_eq!(ledger.overlapping_active(&Span::new(200, 300)).count(), 0);
    }

    #[test]
    fn released_hold_leaves_active_index() {
        let iid = Ulid::new();
        let mut ledger = InstructorLedger::new(iid);
        let e = entry(iid, 100, 200, 10_000);
        let booking_id = e.booking.id;
        ledger.insert_booking(e);

        ledger.apply(&Event::BookingClosed {
            instructor_id: iid,
            booking_id,
            booking: BookingStatus::Cancelled,
            hold: HoldStatus::Released,
            deposit: None,
            reason: CloseReason::HoldReleased,
            at: 150,
        });
        assert_eq!(ledger.overlapping_active(&Span::new(0, 1000)).count(), 0);
        assert_eq!(ledger.booking(&booking_id).map(|e| e.hold.status), Some(HoldStatus::Released));
    }

    #[test]
    fn blocking_rules() {
        let iid = Ulid::new();
        let pending = entry(iid, 100, 200, 1_000);
        assert!(pending.blocks(1_000));
        assert!(!pending.blocks(1_001));
        assert!(pending.is_stale(1_001));

        let held = with_deposit(entry(iid, 100, 200, 1_000), DepositStatus::Held);
        assert!(held.blocks(5_000));
        assert!(!held.is_stale(5_000));

        let unpaid = with_deposit(entry(iid, 100, 200, 1_000), DepositStatus::Pending);
        assert!(unpaid.is_stale(5_000));

        let mut confirmed = entry(iid, 100, 200, 1_000);
        confirmed.hold.status = HoldStatus::Confirmed;
        assert!(confirmed.blocks(i64::MAX));
    }

    #[test]
    fn closing_cascades_atomically() {
        let iid = Ulid::new();
        let mut ledger = InstructorLedger::new(iid);
        let e = with_deposit(entry(iid, 100, 200, 1_000), DepositStatus::Pending);
        let booking_id = e.booking.id;
        let deposit_id = e.booking.deposit_id.unwrap();
        ledger.insert_booking(e);

        ledger.apply(&Event::BookingClosed {
            instructor_id: iid,
            booking_id,
            booking: BookingStatus::Cancelled,
            hold: HoldStatus::Expired,
            deposit: Some(DepositStatus::Expired),
            reason: CloseReason::HoldExpired,
            at: 2_000,
        });

        let closed = ledger.booking_for_deposit(&deposit_id).unwrap();
        assert_eq!(closed.booking.status, BookingStatus::Cancelled);
        assert_eq!(closed.booking.close_reason, Some(CloseReason::HoldExpired));
        assert_eq!(closed.hold.status, HoldStatus::Expired);
        assert_eq!(closed.deposit_status(), Some(DepositStatus::Expired));
        assert!(ledger.busy_intervals(&Span::new(0, 1000), 0).is_empty());
    }

    #[test]
    fn busy_intervals_only_report_blocking_holds() {
        let iid = Ulid::new();
        let mut ledger = InstructorLedger::new(iid);
        ledger.insert_booking(entry(iid, 100, 200, 1_000));
        ledger.insert_booking(entry(iid, 300, 400, 5_000));

        let busy = ledger.busy_intervals(&Span::new(0, 1000), 2_000);
        assert_eq!(busy.len(), 1);
        assert_eq!(busy[0].span, Span::new(300, 400));
        assert_eq!(busy[0].source, BusySource::Booking);
    }
}
