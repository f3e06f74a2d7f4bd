use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only instant type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const MINUTES_PER_DAY: u16 = 1440;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Build a span from untrusted input.
    pub fn try_new(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

// ── Calendar helpers ─────────────────────────────────────────────

/// Midnight UTC of `date`.
pub fn day_start_ms(date: NaiveDate) -> Ms {
    date.and_time(NaiveTime::MIN).and_utc().timestamp_millis()
}

/// Day of week with 0 = Sunday.
pub fn day_of_week(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_sunday() as u8
}

/// UTC calendar date containing the instant `ms`.
pub fn date_of(ms: Ms) -> Option<NaiveDate> {
    DateTime::<Utc>::from_timestamp_millis(ms).map(|dt| dt.date_naive())
}

// ── Working hours ────────────────────────────────────────────────

/// One day's recurring window as submitted by an instructor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayWindow {
    pub day_of_week: u8,
    pub start_minute: u16,
    pub end_minute: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingHourRule {
    pub instructor_id: Ulid,
    /// 0 = Sunday … 6 = Saturday.
    pub day_of_week: u8,
    pub start_minute: u16,
    pub end_minute: u16,
}

impl WorkingHourRule {
    pub fn is_valid(&self) -> bool {
        self.day_of_week <= 6
            && self.start_minute < self.end_minute
            && self.end_minute <= MINUTES_PER_DAY
    }

    /// The rule's window on the day starting at `day_start`.
    pub fn window_on(&self, day_start: Ms) -> Span {
        Span::new(
            day_start + Ms::from(self.start_minute) * MINUTE_MS,
            day_start + Ms::from(self.end_minute) * MINUTE_MS,
        )
    }
}

/// Weekly availability of one instructor; at most one rule per weekday.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WeeklyHours([Option<WorkingHourRule>; 7]);

impl WeeklyHours {
    pub fn get(&self, day_of_week: u8) -> Option<&WorkingHourRule> {
        self.0.get(day_of_week as usize).and_then(Option::as_ref)
    }

    /// Insert or replace the rule for its weekday.
    pub fn upsert(&mut self, rule: WorkingHourRule) {
        if let Some(slot) = self.0.get_mut(rule.day_of_week as usize) {
            *slot = Some(rule);
        }
    }

    pub fn remove(&mut self, day_of_week: u8) -> Option<WorkingHourRule> {
        self.0.get_mut(day_of_week as usize).and_then(Option::take)
    }

    pub fn rules(&self) -> impl Iterator<Item = &WorkingHourRule> {
        self.0.iter().flatten()
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(Option::is_none)
    }
}

// ── Busy time and slots ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BusySource {
    Calendar,
    Booking,
}

/// Time an instructor cannot teach, merged at slot-generation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BusyInterval {
    pub span: Span,
    pub source: BusySource,
}

/// A bookable interval of exactly the requested slot length. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Slot {
    pub instructor_id: Ulid,
    pub start: Ms,
    pub end: Ms,
}

// ── Holds, bookings, deposits ────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldStatus {
    Pending,
    Confirmed,
    Released,
    Expired,
}

impl HoldStatus {
    /// Pending and confirmed holds occupy their span.
    pub fn is_active(self) -> bool {
        matches!(self, HoldStatus::Pending | HoldStatus::Confirmed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    Accepted,
    Rejected,
    Cancelled,
    Completed,
}

impl BookingStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BookingStatus::Rejected | BookingStatus::Cancelled | BookingStatus::Completed
        )
    }

    pub fn can_transition_to(self, target: BookingStatus) -> bool {
        matches!(
            (self, target),
            (
                BookingStatus::Pending,
                BookingStatus::Accepted | BookingStatus::Rejected | BookingStatus::Cancelled
            ) | (
                BookingStatus::Accepted,
                BookingStatus::Completed | BookingStatus::Cancelled
            )
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Accepted => "accepted",
            BookingStatus::Rejected => "rejected",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepositStatus {
    Pending,
    Held,
    Refunded,
    Captured,
    Expired,
}

impl DepositStatus {
    /// Money has reached us and must be returned when the booking closes.
    pub fn needs_refund(self) -> bool {
        matches!(self, DepositStatus::Held | DepositStatus::Captured)
    }

    /// Status a deposit ends in when its booking closes for `reason`.
    pub fn on_close(self, reason: CloseReason) -> DepositStatus {
        match self {
            DepositStatus::Pending => DepositStatus::Expired,
            DepositStatus::Held if reason == CloseReason::HoldExpired => DepositStatus::Expired,
            DepositStatus::Held | DepositStatus::Captured => DepositStatus::Refunded,
            settled => settled,
        }
    }
}

/// Why a booking ended up rejected or cancelled. Shown to both parties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    InstructorRejected,
    ClientCancelled,
    InstructorCancelled,
    AdminCancelled,
    HoldExpired,
    HoldReleased,
    PaymentFailed,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::InstructorRejected => "instructor_rejected",
            CloseReason::ClientCancelled => "client_cancelled",
            CloseReason::InstructorCancelled => "instructor_cancelled",
            CloseReason::AdminCancelled => "admin_cancelled",
            CloseReason::HoldExpired => "hold_expired",
            CloseReason::HoldReleased => "hold_released",
            CloseReason::PaymentFailed => "payment_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TentativeHold {
    pub id: Ulid,
    pub booking_request_id: Ulid,
    pub instructor_id: Ulid,
    pub span: Span,
    pub status: HoldStatus,
    pub created_at: Ms,
    pub expires_at: Ms,
}

impl TentativeHold {
    pub fn is_expired(&self, now: Ms) -> bool {
        now > self.expires_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingRequest {
    pub id: Ulid,
    pub instructor_id: Ulid,
    pub client_email: String,
    pub span: Span,
    pub status: BookingStatus,
    pub deposit_id: Option<Ulid>,
    pub close_reason: Option<CloseReason>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deposit {
    pub id: Ulid,
    pub booking_request_id: Ulid,
    pub amount_cents: u64,
    pub status: DepositStatus,
    /// Gateway reference the client uses to pay.
    pub payment_reference: String,
}

/// Ledger events, flat with no nesting. This is the WAL record format.
///
/// Every transition touching more than one of booking, hold and deposit is a
/// single record, so replay and readers never see a partial cascade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    WorkingHoursUpserted {
        instructor_id: Ulid,
        rules: Vec<WorkingHourRule>,
    },
    WorkingHoursRemoved {
        instructor_id: Ulid,
        day_of_week: u8,
    },
    BookingRequested {
        booking: BookingRequest,
        hold: TentativeHold,
        deposit: Option<Deposit>,
    },
    HoldConfirmed {
        instructor_id: Ulid,
        booking_id: Ulid,
    },
    BookingAccepted {
        instructor_id: Ulid,
        booking_id: Ulid,
        deposit: Option<DepositStatus>,
        at: Ms,
    },
    DepositUpdated {
        instructor_id: Ulid,
        booking_id: Ulid,
        deposit: DepositStatus,
        hold_expires_at: Ms,
    },
    BookingClosed {
        instructor_id: Ulid,
        booking_id: Ulid,
        booking: BookingStatus,
        hold: HoldStatus,
        deposit: Option<DepositStatus>,
        reason: CloseReason,
        at: Ms,
    },
    BookingCompleted {
        instructor_id: Ulid,
        booking_id: Ulid,
        at: Ms,
    },
}

impl Event {
    pub fn instructor_id(&self) -> Ulid {
        match self {
            Event::BookingRequested { booking, .. } => booking.instructor_id,
            Event::WorkingHoursUpserted { instructor_id, .. }
            | Event::WorkingHoursRemoved { instructor_id, .. }
            | Event::HoldConfirmed { instructor_id, .. }
            | Event::BookingAccepted { instructor_id, .. }
            | Event::DepositUpdated { instructor_id, .. }
            | Event::BookingClosed { instructor_id, .. }
            | Event::BookingCompleted { instructor_id, .. } => *instructor_id,
        }
    }
}
