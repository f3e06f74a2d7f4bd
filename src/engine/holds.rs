use serde::Serialize;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::conflict::{check_no_conflict, check_within_working_hours, validate_email, validate_span};
use super::{BookingEntry, Engine, EngineError};

/// A client's request to reserve `span` with `instructor_id`.
#[derive(Debug, Clone)]
pub struct HoldRequest {
    pub booking_request_id: Ulid,
    pub instructor_id: Ulid,
    pub span: Span,
    pub client_email: String,
    /// `None` or zero means no deposit is taken.
    pub deposit_amount_cents: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseOutcome {
    Released,
    /// The hold was already released or expired.
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AcceptBlocker {
    Expired,
    AlreadyConfirmed,
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AcceptCheck {
    pub can_accept: bool,
    pub reason: Option<AcceptBlocker>,
}

impl AcceptCheck {
    const OK: AcceptCheck = AcceptCheck {
        can_accept: true,
        reason: None,
    };

    fn blocked(reason: AcceptBlocker) -> Self {
        Self {
            can_accept: false,
            reason: Some(reason),
        }
    }

    /// The error an accept attempt fails with, if blocked.
    pub(super) fn into_result(self, booking_id: Ulid, hold: HoldStatus) -> Result<(), EngineError> {
        match self.reason {
            None => Ok(()),
            Some(AcceptBlocker::Expired) => Err(EngineError::HoldExpired(booking_id)),
            Some(AcceptBlocker::AlreadyConfirmed) => {
                Err(EngineError::InvalidTransition { booking_id, hold })
            }
            Some(AcceptBlocker::NotFound) => Err(EngineError::HoldNotFound(booking_id)),
        }
    }
}

/// Whether the instructor may still accept the booking at `now`.
pub(super) fn accept_check(entry: Option<&BookingEntry>, now: Ms) -> AcceptCheck {
    let Some(entry) = entry else {
        return AcceptCheck::blocked(AcceptBlocker::NotFound);
    };
    match entry.hold.status {
        HoldStatus::Released => AcceptCheck::blocked(AcceptBlocker::NotFound),
        // A hold confirmed ahead of acceptance already owns its span.
        HoldStatus::Confirmed if entry.booking.status == BookingStatus::Pending => AcceptCheck::OK,
        HoldStatus::Confirmed => AcceptCheck::blocked(AcceptBlocker::AlreadyConfirmed),
        HoldStatus::Expired => AcceptCheck::blocked(AcceptBlocker::Expired),
        // A held deposit keeps the span blocked past expiry, but the offer itself has lapsed.
        HoldStatus::Pending if entry.hold.is_expired(now) => AcceptCheck::blocked(AcceptBlocker::Expired),
        HoldStatus::Pending => AcceptCheck::OK,
    }
}

impl Engine {
    /// Reserve a span for a new booking request.
    ///
    /// Everything from the working-hours check to the log append runs under the
    /// instructor's write lock, so two overlapping requests cannot both pass
    /// the conflict check.
    pub async fn place_hold(&self, req: HoldRequest) -> Result<BookingEntry, EngineError> {
        let now = self.now();
        let span = req.span;
        validate_span(&span)?;
        validate_email(&req.client_email)?;
        if span.start < now {
            return Err(EngineError::InvalidRange("booking starts in the past"));
        }
        if self.instructor_for(&req.booking_request_id).is_some() {
            return Err(EngineError::AlreadyExists(req.booking_request_id));
        }
        let ledger = self
            .ledger(&req.instructor_id)
            .ok_or(EngineError::OutsideWorkingHours(span))?;

        // Calendar data is eventually consistent anyway; read it outside the lock.
        let calendar_busy = self.calendar.busy_intervals(req.instructor_id, span).await?;
        if calendar_busy.iter().any(|busy| busy.overlaps(&span)) {
            metrics::counter!(observability::HOLD_CONFLICTS_TOTAL, "source" => "calendar").increment(1);
            debug!(instructor_id = %req.instructor_id, "hold rejected: calendar busy");
            return Err(EngineError::SlotUnavailable { conflicting: None });
        }

        let mut guard = ledger.write().await;
        if self.instructor_for(&req.booking_request_id).is_some() {
            return Err(EngineError::AlreadyExists(req.booking_request_id));
        }
        if guard.booking_count() >= MAX_BOOKINGS_PER_INSTRUCTOR {
            return Err(EngineError::LimitExceeded("too many bookings for instructor"));
        }
        check_within_working_hours(&guard.hours, &span)?;

        let stale = match check_no_conflict(&guard, &span, now) {
            Ok(stale) => stale,
            Err(e) => {
                metrics::counter!(observability::HOLD_CONFLICTS_TOTAL, "source" => "booking").increment(1);
                debug!(instructor_id = %req.instructor_id, "hold rejected: {e}");
                return Err(e);
            }
        };
        for booking_id in stale {
            self.close_booking(
                &mut guard,
                booking_id,
                BookingStatus::Cancelled,
                HoldStatus::Expired,
                CloseReason::HoldExpired,
            )
            .await?;
            metrics::counter!(observability::HOLDS_EXPIRED_TOTAL).increment(1);
            info!(%booking_id, "reclaimed stale hold");
        }

        let deposit = match req.deposit_amount_cents.filter(|cents| *cents > 0) {
            Some(amount_cents) => {
                let deposit_id = Ulid::new();
                let payment_reference = self.gateway.create_intent(deposit_id, amount_cents).await?;
                Some(Deposit {
                    id: deposit_id,
                    booking_request_id: req.booking_request_id,
                    amount_cents,
                    status: DepositStatus::Pending,
                    payment_reference,
                })
            }
            None => None,
        };

        let booking = BookingRequest {
            id: req.booking_request_id,
            instructor_id: req.instructor_id,
            client_email: req.client_email,
            span,
            status: BookingStatus::Pending,
            deposit_id: deposit.as_ref().map(|d| d.id),
            close_reason: None,
            created_at: now,
            updated_at: now,
        };
        let hold = TentativeHold {
            id: Ulid::new(),
            booking_request_id: booking.id,
            instructor_id: booking.instructor_id,
            span,
            status: HoldStatus::Pending,
            created_at: now,
            expires_at: now + self.policy.hold_window,
        };
        let entry = BookingEntry {
            booking: booking.clone(),
            hold: hold.clone(),
            deposit: deposit.clone(),
        };
        let event = Event::BookingRequested {
            booking,
            hold,
            deposit,
        };
        self.persist_and_apply(&mut guard, &event).await?;

        metrics::counter!(observability::HOLDS_PLACED_TOTAL).increment(1);
        info!(
            booking_id = %entry.booking.id,
            instructor_id = %entry.booking.instructor_id,
            expires_at = entry.hold.expires_at,
            "hold placed"
        );
        Ok(entry)
    }

    /// Move a pending hold to confirmed without touching the booking status.
    pub async fn confirm_booking(&self, booking_id: Ulid) -> Result<BookingEntry, EngineError> {
        let (instructor_id, mut guard) = self.resolve_hold_write(&booking_id).await?;
        let entry = guard
            .booking(&booking_id)
            .ok_or(EngineError::HoldNotFound(booking_id))?;
        if entry.hold.status != HoldStatus::Pending {
            return Err(EngineError::InvalidTransition {
                booking_id,
                hold: entry.hold.status,
            });
        }
        if entry.is_stale(self.now()) {
            return Err(EngineError::HoldExpired(booking_id));
        }

        let event = Event::HoldConfirmed {
            instructor_id,
            booking_id,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        guard
            .booking(&booking_id)
            .cloned()
            .ok_or(EngineError::HoldNotFound(booking_id))
    }

    /// Release a pending hold, cancelling its pending booking and settling the
    /// deposit. Releasing twice is a no-op.
    pub async fn release_tentative_blocks(&self, booking_id: Ulid) -> Result<ReleaseOutcome, EngineError> {
        let (_, mut guard) = self.resolve_hold_write(&booking_id).await?;
        let hold_status = guard
            .booking(&booking_id)
            .map(|entry| entry.hold.status)
            .ok_or(EngineError::HoldNotFound(booking_id))?;

        match hold_status {
            HoldStatus::Pending => {
                // A pending hold always belongs to a pending booking, which goes with it.
                self.close_booking(
                    &mut guard,
                    booking_id,
                    BookingStatus::Cancelled,
                    HoldStatus::Released,
                    CloseReason::HoldReleased,
                )
                .await?;
                debug!(%booking_id, "hold released");
                Ok(ReleaseOutcome::Released)
            }
            HoldStatus::Released | HoldStatus::Expired => Ok(ReleaseOutcome::Unchanged),
            HoldStatus::Confirmed => Err(EngineError::InvalidTransition {
                booking_id,
                hold: hold_status,
            }),
        }
    }

    pub async fn can_accept_booking(&self, booking_id: Ulid) -> AcceptCheck {
        let Some(ledger) = self
            .instructor_for(&booking_id)
            .and_then(|instructor_id| self.ledger(&instructor_id))
        else {
            return accept_check(None, self.now());
        };
        let guard = ledger.read().await;
        accept_check(guard.booking(&booking_id), self.now())
    }

    async fn resolve_hold_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<super::InstructorLedger>), EngineError> {
        self.resolve_entity_write(booking_id).await.map_err(|e| match e {
            EngineError::NotFound(_) => EngineError::HoldNotFound(*booking_id),
            other => other,
        })
    }
}
