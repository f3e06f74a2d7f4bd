use serde::Serialize;
use tracing::{debug, info};
use ulid::Ulid;

use crate::model::*;
use crate::observability;

use super::holds::accept_check;
use super::{BookingEntry, Engine, EngineError, InstructorLedger};

/// Who is asking for a change. Identity is established upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    Client { email: String },
    Instructor { id: Ulid },
    Admin,
}

impl Actor {
    fn cancel_reason(&self) -> CloseReason {
        match self {
            Actor::Client { .. } => CloseReason::ClientCancelled,
            Actor::Instructor { .. } => CloseReason::InstructorCancelled,
            Actor::Admin => CloseReason::AdminCancelled,
        }
    }
}

/// What an actor may do to one booking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub accept: bool,
    pub reject: bool,
    pub cancel: bool,
    pub complete: bool,
}

impl Capabilities {
    pub fn any(&self) -> bool {
        self.accept || self.reject || self.cancel || self.complete
    }

    pub fn allows(&self, target: BookingStatus) -> bool {
        match target {
            BookingStatus::Accepted => self.accept,
            BookingStatus::Rejected => self.reject,
            BookingStatus::Cancelled => self.cancel,
            BookingStatus::Completed => self.complete,
            BookingStatus::Pending => false,
        }
    }
}

pub fn can_act_on(actor: &Actor, booking: &BookingRequest) -> Capabilities {
    match actor {
        Actor::Instructor { id } if *id == booking.instructor_id => Capabilities {
            accept: true,
            reject: true,
            cancel: true,
            complete: true,
        },
        Actor::Admin => Capabilities {
            cancel: true,
            complete: true,
            ..Capabilities::default()
        },
        Actor::Client { email } if email.eq_ignore_ascii_case(&booking.client_email) => Capabilities {
            cancel: true,
            ..Capabilities::default()
        },
        _ => Capabilities::default(),
    }
}

/// Working hours may be edited by the instructor themselves or an admin.
pub fn can_manage_schedule(actor: &Actor, instructor_id: Ulid) -> bool {
    match actor {
        Actor::Admin => true,
        Actor::Instructor { id } => *id == instructor_id,
        Actor::Client { .. } => false,
    }
}

/// Result of feeding a gateway event into the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PaymentOutcome {
    pub booking_id: Ulid,
    pub booking: BookingStatus,
    pub deposit: DepositStatus,
}

impl Engine {
    /// Drive a booking through its state machine on behalf of `actor`.
    pub async fn transition(
        &self,
        booking_id: Ulid,
        actor: &Actor,
        target: BookingStatus,
    ) -> Result<BookingEntry, EngineError> {
        let (instructor_id, mut guard) = self.resolve_entity_write(&booking_id).await?;
        let entry = guard
            .booking(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        let from = entry.booking.status;

        let caps = can_act_on(actor, &entry.booking);
        if !caps.any() {
            return Err(EngineError::NotAuthorized);
        }
        if from.is_terminal() {
            return Err(EngineError::BookingInactive(from));
        }
        if !from.can_transition_to(target) {
            return Err(EngineError::InvalidStatus { from, to: target });
        }
        if !caps.allows(target) {
            return Err(EngineError::NotAuthorized);
        }

        let now = self.now();
        match target {
            BookingStatus::Accepted => {
                accept_check(Some(&entry), now).into_result(booking_id, entry.hold.status)?;
                let deposit = match &entry.deposit {
                    Some(d) if d.status == DepositStatus::Held => {
                        self.gateway.capture(d.id, d.amount_cents).await?;
                        Some(DepositStatus::Captured)
                    }
                    other => other.as_ref().map(|d| d.status),
                };
                let event = Event::BookingAccepted {
                    instructor_id,
                    booking_id,
                    deposit,
                    at: now,
                };
                self.persist_and_apply(&mut guard, &event).await?;
            }
            BookingStatus::Rejected => {
                self.close_booking(
                    &mut guard,
                    booking_id,
                    BookingStatus::Rejected,
                    HoldStatus::Released,
                    CloseReason::InstructorRejected,
                )
                .await?;
            }
            BookingStatus::Cancelled => {
                self.close_booking(
                    &mut guard,
                    booking_id,
                    BookingStatus::Cancelled,
                    HoldStatus::Released,
                    actor.cancel_reason(),
                )
                .await?;
            }
            BookingStatus::Completed => {
                let event = Event::BookingCompleted {
                    instructor_id,
                    booking_id,
                    at: now,
                };
                self.persist_and_apply(&mut guard, &event).await?;
            }
            BookingStatus::Pending => return Err(EngineError::InvalidStatus { from, to: target }),
        }

        metrics::counter!(observability::BOOKING_TRANSITIONS_TOTAL, "to" => target.as_str()).increment(1);
        info!(%booking_id, from = from.as_str(), to = target.as_str(), "booking transition");
        guard
            .booking(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))
    }

    /// Close a booking with its hold and deposit in one record.
    ///
    /// Money already received is refunded before anything is written; if the
    /// gateway fails the ledger is left untouched.
    pub(super) async fn close_booking(
        &self,
        ledger: &mut InstructorLedger,
        booking_id: Ulid,
        booking: BookingStatus,
        hold: HoldStatus,
        reason: CloseReason,
    ) -> Result<(), EngineError> {
        let entry = ledger
            .booking(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;

        if let Some(deposit) = &entry.deposit
            && deposit.status.needs_refund()
        {
            self.gateway.refund(deposit.id, deposit.amount_cents, reason).await?;
        }

        let event = Event::BookingClosed {
            instructor_id: ledger.instructor_id,
            booking_id,
            booking,
            hold: if entry.hold.status.is_active() {
                hold
            } else {
                entry.hold.status
            },
            deposit: entry.deposit_status().map(|status| status.on_close(reason)),
            reason,
            at: self.now(),
        };
        self.persist_and_apply(ledger, &event).await?;
        debug!(%booking_id, reason = reason.as_str(), "booking closed");
        Ok(())
    }

    /// Expire a pending booking whose hold ran out. `None` if it no longer qualifies.
    pub async fn expire_hold(&self, booking_id: Ulid) -> Result<Option<BookingEntry>, EngineError> {
        let (_, mut guard) = self.resolve_entity_write(&booking_id).await?;
        let now = self.now();
        let due = guard.booking(&booking_id).is_some_and(|entry| {
            entry.booking.status == BookingStatus::Pending
                && entry.hold.status == HoldStatus::Pending
                && entry.hold.is_expired(now)
        });
        if !due {
            return Ok(None);
        }

        self.close_booking(
            &mut guard,
            booking_id,
            BookingStatus::Cancelled,
            HoldStatus::Expired,
            CloseReason::HoldExpired,
        )
        .await?;
        metrics::counter!(observability::HOLDS_EXPIRED_TOTAL).increment(1);
        Ok(guard.booking(&booking_id).cloned())
    }

    /// The gateway reports the client paid the deposit.
    pub async fn on_payment_succeeded(&self, deposit_id: Ulid) -> Result<PaymentOutcome, EngineError> {
        let (instructor_id, mut guard) = self.resolve_entity_write(&deposit_id).await?;
        let entry = guard
            .booking_for_deposit(&deposit_id)
            .cloned()
            .ok_or(EngineError::NotFound(deposit_id))?;
        let Some(deposit) = entry.deposit.clone() else {
            return Err(EngineError::NotFound(deposit_id));
        };
        let booking_id = entry.booking.id;
        let now = self.now();

        let outcome = match (deposit.status, entry.booking.status) {
            (DepositStatus::Pending, BookingStatus::Pending)
                if entry.hold.status == HoldStatus::Confirmed
                    || (entry.hold.status == HoldStatus::Pending && !entry.hold.is_expired(now)) =>
            {
                let event = Event::DepositUpdated {
                    instructor_id,
                    booking_id,
                    deposit: DepositStatus::Held,
                    hold_expires_at: entry.hold.expires_at.max(now + self.policy.acceptance_window),
                };
                self.persist_and_apply(&mut guard, &event).await?;
                "held"
            }
            (DepositStatus::Pending, BookingStatus::Pending) => {
                // Paid after the hold lapsed: return the money and close out.
                self.gateway
                    .refund(deposit.id, deposit.amount_cents, CloseReason::HoldExpired)
                    .await?;
                let event = Event::BookingClosed {
                    instructor_id,
                    booking_id,
                    booking: BookingStatus::Cancelled,
                    hold: if entry.hold.status.is_active() {
                        HoldStatus::Expired
                    } else {
                        entry.hold.status
                    },
                    deposit: Some(DepositStatus::Refunded),
                    reason: CloseReason::HoldExpired,
                    at: now,
                };
                self.persist_and_apply(&mut guard, &event).await?;
                "late_refunded"
            }
            (DepositStatus::Pending, BookingStatus::Accepted) => {
                self.gateway.capture(deposit.id, deposit.amount_cents).await?;
                let event = Event::DepositUpdated {
                    instructor_id,
                    booking_id,
                    deposit: DepositStatus::Captured,
                    hold_expires_at: entry.hold.expires_at,
                };
                self.persist_and_apply(&mut guard, &event).await?;
                "captured"
            }
            (DepositStatus::Pending | DepositStatus::Expired, _) => {
                let reason = entry.booking.close_reason.unwrap_or(CloseReason::HoldExpired);
                self.gateway.refund(deposit.id, deposit.amount_cents, reason).await?;
                let event = Event::DepositUpdated {
                    instructor_id,
                    booking_id,
                    deposit: DepositStatus::Refunded,
                    hold_expires_at: entry.hold.expires_at,
                };
                self.persist_and_apply(&mut guard, &event).await?;
                "late_refunded"
            }
            (DepositStatus::Held | DepositStatus::Captured | DepositStatus::Refunded, _) => "duplicate",
        };

        metrics::counter!(observability::PAYMENT_EVENTS_TOTAL, "outcome" => outcome).increment(1);
        info!(%deposit_id, %booking_id, outcome, "payment succeeded");
        payment_outcome(&guard, booking_id)
    }

    /// The gateway reports the deposit payment failed.
    pub async fn on_payment_failed(&self, deposit_id: Ulid) -> Result<PaymentOutcome, EngineError> {
        let (_, mut guard) = self.resolve_entity_write(&deposit_id).await?;
        let entry = guard
            .booking_for_deposit(&deposit_id)
            .cloned()
            .ok_or(EngineError::NotFound(deposit_id))?;
        let booking_id = entry.booking.id;

        let outcome = if entry.deposit_status() == Some(DepositStatus::Pending)
            && entry.booking.status == BookingStatus::Pending
        {
            self.close_booking(
                &mut guard,
                booking_id,
                BookingStatus::Cancelled,
                HoldStatus::Released,
                CloseReason::PaymentFailed,
            )
            .await?;
            "failed"
        } else {
            "ignored"
        };

        metrics::counter!(observability::PAYMENT_EVENTS_TOTAL, "outcome" => outcome).increment(1);
        info!(%deposit_id, %booking_id, outcome, "payment failed");
        payment_outcome(&guard, booking_id)
    }
}

fn payment_outcome(ledger: &InstructorLedger, booking_id: Ulid) -> Result<PaymentOutcome, EngineError> {
    let entry = ledger
        .booking(&booking_id)
        .ok_or(EngineError::NotFound(booking_id))?;
    let deposit = entry
        .deposit_status()
        .ok_or(EngineError::NotFound(booking_id))?;
    Ok(PaymentOutcome {
        booking_id,
        booking: entry.booking.status,
        deposit,
    })
}
