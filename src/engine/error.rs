use ulid::Ulid;

use crate::calendar::CalendarError;
use crate::model::{BookingStatus, HoldStatus, Span};
use crate::payment::GatewayError;

#[derive(Debug)]
pub enum EngineError {
    InvalidRange(&'static str),
    InvalidInput(String),
    NotFound(Ulid),
    HoldNotFound(Ulid),
    AlreadyExists(Ulid),
    /// Another active hold (or external calendar time) occupies the span.
    SlotUnavailable {
        conflicting: Option<Ulid>,
    },
    OutsideWorkingHours(Span),
    InvalidTransition {
        booking_id: Ulid,
        hold: HoldStatus,
    },
    InvalidStatus {
        from: BookingStatus,
        to: BookingStatus,
    },
    BookingInactive(BookingStatus),
    HoldExpired(Ulid),
    NotAuthorized,
    LimitExceeded(&'static str),
    Gateway(String),
    Calendar(String),
    WalError(String),
}

/// How callers should treat an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Conflict,
    NotFound,
    Authorization,
    /// Store or collaborator unavailable; safe to retry.
    Transient,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidRange(_)
            | EngineError::InvalidInput(_)
            | EngineError::LimitExceeded(_) => ErrorKind::Validation,
            EngineError::AlreadyExists(_)
            | EngineError::SlotUnavailable { .. }
            | EngineError::OutsideWorkingHours(_)
            | EngineError::InvalidTransition { .. }
            | EngineError::InvalidStatus { .. }
            | EngineError::BookingInactive(_)
            | EngineError::HoldExpired(_) => ErrorKind::Conflict,
            EngineError::NotFound(_) | EngineError::HoldNotFound(_) => ErrorKind::NotFound,
            EngineError::NotAuthorized => ErrorKind::Authorization,
            EngineError::Gateway(_) | EngineError::Calendar(_) | EngineError::WalError(_) => {
                ErrorKind::Transient
            }
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidRange(_) => "invalid_range",
            EngineError::InvalidInput(_) => "invalid_input",
            EngineError::NotFound(_) => "not_found",
            EngineError::HoldNotFound(_) => "hold_not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::SlotUnavailable { .. } => "slot_unavailable",
            EngineError::OutsideWorkingHours(_) => "outside_working_hours",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::InvalidStatus { .. } => "invalid_status",
            EngineError::BookingInactive(_) => "booking_inactive",
            EngineError::HoldExpired(_) => "hold_expired",
            EngineError::NotAuthorized => "not_authorized",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::Gateway(_) => "payment_gateway_unavailable",
            EngineError::Calendar(_) => "calendar_unavailable",
            EngineError::WalError(_) => "store_unavailable",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidRange(msg) => write!(f, "invalid range: {msg}"),
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::HoldNotFound(id) => write!(f, "no hold for booking {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::SlotUnavailable { conflicting: Some(id) } => {
                write!(f, "slot no longer available: held by booking {id}")
            }
            EngineError::SlotUnavailable { conflicting: None } => {
                write!(f, "slot no longer available: instructor calendar is busy")
            }
            EngineError::OutsideWorkingHours(span) => write!(
                f,
                "[{}, {}) is outside the instructor's working hours",
                span.start, span.end
            ),
            EngineError::InvalidTransition { booking_id, hold } => write!(
                f,
                "hold for booking {booking_id} is {hold:?}, expected Pending"
            ),
            EngineError::InvalidStatus { from, to } => write!(
                f,
                "cannot move booking from {} to {}",
                from.as_str(),
                to.as_str()
            ),
            EngineError::BookingInactive(status) => {
                write!(f, "booking is {} and can no longer change", status.as_str())
            }
            EngineError::HoldExpired(id) => write!(f, "hold for booking {id} has expired"),
            EngineError::NotAuthorized => write!(f, "not authorized for this booking"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Gateway(e) => write!(f, "payment gateway error: {e}"),
            EngineError::Calendar(e) => write!(f, "calendar provider error: {e}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<GatewayError> for EngineError {
    fn from(e: GatewayError) -> Self {
        EngineError::Gateway(e.to_string())
    }
}

impl From<CalendarError> for EngineError {
    fn from(e: CalendarError) -> Self {
        EngineError::Calendar(e.to_string())
    }
}
