use crate::model::Ms;

pub const MAX_SLOT_RANGE_DAYS: i64 = 90;
pub const MAX_SLOT_MINUTES: u32 = 1440;
pub const MAX_BOOKING_DURATION_MS: Ms = 24 * 3_600_000;
pub const MAX_EMAIL_LEN: usize = 254;
pub const MAX_BOOKINGS_PER_INSTRUCTOR: usize = 100_000;
pub const MAX_BUSY_INTERVALS_PER_PUSH: usize = 10_000;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;
