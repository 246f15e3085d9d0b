//! On-disk time representation.
//!
//! Instants are persisted as 64-bit tick counts (100-nanosecond units
//! since 0001-01-01T00:00:00Z) so they round-trip exactly regardless of
//! the backend's date-time defaults. The representable maximum is the
//! "never expires" sentinel.

use chrono::{DateTime, Utc};

/// Ticks per second (one tick is 100 ns).
pub const TICKS_PER_SECOND: i64 = 10_000_000;

/// Nanoseconds per tick.
pub const NANOS_PER_TICK: i64 = 100;

/// Tick count of the Unix epoch (1970-01-01T00:00:00Z).
pub const UNIX_EPOCH_TICKS: i64 = 621_355_968_000_000_000;

/// Sentinel tick value meaning "never expires".
pub const NEVER_TICKS: i64 = i64::MAX;

/// Converts an instant to its on-disk tick count.
pub fn to_ticks(instant: DateTime<Utc>) -> i64 {
    let seconds = instant.timestamp();
    let sub_ticks = i64::from(instant.timestamp_subsec_nanos()) / NANOS_PER_TICK;
    UNIX_EPOCH_TICKS
        .saturating_add(seconds.saturating_mul(TICKS_PER_SECOND))
        .saturating_add(sub_ticks)
}

/// Converts an on-disk tick count back to an instant.
///
/// Returns `None` when the tick count is outside the representable range.
pub fn from_ticks(ticks: i64) -> Option<DateTime<Utc>> {
    let relative = ticks.checked_sub(UNIX_EPOCH_TICKS)?;
    let seconds = relative.div_euclid(TICKS_PER_SECOND);
    let nanos = (relative.rem_euclid(TICKS_PER_SECOND) * NANOS_PER_TICK) as u32;
    DateTime::from_timestamp(seconds, nanos)
}

/// Encodes an optional expiration, mapping `None` to [`NEVER_TICKS`].
pub fn expiration_to_ticks(expiration: Option<DateTime<Utc>>) -> i64 {
    expiration.map(to_ticks).unwrap_or(NEVER_TICKS)
}

/// Decodes an on-disk expiration, mapping [`NEVER_TICKS`] to `None`.
pub fn expiration_from_ticks(ticks: i64) -> Option<DateTime<Utc>> {
    if ticks == NEVER_TICKS {
        None
    } else {
        from_ticks(ticks)
    }
}
