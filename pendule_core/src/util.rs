//! Common time/period helpers for pendule_core.

use std::time::Duration;

/// Number of microseconds in one second.
pub const MICROS_PER_SEC: u64 = 1_000_000;
/// Number of milliseconds in one second.
pub const MILLIS_PER_SEC: u64 = 1_000;

/// Control period for a period given in milliseconds.
/// - Clamps `ms` to at least 1 to avoid a zero period.
#[inline]
pub fn period_from_ms(ms: u64) -> Duration {
    Duration::from_millis(ms.max(1))
}

/// Control rate in Hz for a given period.
/// - Returns 0.0 for a zero period.
#[inline]
pub fn rate_hz(period: Duration) -> f64 {
    let s = period.as_secs_f64();
    if s > 0.0 { 1.0 / s } else { 0.0 }
}

/// Whole microseconds in `d`, saturating at `u64::MAX`.
#[inline]
pub fn duration_us(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}

/// Milliseconds to wait for a command, as the signed value the channel
/// expects (0 means "poll once").
#[inline]
pub fn wait_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}
