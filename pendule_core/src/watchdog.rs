//! Command watchdog for the serve loop.

use std::time::Duration;

use crate::util::duration_us;

/// Zeroes the applied command when the remote controller goes quiet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandWatchdog {
    max_missed: u64,
}

/// Number of consecutive missed reads tolerated before the watchdog trips.
///
/// Parameters:
/// - `period`: control period. A zero period is treated as 1 µs.
/// - `idle`: longest tolerated gap between commands.
///
/// The count is `1 + idle / period` in whole microseconds, so at least one
/// missed period is always tolerated (51 for a 1 s idle at 20 ms).
#[inline]
pub fn max_missed_messages(period: Duration, idle: Duration) -> u64 {
    let period_us = duration_us(period).max(1);
    1 + duration_us(idle) / period_us
}

impl CommandWatchdog {
    pub fn new(period: Duration, idle: Duration) -> Self {
        Self {
            max_missed: max_missed_messages(period, idle),
        }
    }

    /// Default one-second idle allowance.
    pub fn from_period(period: Duration) -> Self {
        Self::new(period, Duration::from_secs(1))
    }

    pub fn max_missed(&self) -> u64 {
        self.max_missed
    }

    /// True once `missed` exceeds the tolerated count.
    #[inline]
    pub fn expired(&self, missed: u64) -> bool {
        missed > self.max_missed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trips_strictly_after_the_allowance() {
        let w = CommandWatchdog::from_period(Duration::from_millis(20));
        assert_eq!(w.max_missed(), 51);
        assert!(!w.expired(51));
        assert!(w.expired(52));
    }
}
