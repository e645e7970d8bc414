// Focused tests for period and watchdog helpers.
use std::time::Duration;

use pendule_core::CommandWatchdog;
use pendule_core::runner::clamp_to_soft_limits;
use pendule_core::util::{duration_us, period_from_ms, rate_hz, wait_ms};
use pendule_core::watchdog::max_missed_messages;
use rstest::rstest;

#[test]
fn period_from_ms_never_returns_zero() {
    assert_eq!(period_from_ms(20), Duration::from_millis(20));
    assert_eq!(period_from_ms(0), Duration::from_millis(1));
}

#[test]
fn rate_is_inverse_period() {
    assert!((rate_hz(Duration::from_millis(20)) - 50.0).abs() < 1e-9);
    assert_eq!(rate_hz(Duration::ZERO), 0.0);
}

#[test]
fn conversions_truncate_to_whole_units() {
    assert_eq!(duration_us(Duration::from_nanos(1_999)), 1);
    assert_eq!(wait_ms(Duration::from_micros(19_999)), 19);
    assert_eq!(wait_ms(Duration::ZERO), 0);
}

#[rstest]
#[case(20, 1_000, 51)]
#[case(20, 100, 6)]
#[case(20, 10, 1)]
#[case(20, 0, 1)]
#[case(0, 5, 5_001)]
fn missed_allowance(#[case] period_ms: u64, #[case] idle_ms: u64, #[case] expected: u64) {
    let n = max_missed_messages(
        Duration::from_millis(period_ms),
        Duration::from_millis(idle_ms),
    );
    assert_eq!(n, expected);
}

#[test]
fn watchdog_allows_at_least_one_missed_period() {
    let w = CommandWatchdog::new(Duration::from_millis(20), Duration::ZERO);
    assert!(!w.expired(1));
    assert!(w.expired(2));
}

#[rstest]
#[case(0.5, 100, 0.4, 0)]
#[case(0.5, -100, 0.4, -100)]
#[case(-0.5, -100, 0.4, 0)]
#[case(-0.5, 100, 0.4, 100)]
#[case(0.3, 100, 0.4, 100)]
#[case(0.4, 100, 0.4, 100)]
fn soft_clamp_only_blocks_outward_motion(
    #[case] position: f64,
    #[case] pwm: i32,
    #[case] max_position: f64,
    #[case] expected: i32,
) {
    assert_eq!(clamp_to_soft_limits(position, pwm, max_position), expected);
}
