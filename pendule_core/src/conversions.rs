//! `From` implementations bridging `pendule_config` types to core parameters.

use std::time::Duration;

use crate::plant::{CalibrationParams, PlantParams, PwmOffsets};
use crate::runner::ServeCfg;
use crate::switch::SwitchParams;
use crate::util::period_from_ms;

// ── Switches ─────────────────────────────────────────────────────────────────

impl From<&pendule_config::SwitchCfg> for SwitchParams {
    fn from(c: &pendule_config::SwitchCfg) -> Self {
        Self {
            pin: c.pin,
            normally_up: c.normally_up,
            use_internal_resistor: c.use_internal_pull_resistor,
            debounce_us: c.debounce_us,
        }
    }
}

// ── Plant ────────────────────────────────────────────────────────────────────

impl From<&pendule_config::Config> for PlantParams {
    fn from(c: &pendule_config::Config) -> Self {
        Self {
            meters_per_step: c.meters_per_step,
            radians_per_step: c.radians_per_step,
            safety_margin_meters: c.safety_thresholds.hard,
            rest_angle_offset: c.angle_offset,
        }
    }
}

impl From<&pendule_config::PwmOffsets> for PwmOffsets {
    fn from(c: &pendule_config::PwmOffsets) -> Self {
        Self::new(c.low, c.high, c.static_)
    }
}

impl From<&pendule_config::CalibrationCfg> for CalibrationParams {
    fn from(c: &pendule_config::CalibrationCfg) -> Self {
        Self {
            settle: Duration::from_millis(c.settle_ms),
            timeout: Duration::from_millis(c.timeout_ms),
            poll: Duration::from_millis(c.poll_ms.max(1)),
            center_poll: Duration::from_millis(c.center_poll_ms.max(1)),
        }
    }
}

// ── Serve loop ───────────────────────────────────────────────────────────────

impl From<&pendule_config::Config> for ServeCfg {
    fn from(c: &pendule_config::Config) -> Self {
        Self {
            period: period_from_ms(c.period_ms),
            command_wait: Duration::from_millis(c.serve.command_wait_ms),
            soft_threshold_meters: c.safety_thresholds.soft,
            warmup: Duration::from_millis(c.serve.warmup_ms),
            watchdog_idle: Duration::from_millis(c.watchdog.idle_ms),
            max_periods: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_maps_to_stock_parameters() {
        let cfg = pendule_config::load_toml(pendule_config::template()).unwrap();
        let plant = PlantParams::from(&cfg);
        assert_eq!(plant, PlantParams::default());
        let serve = ServeCfg::from(&cfg);
        assert_eq!(serve.period, Duration::from_millis(20));
        assert_eq!(serve.command_wait, Duration::ZERO);
        assert_eq!(serve.watchdog_idle, Duration::from_secs(1));
        let sw = SwitchParams::from(&cfg.left_switch);
        assert_eq!(sw, SwitchParams::new(17));
    }
}
