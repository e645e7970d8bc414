//! Fixed-period serve loop: sample the plant, publish state, apply the
//! remote command.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use pendule_traits::Clock;

use crate::channel::{ChannelServer, Inbox, Outbox};
use crate::error::Result;
use crate::plant::PlantController;
use crate::util::{duration_us, wait_ms};
use crate::watchdog::CommandWatchdog;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ServeCfg {
    pub period: Duration,
    /// Upper bound on how long each period may wait for a command.
    pub command_wait: Duration,
    /// Distance inside the soft limit where outward commands are zeroed.
    /// Non-positive disables the clamp.
    pub soft_threshold_meters: f64,
    /// Pause before the first period.
    pub warmup: Duration,
    pub watchdog_idle: Duration,
    /// Stop cleanly after this many periods.
    pub max_periods: Option<u64>,
}

impl Default for ServeCfg {
    fn default() -> Self {
        Self {
            period: Duration::from_millis(20),
            command_wait: Duration::ZERO,
            soft_threshold_meters: 0.1,
            warmup: Duration::from_secs(1),
            watchdog_idle: Duration::from_secs(1),
            max_periods: None,
        }
    }
}

/// Counters and wake-up latency figures gathered by [`serve`].
#[derive(Debug, Clone, Default)]
pub struct LoopStats {
    pub iterations: u64,
    /// Periods that woke more than one period late.
    pub missed_deadlines: u64,
    pub watchdog_trips: u64,
    pub soft_limit_clamps: u64,
    pub saturated: u64,
    latency_min_us: Option<u64>,
    latency_max_us: u64,
    latency_sum_us: f64,
    latency_sum_sq_us: f64,
    samples: u64,
}

impl LoopStats {
    fn record_latency(&mut self, late: Duration) {
        let us = duration_us(late);
        self.latency_min_us = Some(self.latency_min_us.map_or(us, |m| m.min(us)));
        self.latency_max_us = self.latency_max_us.max(us);
        #[allow(clippy::cast_precision_loss)]
        let x = us as f64;
        self.latency_sum_us += x;
        self.latency_sum_sq_us += x * x;
        self.samples += 1;
    }

    pub fn latency_min_us(&self) -> u64 {
        self.latency_min_us.unwrap_or(0)
    }

    pub fn latency_max_us(&self) -> u64 {
        self.latency_max_us
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn latency_mean_us(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.latency_sum_us / self.samples as f64
        }
    }

    /// Population standard deviation of the wake-up latency.
    #[allow(clippy::cast_precision_loss)]
    pub fn latency_stdev_us(&self) -> f64 {
        if self.samples == 0 {
            return 0.0;
        }
        let n = self.samples as f64;
        let mean = self.latency_sum_us / n;
        (self.latency_sum_sq_us / n - mean * mean).max(0.0).sqrt()
    }
}

impl fmt::Display for LoopStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "iterations={} missed_deadlines={} latency_us(min/avg/max/stdev)={}/{:.1}/{}/{:.1} \
             watchdog_trips={} soft_limit_clamps={} saturated={}",
            self.iterations,
            self.missed_deadlines,
            self.latency_min_us(),
            self.latency_mean_us(),
            self.latency_max_us(),
            self.latency_stdev_us(),
            self.watchdog_trips,
            self.soft_limit_clamps,
            self.saturated
        )
    }
}

/// Zero `pwm` when it would push the cart further past `max_position`
/// (meters from the center, either side).
#[inline]
pub fn clamp_to_soft_limits(position: f64, pwm: i32, max_position: f64) -> i32 {
    if (position > max_position && pwm > 0) || (position < -max_position && pwm < 0) {
        0
    } else {
        pwm
    }
}

/// Run the loop on a calibrated plant until `shutdown` is raised,
/// `cfg.max_periods` elapse or an error (typically an emergency stop) occurs.
///
/// The motor is stopped on every exit path.
pub fn serve<O: Outbox, I: Inbox>(
    plant: &mut PlantController,
    channel: &mut ChannelServer<O, I>,
    clock: &dyn Clock,
    cfg: &ServeCfg,
    shutdown: &AtomicBool,
) -> Result<LoopStats> {
    let result = serve_inner(plant, channel, clock, cfg, shutdown);
    if let Err(e) = plant.halt() {
        tracing::warn!(error = %e, "failed to stop motor after serve loop");
    }
    result
}

fn serve_inner<O: Outbox, I: Inbox>(
    plant: &mut PlantController,
    channel: &mut ChannelServer<O, I>,
    clock: &dyn Clock,
    cfg: &ServeCfg,
    shutdown: &AtomicBool,
) -> Result<LoopStats> {
    let soft_limit = plant.soft_limit_meters()?;
    let max_position =
        (cfg.soft_threshold_meters > 0.0).then(|| soft_limit - cfg.soft_threshold_meters);
    let watchdog = CommandWatchdog::new(cfg.period, cfg.watchdog_idle);
    let dt = cfg.period.as_secs_f64();
    let mut stats = LoopStats::default();
    let mut watchdog_active = false;

    clock.sleep(cfg.warmup);
    tracing::info!(
        period_us = duration_us(cfg.period),
        soft_limit,
        max_missed = watchdog.max_missed(),
        "serve loop started"
    );

    let epoch = clock.now();
    let mut deadline = epoch + cfg.period;
    loop {
        if shutdown.load(Ordering::Acquire) {
            tracing::info!(iterations = stats.iterations, "serve loop stopping on request");
            break;
        }
        if cfg.max_periods.is_some_and(|n| stats.iterations >= n) {
            break;
        }

        clock.sleep_until(deadline);
        let now = clock.now();
        let late = now.saturating_duration_since(deadline);
        stats.record_latency(late);
        if late > cfg.period {
            stats.missed_deadlines += 1;
            tracing::debug!(late_us = duration_us(late), "deadline missed");
            deadline = now + cfg.period;
        } else {
            deadline += cfg.period;
        }

        plant.update(dt)?;
        let position = plant.position()?;
        channel.send_state(
            now.saturating_duration_since(epoch).as_secs_f64(),
            position,
            plant.angle()?,
            plant.linear_velocity()?,
            plant.angular_velocity()?,
        );

        let residual = deadline.saturating_duration_since(clock.now());
        channel.read_command(wait_ms(cfg.command_wait.min(residual)));
        let mut pwm = channel.command();

        if watchdog.expired(channel.missed_messages()) {
            if !watchdog_active {
                tracing::warn!(
                    missed = channel.missed_messages(),
                    "no command from controller; holding the motor at 0"
                );
                stats.watchdog_trips += 1;
                watchdog_active = true;
            }
            pwm = 0;
        } else {
            watchdog_active = false;
        }

        if let Some(max_position) = max_position {
            let clamped = clamp_to_soft_limits(position, pwm, max_position);
            if clamped != pwm {
                tracing::trace!(position, pwm, "command zeroed at soft limit");
                stats.soft_limit_clamps += 1;
            }
            pwm = clamped;
        }

        if !plant.set_command(pwm)? {
            stats.saturated += 1;
        }
        stats.iterations += 1;
    }
    tracing::info!(%stats, "serve loop finished");
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_figures() {
        let mut s = LoopStats::default();
        for us in [10, 20, 30] {
            s.record_latency(Duration::from_micros(us));
        }
        assert_eq!(s.latency_min_us(), 10);
        assert_eq!(s.latency_max_us(), 30);
        assert!((s.latency_mean_us() - 20.0).abs() < 1e-9);
        assert!((s.latency_stdev_us() - (200.0_f64 / 3.0).sqrt()).abs() < 1e-9);
    }

    #[test]
    fn empty_stats_print_zeroes() {
        let s = LoopStats::default();
        assert!(s.to_string().starts_with("iterations=0 missed_deadlines=0"));
    }
}
