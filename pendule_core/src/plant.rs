//! Cart-and-pendulum plant: calibration, state estimation and command shaping.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use pendule_traits::Clock;

use crate::actuator::{Actuator, PWM_RANGE};
use crate::encoder::{QuadratureEncoder, SafetyCallback};
use crate::error::{PlantError, Result};
use crate::fault::FaultLatch;
use crate::switch::{DebouncedSwitch, SwitchCallback};

/// Physical conversion factors, given per full quadrature cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlantParams {
    pub meters_per_step: f64,
    pub radians_per_step: f64,
    /// Distance kept between the hard position limits and the switches.
    pub safety_margin_meters: f64,
    pub rest_angle_offset: f64,
}

impl Default for PlantParams {
    fn default() -> Self {
        Self {
            meters_per_step: 9.992_676_761_711_276e-6,
            radians_per_step: 0.001_570_796_326_794_896_7,
            safety_margin_meters: 0.05,
            rest_angle_offset: 0.0,
        }
    }
}

/// Timing of the homing sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalibrationParams {
    /// How long the pendulum must hang still before homing starts.
    pub settle: Duration,
    /// Upper bound on each homing phase.
    pub timeout: Duration,
    pub poll: Duration,
    pub center_poll: Duration,
}

impl Default for CalibrationParams {
    fn default() -> Self {
        Self {
            settle: Duration::from_secs(1),
            timeout: Duration::from_secs(30),
            poll: Duration::from_millis(100),
            center_poll: Duration::from_millis(20),
        }
    }
}

/// Dead-band compensation added to every non-zero command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PwmOffsets {
    low: i32,
    high: i32,
    static_: i32,
}

impl PwmOffsets {
    /// `low` and `high` are magnitudes and are clamped to be non-negative.
    pub fn new(low: i32, high: i32, static_: i32) -> Self {
        Self {
            low: low.max(0),
            high: high.max(0),
            static_,
        }
    }

    pub fn low(&self) -> i32 {
        self.low
    }

    pub fn high(&self) -> i32 {
        self.high
    }

    pub fn static_offset(&self) -> i32 {
        self.static_
    }

    /// Shaped command and whether it fit the PWM range unsaturated.
    pub fn apply(&self, pwm: i32) -> (i32, bool) {
        if pwm == 0 {
            return (0, true);
        }
        let mut v = i64::from(pwm);
        if pwm > 0 {
            v += i64::from(self.high);
        } else {
            v -= i64::from(self.low);
        }
        v += i64::from(self.static_);
        let range = i64::from(PWM_RANGE);
        let clamped = v.clamp(-range, range);
        // clamped fits in ±255
        (i32::try_from(clamped).unwrap_or(0), clamped == v)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    SeekingRight,
    ReleasingRight,
    SeekingLeft,
    ReleasingLeft,
    Centering,
    Calibrated,
    EmergencyStopped,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Uninitialized => "uninitialized",
            Phase::SeekingRight => "seeking right switch",
            Phase::ReleasingRight => "releasing right switch",
            Phase::SeekingLeft => "seeking left switch",
            Phase::ReleasingLeft => "releasing left switch",
            Phase::Centering => "centering",
            Phase::Calibrated => "calibrated",
            Phase::EmergencyStopped => "emergency stopped",
        };
        f.write_str(s)
    }
}

/// Travel measured by the homing sequence, in position-encoder steps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    pub min_steps: i32,
    pub max_steps: i32,
    pub mid_steps: i32,
    pub margin_steps: i32,
    pub soft_limit_meters: f64,
}

#[derive(Debug, Default, Clone, Copy)]
struct Telemetry {
    position: f64,
    angle: f64,
    linear_velocity: f64,
    angular_velocity: f64,
}

/// Trips the plant's emergency stop from any thread.
///
/// Holds only a weak handle to the motor; once the plant is gone triggering
/// just latches.
#[derive(Debug, Clone)]
pub struct EstopHandle {
    latch: Arc<FaultLatch>,
    actuator: Weak<Actuator>,
}

impl EstopHandle {
    pub fn trigger(&self, reason: &str) {
        if self.latch.trip(reason) {
            tracing::error!(reason, "emergency stop");
        }
        if let Some(actuator) = self.actuator.upgrade()
            && let Err(e) = actuator.stop()
        {
            tracing::error!(error = %e, "failed to stop motor on emergency stop");
        }
    }

    pub fn is_tripped(&self) -> bool {
        self.latch.is_tripped()
    }

    fn callback(&self, reason: &'static str) -> SafetyCallback {
        let handle = self.clone();
        Arc::new(move || handle.trigger(reason))
    }
}

fn calibration_failed(msg: impl Into<String>) -> eyre::Report {
    eyre::Report::new(PlantError::CalibrationFailed(msg.into()))
}

#[allow(clippy::cast_precision_loss)]
#[inline]
fn steps_f64(s: i64) -> f64 {
    s as f64
}

pub struct PlantController {
    actuator: Arc<Actuator>,
    left: DebouncedSwitch,
    right: DebouncedSwitch,
    position_encoder: QuadratureEncoder,
    angle_encoder: QuadratureEncoder,
    clock: Arc<dyn Clock + Send + Sync>,
    latch: Arc<FaultLatch>,
    meters_per_step: f64,
    radians_per_step: f64,
    rest_angle_offset: f64,
    safety_margin_meters: f64,
    offsets: PwmOffsets,
    homing: CalibrationParams,
    phase: Phase,
    calibration: Option<Calibration>,
    telemetry: Telemetry,
    cancel: Option<Arc<AtomicBool>>,
}

impl std::fmt::Debug for PlantController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlantController")
            .field("phase", &self.phase())
            .field("calibration", &self.calibration)
            .field("offsets", &self.offsets)
            .finish_non_exhaustive()
    }
}

impl PlantController {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        actuator: Actuator,
        left: DebouncedSwitch,
        right: DebouncedSwitch,
        position_encoder: QuadratureEncoder,
        angle_encoder: QuadratureEncoder,
        clock: Arc<dyn Clock + Send + Sync>,
        params: PlantParams,
        offsets: PwmOffsets,
        homing: CalibrationParams,
    ) -> Self {
        tracing::debug!(?params, ?offsets, "creating plant controller");
        Self {
            actuator: Arc::new(actuator),
            left,
            right,
            position_encoder,
            angle_encoder,
            clock,
            latch: Arc::new(FaultLatch::new()),
            // One cycle spans four quadrature steps.
            meters_per_step: params.meters_per_step / 4.0,
            radians_per_step: params.radians_per_step / 4.0,
            rest_angle_offset: params.rest_angle_offset,
            safety_margin_meters: params.safety_margin_meters,
            offsets,
            homing,
            phase: Phase::Uninitialized,
            calibration: None,
            telemetry: Telemetry::default(),
            cancel: None,
        }
    }

    pub fn estop_handle(&self) -> EstopHandle {
        EstopHandle {
            latch: Arc::clone(&self.latch),
            actuator: Arc::downgrade(&self.actuator),
        }
    }

    /// Stop the motor and latch the emergency stop for good.
    pub fn estop(&self, reason: &str) {
        self.estop_handle().trigger(reason);
    }

    /// Stop the motor without latching.
    pub fn halt(&self) -> Result<()> {
        self.actuator.stop()
    }

    pub fn phase(&self) -> Phase {
        if self.latch.is_tripped() {
            Phase::EmergencyStopped
        } else {
            self.phase
        }
    }

    /// Homing fails with `PlantError::Aborted` once `flag` is raised.
    pub fn set_cancel_flag(&mut self, flag: Arc<AtomicBool>) {
        self.cancel = Some(flag);
    }

    pub fn is_calibrated(&self) -> bool {
        self.calibration.is_some()
    }

    pub fn is_emergency_stopped(&self) -> bool {
        self.latch.is_tripped()
    }

    pub fn fault_reason(&self) -> Option<String> {
        self.latch.reason()
    }

    /// Per-step factor, i.e. a quarter of the configured per-cycle value.
    pub fn meters_per_step(&self) -> f64 {
        self.meters_per_step
    }

    pub fn radians_per_step(&self) -> f64 {
        self.radians_per_step
    }

    pub fn pwm_offsets(&self) -> PwmOffsets {
        self.offsets
    }

    pub fn set_pwm_offsets(&mut self, offsets: PwmOffsets) {
        tracing::debug!(?offsets, "pwm offsets updated");
        self.offsets = offsets;
    }

    /// Last value written to the motor.
    pub fn applied_pwm(&self) -> i32 {
        self.actuator.pwm()
    }

    pub fn position_steps(&self) -> i32 {
        self.position_encoder.steps()
    }

    pub fn angle_steps(&self) -> i32 {
        self.angle_encoder.steps()
    }

    fn ready(&self, what: &'static str) -> Result<Calibration> {
        self.latch.check()?;
        self.calibration
            .ok_or_else(|| eyre::Report::new(PlantError::NotCalibrated(what)))
    }

    pub fn calibration(&self) -> Result<Calibration> {
        self.ready("calibration")
    }

    pub fn min_position_steps(&self) -> Result<i32> {
        Ok(self.calibration()?.min_steps)
    }

    pub fn max_position_steps(&self) -> Result<i32> {
        Ok(self.calibration()?.max_steps)
    }

    pub fn mid_position_steps(&self) -> Result<i32> {
        Ok(self.calibration()?.mid_steps)
    }

    pub fn soft_limit_meters(&self) -> Result<f64> {
        Ok(self.calibration()?.soft_limit_meters)
    }

    /// Cart offset from the rail center, in meters.
    pub fn steps_to_meters(&self, steps: i32) -> Result<f64> {
        let mid = self.mid_position_steps()?;
        Ok(self.meters_per_step * steps_f64(i64::from(steps) - i64::from(mid)))
    }

    /// Raw pendulum angle, before the rest offset is removed.
    pub fn steps_to_radians(&self, steps: i32) -> f64 {
        self.radians_per_step * steps_f64(i64::from(steps))
    }

    pub fn position(&self) -> Result<f64> {
        self.ready("position")?;
        Ok(self.telemetry.position)
    }

    pub fn angle(&self) -> Result<f64> {
        self.ready("angle")?;
        Ok(self.telemetry.angle)
    }

    pub fn linear_velocity(&self) -> Result<f64> {
        self.ready("linear velocity")?;
        Ok(self.telemetry.linear_velocity)
    }

    pub fn angular_velocity(&self) -> Result<f64> {
        self.ready("angular velocity")?;
        Ok(self.telemetry.angular_velocity)
    }

    /// Sample both encoders and refresh position, angle and their
    /// backward-difference velocities over `dt` seconds.
    pub fn update(&mut self, dt: f64) -> Result<()> {
        self.ready("update")?;
        if !dt.is_finite() || dt <= 0.0 {
            return Err(PlantError::InvalidArgument(format!("dt must be positive, got {dt}")).into());
        }
        let position = self.steps_to_meters(self.position_encoder.steps())?;
        let angle = self.steps_to_radians(self.angle_encoder.steps()) - self.rest_angle_offset;
        let t = &mut self.telemetry;
        t.linear_velocity = (position - t.position) / dt;
        t.angular_velocity = (angle - t.angle) / dt;
        t.position = position;
        t.angle = angle;
        Ok(())
    }

    /// Shape `pwm` with the dead-band offsets and drive the motor.
    ///
    /// Returns `false` when the shaped value had to be saturated; it is
    /// applied anyway.
    pub fn set_command(&self, pwm: i32) -> Result<bool> {
        self.ready("set_command")?;
        let (value, fits) = self.offsets.apply(pwm);
        if !self.actuator.set_pwm_unless_latched(value, self.latch.flag())? {
            self.latch.check()?;
        }
        if !fits {
            tracing::trace!(pwm, applied = value, "command saturated");
        }
        Ok(fits)
    }

    /// Home against both limit switches, center the cart and arm the
    /// permanent safety limits.
    ///
    /// On failure the motor is stopped, every callback is cleared and the
    /// plant stays uncalibrated; calling again starts from scratch.
    pub fn calibrate(&mut self, homing_pwm: i32) -> Result<()> {
        self.calibration = None;
        self.phase = Phase::Uninitialized;
        if !(1..=PWM_RANGE).contains(&homing_pwm) {
            return Err(PlantError::InvalidArgument(format!(
                "homing pwm must be in 1..={PWM_RANGE}, got {homing_pwm}"
            ))
            .into());
        }
        tracing::info!(homing_pwm, "calibration started");
        match self.run_calibration(homing_pwm) {
            Ok(cal) => {
                let position = self.steps_to_meters_with(cal.mid_steps, self.position_encoder.steps());
                let angle = self.steps_to_radians(self.angle_encoder.steps()) - self.rest_angle_offset;
                self.telemetry = Telemetry {
                    position,
                    angle,
                    ..Telemetry::default()
                };
                self.calibration = Some(cal);
                self.phase = Phase::Calibrated;
                tracing::info!(
                    min = cal.min_steps,
                    max = cal.max_steps,
                    mid = cal.mid_steps,
                    soft_limit_m = cal.soft_limit_meters,
                    "calibration complete"
                );
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, phase = %self.phase, "calibration failed");
                self.abandon_calibration();
                Err(e)
            }
        }
    }

    fn steps_to_meters_with(&self, mid: i32, steps: i32) -> f64 {
        self.meters_per_step * steps_f64(i64::from(steps) - i64::from(mid))
    }

    fn abandon_calibration(&mut self) {
        if let Err(e) = self.actuator.stop() {
            tracing::warn!(error = %e, "failed to stop motor after calibration failure");
        }
        self.disarm_all();
        self.phase = Phase::Uninitialized;
    }

    fn disarm_all(&self) {
        self.position_encoder.remove_safety_callbacks();
        self.angle_encoder.remove_safety_callbacks();
        for sw in [&self.left, &self.right] {
            if let Err(e) = sw.disable_interrupts() {
                tracing::warn!(pin = sw.pin(), error = %e, "failed to disarm switch");
            }
        }
    }

    /// Poll `done` every `poll` until it holds, the latch trips or the
    /// homing timeout expires.
    fn wait_until(
        &self,
        what: &str,
        poll: Duration,
        mut done: impl FnMut(&Self) -> Result<bool>,
    ) -> Result<()> {
        let started = self.clock.now();
        loop {
            self.latch.check()?;
            self.check_cancelled(what)?;
            if done(self)? {
                return Ok(());
            }
            if self.clock.now().saturating_duration_since(started) >= self.homing.timeout {
                return Err(calibration_failed(format!(
                    "timed out after {:?} while {what}",
                    self.homing.timeout
                )));
            }
            self.clock.sleep(poll);
        }
    }

    fn check_cancelled(&self, what: &str) -> Result<()> {
        if self.cancel.as_ref().is_some_and(|f| f.load(Ordering::Acquire)) {
            return Err(PlantError::Aborted(format!("interrupted while {what}")).into());
        }
        Ok(())
    }

    /// Sleep through the settle window in poll-sized slices.
    fn settle(&self) -> Result<()> {
        let started = self.clock.now();
        loop {
            self.check_cancelled("waiting for the pendulum to settle")?;
            let elapsed = self.clock.now().saturating_duration_since(started);
            if elapsed >= self.homing.settle {
                return Ok(());
            }
            let remaining = self.homing.settle - elapsed;
            let slice = if self.homing.poll.is_zero() {
                remaining
            } else {
                remaining.min(self.homing.poll)
            };
            self.clock.sleep(slice);
        }
    }

    fn stop_motor_callback(&self) -> SwitchCallback {
        let actuator = Arc::downgrade(&self.actuator);
        Arc::new(move || {
            if let Some(a) = actuator.upgrade()
                && let Err(e) = a.stop()
            {
                tracing::error!(error = %e, "failed to stop motor at switch");
            }
        })
    }

    fn flag_callback(&self, flag: &Arc<AtomicBool>, stop_motor: bool) -> SwitchCallback {
        let flag = Arc::clone(flag);
        let stop = stop_motor.then(|| self.stop_motor_callback());
        Arc::new(move || {
            flag.store(true, Ordering::Release);
            if let Some(stop) = &stop {
                stop();
            }
        })
    }

    fn check_angle_at_rest(&self) -> Result<()> {
        let moved = Arc::new(AtomicBool::new(false));
        let s = self.angle_encoder.steps();
        let cb: SafetyCallback = self.flag_callback(&moved, false);
        self.angle_encoder.set_safety_callbacks(
            s.saturating_sub(1),
            s.saturating_add(1),
            Some(Arc::clone(&cb)),
            Some(cb),
        );
        let settled = self.settle();
        self.angle_encoder.remove_safety_callbacks();
        settled?;
        if moved.load(Ordering::Acquire) {
            return Err(calibration_failed("the pendulum is moving"));
        }
        let steps = self.angle_encoder.steps();
        if steps != 0 {
            return Err(calibration_failed(format!(
                "the pendulum is not hanging at rest (angle steps = {steps})"
            )));
        }
        Ok(())
    }

    /// Drive toward the `target` switch until it stops the motor; the
    /// `other` switch aborts.
    fn seek(&self, pwm: i32, toward_right: bool) -> Result<i32> {
        let wrong = Arc::new(AtomicBool::new(false));
        let stop = self.stop_motor_callback();
        let wrong_cb = self.flag_callback(&wrong, true);
        let (target, other, name) = if toward_right {
            (&self.right, &self.left, "right")
        } else {
            (&self.left, &self.right, "left")
        };
        target.clear_triggered();
        target.enable_interrupts(Some(stop))?;
        other.enable_interrupts(Some(wrong_cb))?;
        self.actuator.set_pwm(if toward_right { pwm } else { -pwm })?;

        let what = format!("seeking the {name} switch");
        self.wait_until(&what, self.homing.poll, |p| {
            Ok(p.actuator.pwm() == 0 || wrong.load(Ordering::Acquire))
        })?;
        if wrong.load(Ordering::Acquire) {
            return Err(calibration_failed(format!(
                "hit the wrong switch while {what}"
            )));
        }
        let steps = self.position_encoder.steps();
        tracing::debug!(switch = name, steps, "switch reached");
        Ok(steps)
    }

    /// Back off the switch just reached until it reads at rest again.
    fn release(&self, pwm: i32, from_right: bool) -> Result<()> {
        let (target, other, name) = if from_right {
            (&self.right, &self.left, "right")
        } else {
            (&self.left, &self.right, "left")
        };
        target.enable_interrupts(None)?;
        other.disable_interrupts()?;
        self.actuator.set_pwm(if from_right { -pwm } else { pwm })?;
        let what = format!("releasing the {name} switch");
        self.wait_until(&what, self.homing.poll, |p| {
            let sw = if from_right { &p.right } else { &p.left };
            sw.at_rest_cached()
        })?;
        self.actuator.stop()?;
        tracing::debug!(switch = name, steps = self.position_encoder.steps(), "switch released");
        Ok(())
    }

    fn center(&self, pwm: i32, mid: i32) -> Result<()> {
        self.left.disable_interrupts()?;
        self.right.disable_interrupts()?;
        let dir = (i64::from(mid) - i64::from(self.position_encoder.steps())).signum();
        if dir == 0 {
            return Ok(());
        }
        self.actuator.set_pwm(if dir > 0 { pwm } else { -pwm })?;
        self.wait_until("centering the cart", self.homing.center_poll, |p| {
            Ok((i64::from(mid) - i64::from(p.position_encoder.steps())) * dir <= 0)
        })?;
        self.actuator.stop()?;
        tracing::debug!(mid, steps = self.position_encoder.steps(), "cart centered");
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn margin_steps(&self) -> i32 {
        let m = (self.safety_margin_meters.abs() / self.meters_per_step).ceil();
        if m.is_finite() {
            m.min(f64::from(i32::MAX)) as i32
        } else {
            i32::MAX
        }
    }

    fn arm_safety(&self, min: i32, max: i32) -> Result<i32> {
        let estop = self.estop_handle();
        self.left
            .enable_interrupts(Some(estop.callback("left switch hit")))?;
        self.right
            .enable_interrupts(Some(estop.callback("right switch hit")))?;
        let margin = self.margin_steps();
        self.position_encoder.set_safety_callbacks(
            min.saturating_add(margin),
            max.saturating_sub(margin),
            Some(estop.callback("soft minimum position limit reached")),
            Some(estop.callback("soft maximum position limit reached")),
        );
        Ok(margin)
    }

    fn run_calibration(&mut self, pwm: i32) -> Result<Calibration> {
        if self.latch.is_tripped() {
            return Err(calibration_failed(format!(
                "emergency stop is latched ({})",
                self.latch.reason().unwrap_or_default()
            )));
        }
        if !self.left.at_rest()? {
            return Err(calibration_failed("left switch is not at rest"));
        }
        if !self.right.at_rest()? {
            return Err(calibration_failed("right switch is not at rest"));
        }
        self.disarm_all();

        self.check_angle_at_rest()?;
        tracing::debug!("pendulum at rest");

        self.phase = Phase::SeekingRight;
        let max = self.seek(pwm, true)?;
        self.phase = Phase::ReleasingRight;
        self.release(pwm, true)?;

        self.phase = Phase::SeekingLeft;
        let min = self.seek(pwm, false)?;
        self.phase = Phase::ReleasingLeft;
        self.release(pwm, false)?;

        if min > max {
            return Err(calibration_failed(format!(
                "position encoder counts the wrong way (min {min} > max {max}); swap its phase pins"
            )));
        }
        // Average in i64 so the sum cannot overflow; the result lies between min and max.
        let mid = i32::try_from((i64::from(min) + i64::from(max)) / 2).unwrap_or(0);

        self.phase = Phase::Centering;
        self.center(pwm, mid)?;

        let margin = self.arm_safety(min, max)?;
        let soft_limit_meters = self
            .steps_to_meters_with(mid, max.saturating_sub(margin))
            .abs();
        Ok(Calibration {
            min_steps: min,
            max_steps: max,
            mid_steps: mid,
            margin_steps: margin,
            soft_limit_meters,
        })
    }
}

impl Drop for PlantController {
    fn drop(&mut self) {
        tracing::debug!("destroying plant controller");
        if let Err(e) = self.actuator.stop() {
            tracing::warn!(error = %e, "failed to stop motor on drop");
        }
        self.disarm_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_apply_by_sign() {
        let o = PwmOffsets::new(10, 20, 3);
        assert_eq!(o.apply(0), (0, true));
        assert_eq!(o.apply(100), (123, true));
        assert_eq!(o.apply(-100), (-107, true));
        assert_eq!(o.apply(250), (255, false));
        assert_eq!(o.apply(-255), (-255, false));
    }

    #[test]
    fn negative_offset_magnitudes_are_clamped() {
        let o = PwmOffsets::new(-5, -7, -2);
        assert_eq!((o.low(), o.high(), o.static_offset()), (0, 0, -2));
    }

    #[test]
    fn phase_names_are_readable() {
        assert_eq!(Phase::SeekingLeft.to_string(), "seeking left switch");
        assert_eq!(Phase::EmergencyStopped.to_string(), "emergency stopped");
    }
}
