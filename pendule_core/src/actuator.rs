//! Signed PWM motor driver: one direction pin and one duty-cycle pin.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use pendule_traits::{Gpio, Level};

use crate::error::{PlantError, Result};
use crate::hw_error::hw;

/// Largest magnitude accepted by the duty-cycle pin.
pub const PWM_RANGE: i32 = 255;

pub struct Actuator {
    gpio: Arc<dyn Gpio>,
    pwm_pin: u8,
    direction_pin: u8,
    last: AtomicI32,
    // Serializes pin writes so a late command cannot overtake a stop.
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for Actuator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Actuator")
            .field("pwm_pin", &self.pwm_pin)
            .field("direction_pin", &self.direction_pin)
            .field("pwm", &self.pwm())
            .finish()
    }
}

impl Actuator {
    /// Claim both pins as outputs and leave the motor unpowered.
    pub fn new(gpio: Arc<dyn Gpio>, pwm_pin: u8, direction_pin: u8) -> Result<Self> {
        if pwm_pin == direction_pin {
            return Err(eyre::Report::new(PlantError::Config(format!(
                "motor pwm and direction must use distinct pins (both on {pwm_pin})"
            ))));
        }
        tracing::debug!(pwm_pin, direction_pin, "creating actuator");
        gpio.set_output(pwm_pin).map_err(hw)?;
        gpio.set_output(direction_pin).map_err(hw)?;
        gpio.write(direction_pin, Level::Low).map_err(hw)?;
        gpio.set_pwm(pwm_pin, 0).map_err(hw)?;
        Ok(Self {
            gpio,
            pwm_pin,
            direction_pin,
            last: AtomicI32::new(0),
            write_lock: Mutex::new(()),
        })
    }

    fn write_locked(&self, value: i32) -> Result<()> {
        let value = value.clamp(-PWM_RANGE, PWM_RANGE);
        let level = Level::from_bool(value > 0);
        // clamp above keeps |value| within u8
        let duty = u8::try_from(value.unsigned_abs()).unwrap_or(u8::MAX);
        self.gpio.write(self.direction_pin, level).map_err(hw)?;
        self.gpio.set_pwm(self.pwm_pin, duty).map_err(hw)?;
        self.last.store(value, Ordering::Release);
        tracing::trace!(pwm = value, "actuator write");
        Ok(())
    }

    /// Drive the motor. Positive values set the direction pin high; the duty
    /// is `|value|`, saturated to the PWM range.
    pub fn set_pwm(&self, value: i32) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        self.write_locked(value)
    }

    /// Like [`set_pwm`](Self::set_pwm) but skipped when `latch` is set under
    /// the write lock. Returns whether the value was written.
    pub fn set_pwm_unless_latched(&self, value: i32, latch: &AtomicBool) -> Result<bool> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if latch.load(Ordering::Acquire) {
            return Ok(false);
        }
        self.write_locked(value)?;
        Ok(true)
    }

    /// Last value written.
    #[inline]
    pub fn pwm(&self) -> i32 {
        self.last.load(Ordering::Acquire)
    }

    pub fn stop(&self) -> Result<()> {
        self.set_pwm(0)
    }

    pub fn pins(&self) -> (u8, u8) {
        (self.pwm_pin, self.direction_pin)
    }
}

impl Drop for Actuator {
    fn drop(&mut self) {
        tracing::debug!(pwm_pin = self.pwm_pin, "destroying actuator");
        if let Err(e) = self.stop() {
            tracing::warn!(error = %e, "failed to stop motor on drop");
        }
        for pin in [self.pwm_pin, self.direction_pin] {
            if let Err(e) = self.gpio.release(pin) {
                tracing::warn!(pin, error = %e, "failed to release actuator pin");
            }
        }
    }
}
