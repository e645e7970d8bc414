//! Raspberry Pi GPIO backend built on `rppal`.

use std::time::Instant;

use pendule_traits::{Edge, EdgeCallback, Gpio, GpioResult, Level, Pull};
use rppal::gpio::{self as rgpio, InputPin, OutputPin, Trigger};

use crate::error::{HwError, Result};
use crate::pin_table::PinTable;

/// Software PWM carrier frequency for the motor driver.
pub const DEFAULT_PWM_FREQUENCY_HZ: f64 = 800.0;

enum PinHandle {
    Input(InputPin),
    Output(OutputPin),
}

pub struct PiGpio {
    gpio: rgpio::Gpio,
    pins: PinTable<PinHandle>,
    epoch: Instant,
    pwm_frequency_hz: f64,
}

#[inline]
fn to_level(level: rgpio::Level) -> Level {
    match level {
        rgpio::Level::High => Level::High,
        rgpio::Level::Low => Level::Low,
    }
}

#[inline]
fn from_level(level: Level) -> rgpio::Level {
    match level {
        Level::High => rgpio::Level::High,
        Level::Low => rgpio::Level::Low,
    }
}

#[allow(clippy::cast_possible_truncation)]
#[inline]
fn tick_since(epoch: Instant) -> u32 {
    epoch.elapsed().as_micros() as u32
}

fn gpio_err(e: rgpio::Error) -> HwError {
    HwError::Gpio(e.to_string())
}

impl PiGpio {
    pub fn new() -> Result<Self> {
        Self::with_pwm_frequency(DEFAULT_PWM_FREQUENCY_HZ)
    }

    pub fn with_pwm_frequency(pwm_frequency_hz: f64) -> Result<Self> {
        let gpio = rgpio::Gpio::new().map_err(gpio_err)?;
        tracing::debug!(pwm_frequency_hz, "rppal gpio opened");
        Ok(Self {
            gpio,
            pins: PinTable::new(),
            epoch: Instant::now(),
            pwm_frequency_hz,
        })
    }

    /// Drop any handle we hold on `pin` and claim it afresh.
    ///
    /// The old handle is dropped with the table unlocked: dropping a watched
    /// input joins its interrupt thread.
    fn claim(&self, pin: u8) -> Result<rgpio::Pin> {
        drop(self.pins.take(pin));
        self.gpio.get(pin).map_err(gpio_err)
    }
}

impl Gpio for PiGpio {
    fn set_input(&self, pin: u8, pull: Pull) -> GpioResult<()> {
        let raw = self.claim(pin)?;
        let mut input = match pull {
            Pull::Off => raw.into_input(),
            Pull::Up => raw.into_input_pullup(),
            Pull::Down => raw.into_input_pulldown(),
        };
        input.set_reset_on_drop(false);
        self.pins.lock().insert(pin, PinHandle::Input(input));
        Ok(())
    }

    fn set_output(&self, pin: u8) -> GpioResult<()> {
        let raw = self.claim(pin)?;
        let mut output = raw.into_output_low();
        output.set_reset_on_drop(false);
        self.pins.lock().insert(pin, PinHandle::Output(output));
        Ok(())
    }

    fn read(&self, pin: u8) -> GpioResult<Level> {
        let pins = self.pins.lock();
        let level = match pins.get(&pin) {
            Some(PinHandle::Input(p)) => p.read(),
            Some(PinHandle::Output(p)) => {
                if p.is_set_high() {
                    rgpio::Level::High
                } else {
                    rgpio::Level::Low
                }
            }
            None => self.gpio.get(pin).map_err(gpio_err)?.read(),
        };
        Ok(to_level(level))
    }

    fn write(&self, pin: u8, level: Level) -> GpioResult<()> {
        let mut pins = self.pins.lock();
        match pins.get_mut(&pin) {
            Some(PinHandle::Output(p)) => {
                p.write(from_level(level));
                Ok(())
            }
            _ => Err(HwError::WrongMode {
                pin,
                mode: "output",
            }
            .into()),
        }
    }

    fn set_pwm(&self, pin: u8, duty: u8) -> GpioResult<()> {
        let mut pins = self.pins.lock();
        match pins.get_mut(&pin) {
            Some(PinHandle::Output(p)) => {
                if duty == 0 {
                    p.clear_pwm().map_err(gpio_err)?;
                    p.set_low();
                } else {
                    p.set_pwm_frequency(self.pwm_frequency_hz, f64::from(duty) / 255.0)
                        .map_err(gpio_err)?;
                }
                Ok(())
            }
            _ => Err(HwError::WrongMode {
                pin,
                mode: "output",
            }
            .into()),
        }
    }

    fn watch(&self, pin: u8, callback: EdgeCallback) -> GpioResult<()> {
        let wrong_mode = || HwError::WrongMode {
            pin,
            mode: "input",
        };
        let epoch = self.epoch;
        // Re-arming clears the previous interrupt, which joins its thread.
        let armed = self.pins.with_detached(pin, move |handle| match handle {
            PinHandle::Input(p) => {
                let mut callback = callback;
                p.set_async_interrupt(Trigger::Both, move |level| {
                    callback(Edge {
                        pin,
                        level: to_level(level),
                        tick_us: tick_since(epoch),
                    });
                })
                .map_err(gpio_err)
            }
            PinHandle::Output(_) => Err(wrong_mode()),
        });
        armed.unwrap_or_else(|| Err(wrong_mode()))?;
        Ok(())
    }

    fn unwatch(&self, pin: u8) -> GpioResult<()> {
        // Clearing joins the interrupt thread, whose callback may write a pin.
        let cleared = self.pins.with_detached(pin, |handle| match handle {
            PinHandle::Input(p) => p.clear_async_interrupt().map_err(gpio_err),
            PinHandle::Output(_) => Ok(()),
        });
        cleared.unwrap_or(Ok(()))?;
        Ok(())
    }

    fn release(&self, pin: u8) -> GpioResult<()> {
        match self.pins.take(pin) {
            Some(PinHandle::Input(mut p)) => {
                let _ = p.clear_async_interrupt();
            }
            Some(PinHandle::Output(mut p)) => {
                let _ = p.clear_pwm();
                p.set_low();
            }
            None => {}
        }
        let raw = self.claim(pin)?;
        let mut floating = raw.into_input();
        floating.set_reset_on_drop(false);
        Ok(())
    }

    fn tick_us(&self) -> u32 {
        tick_since(self.epoch)
    }
}
