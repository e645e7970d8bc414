//! Digital I/O abstraction over the board's GPIO header.

use std::fmt;

/// Highest BCM pin number exposed on the 40-pin header.
pub const MAX_USER_PIN: u8 = 26;

/// Result type used at the GPIO trait boundary.
pub type GpioResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Logic level of a digital pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Level {
    Low,
    High,
}

impl Level {
    #[inline]
    pub fn is_high(self) -> bool {
        matches!(self, Level::High)
    }

    #[inline]
    pub fn from_bool(high: bool) -> Self {
        if high { Level::High } else { Level::Low }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Low => f.write_str("low"),
            Level::High => f.write_str("high"),
        }
    }
}

/// Internal pull resistor selection for input pins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Pull {
    #[default]
    Off,
    Up,
    Down,
}

/// One level change observed on a watched pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub pin: u8,
    pub level: Level,
    /// Free-running microsecond tick; wraps around at `u32::MAX`.
    pub tick_us: u32,
}

/// Callback invoked from the platform's notification context.
pub type EdgeCallback = Box<dyn FnMut(Edge) + Send + 'static>;

/// GPIO backend.
///
/// Methods take `&self`: a backend is shared between the control thread and
/// the notification context and must do its own locking.
pub trait Gpio: Send + Sync {
    fn set_input(&self, pin: u8, pull: Pull) -> GpioResult<()>;
    fn set_output(&self, pin: u8) -> GpioResult<()>;
    fn read(&self, pin: u8) -> GpioResult<Level>;
    fn write(&self, pin: u8, level: Level) -> GpioResult<()>;
    /// Drive a PWM signal with the given duty cycle (0 = off, 255 = full on).
    fn set_pwm(&self, pin: u8, duty: u8) -> GpioResult<()>;
    /// Register `callback` for every level change on `pin`, replacing any
    /// previous registration.
    fn watch(&self, pin: u8, callback: EdgeCallback) -> GpioResult<()>;
    fn unwatch(&self, pin: u8) -> GpioResult<()>;
    /// Return the pin to a floating input (no pull, no PWM, no watch).
    fn release(&self, pin: u8) -> GpioResult<()>;
    /// Current value of the tick used to stamp edges.
    fn tick_us(&self) -> u32;
}
