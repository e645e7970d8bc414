//! Platform seams shared by the plant interface crates.
//!
//! Everything that touches real hardware or real time goes through the
//! `Gpio` and `Clock` traits so the core can run against a simulated rig.
pub mod clock;
pub mod gpio;

pub use clock::{Clock, MonotonicClock};
pub use gpio::{Edge, EdgeCallback, Gpio, GpioResult, Level, MAX_USER_PIN, Pull};
