//! GPIO backends and process-level activation for the pendulum rig.
//!
//! - `SimRig`: deterministic simulated rig (always available)
//! - `PiGpio`: rppal backend, behind the `hardware` feature on Linux
//! - `ActivationToken`: one per process; floats every pin when dropped
pub mod error;
#[cfg(all(feature = "hardware", target_os = "linux"))]
pub mod pi;
#[cfg(any(test, all(feature = "hardware", target_os = "linux")))]
mod pin_table;
pub mod sim;
pub mod token;

pub use error::HwError;
#[cfg(all(feature = "hardware", target_os = "linux"))]
pub use pi::PiGpio;
pub use sim::{PinMode, RigLayout, SimRig};
pub use token::{ActivationToken, MAX_USER_PIN, release_registered, reset_pins};
