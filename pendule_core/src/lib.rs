#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//! Hardware-agnostic cart-and-pendulum plant.
//!
//! Every pin access goes through `pendule_traits::Gpio` and every wait
//! through `pendule_traits::Clock`, so the same code drives a Raspberry Pi
//! or the simulated rig.
//!
//! ## Architecture
//!
//! - **Sensors**: quadrature decoding (`encoder`) and debounced limit
//!   switches (`switch`)
//! - **Actuation**: signed PWM with a direction pin (`actuator`)
//! - **Plant**: homing, state estimation, command shaping and the permanent
//!   emergency stop (`plant`, built through `builder`)
//! - **Remote control**: newest-wins state/command exchange (`channel`),
//!   the command watchdog (`watchdog`) and the fixed-period loop (`runner`)
//!
//! ## Contexts
//!
//! Edge handlers and the safety callbacks they chain run in the GPIO
//! notification context. They only touch atomics, small mutexes and pins;
//! faults raised there are latched in a `FaultLatch` and surface as
//! `PlantError::EmergencyStop` on the next control-thread call.

pub mod actuator;
pub mod builder;
pub mod channel;
pub mod conversions;
pub mod encoder;
pub mod error;
pub mod fault;
pub mod hw_error;
pub mod plant;
pub mod runner;
pub mod switch;
pub mod util;
pub mod watchdog;

pub use actuator::{Actuator, PWM_RANGE};
pub use builder::{Missing, PlantBuilder, Set, build_plant};
pub use channel::{ChannelClient, ChannelServer, StateMessage, Wait};
pub use encoder::{QuadratureEncoder, SafetyCallback, TRANSITIONS, step_delta};
pub use error::{BuildError, ChannelError, PlantError, Report, Result};
pub use fault::FaultLatch;
pub use plant::{
    Calibration, CalibrationParams, EstopHandle, Phase, PlantController, PlantParams, PwmOffsets,
};
pub use runner::{LoopStats, ServeCfg, clamp_to_soft_limits, serve};
pub use switch::{DEFAULT_DEBOUNCE_US, DebouncedSwitch, SwitchCallback, SwitchParams};
pub use watchdog::CommandWatchdog;
