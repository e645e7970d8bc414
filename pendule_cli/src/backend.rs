//! GPIO backend selection: rppal on the rig, the simulated rig otherwise.

use std::sync::Arc;

use pendule_config::Config;
use pendule_traits::{Clock, Gpio};

/// GPIO and clock the plant is built on.
pub struct Backend {
    pub gpio: Arc<dyn Gpio>,
    pub clock: Arc<dyn Clock + Send + Sync>,
}

#[cfg(all(feature = "hardware", target_os = "linux"))]
pub fn open(cfg: &Config) -> eyre::Result<Backend> {
    let gpio = pendule_hardware::PiGpio::with_pwm_frequency(cfg.motor.pwm_frequency_hz)?;
    tracing::info!(backend = "rppal", "gpio backend ready");
    Ok(Backend {
        gpio: Arc::new(gpio),
        clock: Arc::new(pendule_traits::MonotonicClock::new()),
    })
}

#[cfg(not(all(feature = "hardware", target_os = "linux")))]
pub fn open(cfg: &Config) -> eyre::Result<Backend> {
    let rig = Arc::new(pendule_hardware::SimRig::new(sim::layout(cfg)));
    let paced = !sim::fast_mode();
    tracing::info!(backend = "sim", paced, "gpio backend ready");
    Ok(Backend {
        gpio: rig.clone(),
        clock: Arc::new(sim::SimClock { rig, paced }),
    })
}

/// Backend used by `reset-gpio`, which needs no plant.
#[cfg(all(feature = "hardware", target_os = "linux"))]
pub fn open_bare() -> eyre::Result<Arc<dyn Gpio>> {
    Ok(Arc::new(pendule_hardware::PiGpio::new()?))
}

#[cfg(not(all(feature = "hardware", target_os = "linux")))]
pub fn open_bare() -> eyre::Result<Arc<dyn Gpio>> {
    Ok(Arc::new(pendule_hardware::SimRig::default()))
}

#[cfg(not(all(feature = "hardware", target_os = "linux")))]
mod sim {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use pendule_config::Config;
    use pendule_hardware::{RigLayout, SimRig};
    use pendule_traits::Clock;

    /// Set to run the simulated rig as fast as possible instead of in real time.
    const FAST_ENV: &str = "PENDULE_SIM_FAST";

    pub fn fast_mode() -> bool {
        std::env::var(FAST_ENV).is_ok_and(|v| !v.is_empty() && v != "0")
    }

    /// Rig wired like `cfg`; mechanics are the stock simulated rail of
    /// +-1000 encoder counts.
    pub fn layout(cfg: &Config) -> RigLayout {
        RigLayout {
            motor_pwm: cfg.motor.pwm_pin,
            motor_dir: cfg.motor.direction_pin,
            left_switch: cfg.left_switch.pin,
            right_switch: cfg.right_switch.pin,
            switches_normally_up: cfg.left_switch.normally_up,
            position_a: cfg.position_encoder.pin_a,
            position_b: cfg.position_encoder.pin_b,
            angle_a: cfg.angle_encoder.pin_a,
            angle_b: cfg.angle_encoder.pin_b,
            ..RigLayout::default()
        }
    }

    /// Rig clock, optionally paced to wall time.
    pub struct SimClock {
        pub rig: Arc<SimRig>,
        pub paced: bool,
    }

    impl Clock for SimClock {
        fn now(&self) -> Instant {
            self.rig.now()
        }

        fn sleep(&self, d: Duration) {
            if self.paced {
                std::thread::sleep(d);
            }
            self.rig.advance(d);
        }
    }

}
