//! Quadrature decoder.
//!
//! Each level change on either phase is folded into a signed step counter
//! through a 16-entry transition table indexed by the previous and current
//! levels of both phases. Impossible transitions (both phases flipping at
//! once) and repeated reports count as zero.

use std::sync::atomic::{AtomicI8, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use pendule_traits::{Edge, Gpio, Level, Pull};

use crate::error::{PlantError, Result};
use crate::hw_error::hw;

/// Step delta for index `past_a·8 + past_b·4 + a·2 + b`.
pub const TRANSITIONS: [i8; 16] = [0, 1, -1, 0, -1, 0, 0, 1, 1, 0, 0, -1, 0, -1, 1, 0];

/// Direction of a single transition between two phase-level pairs.
#[inline]
pub fn step_delta(past_a: bool, past_b: bool, a: bool, b: bool) -> i8 {
    let idx = (usize::from(past_a) << 3)
        | (usize::from(past_b) << 2)
        | (usize::from(a) << 1)
        | usize::from(b);
    TRANSITIONS[idx]
}

/// Zero-argument callback run from the notification context.
pub type SafetyCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Default, Clone, Copy)]
struct PhaseLevels {
    a: bool,
    b: bool,
}

#[derive(Default)]
struct Callbacks {
    lower: Option<SafetyCallback>,
    upper: Option<SafetyCallback>,
}

struct Shared {
    pin_a: u8,
    pin_b: u8,
    // Transitions on the two phases may arrive on different threads.
    levels: Mutex<PhaseLevels>,
    steps: AtomicI32,
    direction: AtomicI8,
    lower: AtomicI32,
    upper: AtomicI32,
    callbacks: Mutex<Callbacks>,
}

impl Shared {
    fn handle(&self, pin: u8, level: bool) -> std::result::Result<(), PlantError> {
        if pin != self.pin_a && pin != self.pin_b {
            return Err(PlantError::TransitionOnUnknownPin { pin });
        }
        let delta = {
            let mut lv = self
                .levels
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let past = *lv;
            if pin == self.pin_a {
                lv.a = level;
            } else {
                lv.b = level;
            }
            step_delta(past.a, past.b, lv.a, lv.b)
        };
        self.direction.store(delta, Ordering::Relaxed);
        let delta = i32::from(delta);
        let steps = self.steps.fetch_add(delta, Ordering::AcqRel).wrapping_add(delta);
        tracing::trace!(pin, level, steps, "encoder transition");

        let fire_lower = steps <= self.lower.load(Ordering::Acquire);
        let fire_upper = steps >= self.upper.load(Ordering::Acquire);
        if fire_lower || fire_upper {
            let (lower, upper) = match self.callbacks.lock() {
                Ok(cbs) => (cbs.lower.clone(), cbs.upper.clone()),
                Err(_) => (None, None),
            };
            if fire_lower && let Some(cb) = lower {
                cb();
            }
            if fire_upper && let Some(cb) = upper {
                cb();
            }
        }
        Ok(())
    }
}

pub struct QuadratureEncoder {
    shared: Arc<Shared>,
    gpio: Arc<dyn Gpio>,
}

impl std::fmt::Debug for QuadratureEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuadratureEncoder")
            .field("pin_a", &self.shared.pin_a)
            .field("pin_b", &self.shared.pin_b)
            .field("steps", &self.steps())
            .finish()
    }
}

impl QuadratureEncoder {
    /// Claim `pin_a`/`pin_b` as pulled-up inputs and start decoding.
    pub fn new(gpio: Arc<dyn Gpio>, pin_a: u8, pin_b: u8) -> Result<Self> {
        if pin_a == pin_b {
            return Err(eyre::Report::new(PlantError::Config(format!(
                "encoder phases must use distinct pins (both on {pin_a})"
            ))));
        }
        tracing::debug!(pin_a, pin_b, "creating encoder");
        gpio.set_input(pin_a, Pull::Up).map_err(hw)?;
        gpio.set_input(pin_b, Pull::Up).map_err(hw)?;
        let a = gpio.read(pin_a).map_err(hw)?.is_high();
        let b = gpio.read(pin_b).map_err(hw)?.is_high();

        let shared = Arc::new(Shared {
            pin_a,
            pin_b,
            levels: Mutex::new(PhaseLevels { a, b }),
            steps: AtomicI32::new(0),
            direction: AtomicI8::new(0),
            lower: AtomicI32::new(i32::MIN),
            upper: AtomicI32::new(i32::MAX),
            callbacks: Mutex::new(Callbacks::default()),
        });
        for pin in [pin_a, pin_b] {
            let s = Arc::clone(&shared);
            gpio.watch(
                pin,
                Box::new(move |edge: Edge| {
                    if let Err(e) = s.handle(edge.pin, edge.level.is_high()) {
                        tracing::error!(error = %e, "encoder rejected transition");
                    }
                }),
            )
            .map_err(hw)?;
        }
        Ok(Self { shared, gpio })
    }

    #[inline]
    pub fn steps(&self) -> i32 {
        self.shared.steps.load(Ordering::Acquire)
    }

    /// Direction of the last transition: -1, 0 or +1.
    #[inline]
    pub fn direction(&self) -> i8 {
        self.shared.direction.load(Ordering::Relaxed)
    }

    pub fn pins(&self) -> (u8, u8) {
        (self.shared.pin_a, self.shared.pin_b)
    }

    pub fn thresholds(&self) -> (i32, i32) {
        (
            self.shared.lower.load(Ordering::Acquire),
            self.shared.upper.load(Ordering::Acquire),
        )
    }

    /// Run `lower_cb` whenever a transition leaves `steps <= lower` and
    /// `upper_cb` whenever it leaves `steps >= upper`. The thresholds need
    /// not be ordered; with `lower >= upper` both may fire on one step.
    pub fn set_safety_callbacks(
        &self,
        lower: i32,
        upper: i32,
        lower_cb: Option<SafetyCallback>,
        upper_cb: Option<SafetyCallback>,
    ) {
        // Widen first so no transition sees new thresholds with old callbacks.
        self.shared.lower.store(i32::MIN, Ordering::Release);
        self.shared.upper.store(i32::MAX, Ordering::Release);
        if let Ok(mut cbs) = self.shared.callbacks.lock() {
            cbs.lower = lower_cb;
            cbs.upper = upper_cb;
        }
        self.shared.lower.store(lower, Ordering::Release);
        self.shared.upper.store(upper, Ordering::Release);
    }

    pub fn remove_safety_callbacks(&self) {
        self.set_safety_callbacks(i32::MIN, i32::MAX, None, None);
    }

    /// Feed one level change. Normally called by the GPIO backend.
    pub fn handle_transition(&self, pin: u8, level: Level) -> std::result::Result<(), PlantError> {
        self.shared.handle(pin, level.is_high())
    }
}

impl Drop for QuadratureEncoder {
    fn drop(&mut self) {
        tracing::debug!(pin_a = self.shared.pin_a, pin_b = self.shared.pin_b, "destroying encoder");
        for pin in [self.shared.pin_a, self.shared.pin_b] {
            if let Err(e) = self.gpio.unwatch(pin) {
                tracing::warn!(pin, error = %e, "failed to unwatch encoder pin");
            }
            if let Err(e) = self.gpio.release(pin) {
                tracing::warn!(pin, error = %e, "failed to release encoder pin");
            }
        }
    }
}
