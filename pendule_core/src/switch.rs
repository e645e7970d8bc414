//! Debounced limit switch.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use pendule_traits::{Edge, Gpio, Level, Pull};

use crate::error::{PlantError, Result};
use crate::hw_error::hw;

/// Default debounce window in microseconds.
pub const DEFAULT_DEBOUNCE_US: u32 = 5_000;

/// Callback run when the switch becomes active.
pub type SwitchCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchParams {
    pub pin: u8,
    /// Raw level is high when the switch is at rest.
    pub normally_up: bool,
    /// Pull up when normally up, pull down otherwise; no pull when false.
    pub use_internal_resistor: bool,
    pub debounce_us: u32,
}

impl SwitchParams {
    pub fn new(pin: u8) -> Self {
        Self {
            pin,
            normally_up: true,
            use_internal_resistor: true,
            debounce_us: DEFAULT_DEBOUNCE_US,
        }
    }

    fn pull(&self) -> Pull {
        match (self.use_internal_resistor, self.normally_up) {
            (false, _) => Pull::Off,
            (true, true) => Pull::Up,
            (true, false) => Pull::Down,
        }
    }

    fn rest_level(&self) -> Level {
        Level::from_bool(self.normally_up)
    }
}

struct Shared {
    params: SwitchParams,
    armed: AtomicBool,
    cached_at_rest: AtomicBool,
    has_triggered: AtomicBool,
    any_accepted: AtomicBool,
    last_accepted_tick: AtomicU32,
    callback: Mutex<Option<SwitchCallback>>,
}

impl Shared {
    /// Returns whether the edge was accepted.
    fn handle(&self, pin: u8, level: Level, tick_us: u32) -> std::result::Result<bool, PlantError> {
        if pin != self.params.pin {
            return Err(PlantError::TransitionOnUnknownPin { pin });
        }
        let last = self.last_accepted_tick.load(Ordering::Acquire);
        if self.any_accepted.load(Ordering::Acquire)
            && tick_us.wrapping_sub(last) < self.params.debounce_us
        {
            tracing::trace!(pin, tick_us, "switch edge debounced");
            return Ok(false);
        }
        self.last_accepted_tick.store(tick_us, Ordering::Release);
        self.any_accepted.store(true, Ordering::Release);

        let at_rest = level == self.params.rest_level();
        self.cached_at_rest.store(at_rest, Ordering::Release);
        if !at_rest {
            self.has_triggered.store(true, Ordering::Release);
            let cb = self.callback.lock().ok().and_then(|c| c.clone());
            if let Some(cb) = cb {
                cb();
            }
        }
        Ok(true)
    }
}

pub struct DebouncedSwitch {
    shared: Arc<Shared>,
    gpio: Arc<dyn Gpio>,
}

impl std::fmt::Debug for DebouncedSwitch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebouncedSwitch")
            .field("params", &self.shared.params)
            .field("armed", &self.interrupts_enabled())
            .finish()
    }
}

impl DebouncedSwitch {
    pub fn new(gpio: Arc<dyn Gpio>, params: SwitchParams) -> Result<Self> {
        tracing::debug!(
            pin = params.pin,
            normally_up = params.normally_up,
            internal_resistor = params.use_internal_resistor,
            "creating switch"
        );
        gpio.set_input(params.pin, params.pull()).map_err(hw)?;
        Ok(Self {
            shared: Arc::new(Shared {
                params,
                armed: AtomicBool::new(false),
                cached_at_rest: AtomicBool::new(true),
                has_triggered: AtomicBool::new(false),
                any_accepted: AtomicBool::new(false),
                last_accepted_tick: AtomicU32::new(0),
                callback: Mutex::new(None),
            }),
            gpio,
        })
    }

    pub fn pin(&self) -> u8 {
        self.shared.params.pin
    }

    /// Arm edge notifications, replacing the callback if already armed.
    /// The cached state is seeded from a direct read.
    pub fn enable_interrupts(&self, callback: Option<SwitchCallback>) -> Result<()> {
        if let Ok(mut slot) = self.shared.callback.lock() {
            *slot = callback;
        }
        if self.shared.armed.load(Ordering::Acquire) {
            return Ok(());
        }
        let at_rest = self.at_rest()?;
        self.shared.cached_at_rest.store(at_rest, Ordering::Release);
        let s = Arc::clone(&self.shared);
        self.gpio
            .watch(
                self.pin(),
                Box::new(move |edge: Edge| {
                    if let Err(e) = s.handle(edge.pin, edge.level, edge.tick_us) {
                        tracing::error!(error = %e, "switch rejected transition");
                    }
                }),
            )
            .map_err(hw)?;
        self.shared.armed.store(true, Ordering::Release);
        Ok(())
    }

    pub fn disable_interrupts(&self) -> Result<()> {
        self.shared.armed.store(false, Ordering::Release);
        if let Ok(mut slot) = self.shared.callback.lock() {
            *slot = None;
        }
        self.gpio.unwatch(self.pin()).map_err(hw)
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.shared.armed.load(Ordering::Acquire)
    }

    /// Direct read of the pin.
    pub fn at_rest(&self) -> Result<bool> {
        let level = self.gpio.read(self.pin()).map_err(hw)?;
        Ok(level == self.shared.params.rest_level())
    }

    /// Last debounced state; requires armed notifications.
    pub fn at_rest_cached(&self) -> Result<bool> {
        if !self.interrupts_enabled() {
            return Err(eyre::Report::new(PlantError::InterruptsDisabled));
        }
        Ok(self.shared.cached_at_rest.load(Ordering::Acquire))
    }

    /// Whether an active edge has been accepted since creation or the last clear.
    pub fn has_triggered(&self) -> bool {
        self.shared.has_triggered.load(Ordering::Acquire)
    }

    pub fn clear_triggered(&self) {
        self.shared.has_triggered.store(false, Ordering::Release);
    }

    /// Feed one edge. Returns whether it survived the debounce window.
    pub fn handle_edge(
        &self,
        pin: u8,
        level: Level,
        tick_us: u32,
    ) -> std::result::Result<bool, PlantError> {
        self.shared.handle(pin, level, tick_us)
    }
}

impl Drop for DebouncedSwitch {
    fn drop(&mut self) {
        tracing::debug!(pin = self.pin(), "destroying switch");
        if let Err(e) = self.disable_interrupts() {
            tracing::warn!(pin = self.pin(), error = %e, "failed to disarm switch");
        }
        if let Err(e) = self.gpio.release(self.pin()) {
            tracing::warn!(pin = self.pin(), error = %e, "failed to release switch pin");
        }
    }
}
