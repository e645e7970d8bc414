//! Simulated cart-and-pendulum rig.
//!
//! `SimRig` implements both `Gpio` and `Clock`. Time only moves when someone
//! sleeps on the rig: the cart is then integrated in 100 µs substeps, every
//! whole encoder step produces the matching quadrature edge, and the limit
//! switches toggle with a little mechanical hysteresis. Edge callbacks run on
//! the sleeping thread, outside the rig lock, so they may drive the motor.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use pendule_traits::{Clock, Edge, EdgeCallback, Gpio, GpioResult, Level, Pull};

use crate::error::HwError;

const SUBSTEP: Duration = Duration::from_micros(100);
/// Virtual time spent per step by the manual positioning helpers.
const MANUAL_STEP: Duration = Duration::from_micros(50);
/// Quadrature cycle in increasing order: (a, b).
const GRAY: [(bool, bool); 4] = [(false, false), (false, true), (true, true), (true, false)];

/// Pin assignment and mechanics of the simulated rig.
#[derive(Debug, Clone)]
pub struct RigLayout {
    pub motor_pwm: u8,
    pub motor_dir: u8,
    pub left_switch: u8,
    pub right_switch: u8,
    /// Raw level of a switch at rest is high when true.
    pub switches_normally_up: bool,
    pub position_a: u8,
    pub position_b: u8,
    pub angle_a: u8,
    pub angle_b: u8,
    /// Cart position (in encoder steps) at which the left switch closes.
    pub left_limit_steps: i64,
    /// Cart position (in encoder steps) at which the right switch closes.
    pub right_limit_steps: i64,
    /// Distance the cart must back off before a closed switch reopens.
    pub switch_hysteresis_steps: i64,
    /// How far the cart can travel past a switch before hitting the end stop.
    pub overtravel_steps: i64,
    /// Cart speed at full duty.
    pub steps_per_sec_full_duty: f64,
}

impl Default for RigLayout {
    fn default() -> Self {
        Self {
            motor_pwm: 24,
            motor_dir: 16,
            left_switch: 17,
            right_switch: 18,
            switches_normally_up: true,
            position_a: 20,
            position_b: 21,
            angle_a: 19,
            angle_b: 26,
            left_limit_steps: -1000,
            right_limit_steps: 1000,
            switch_hysteresis_steps: 50,
            overtravel_steps: 200,
            steps_per_sec_full_duty: 20_000.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinMode {
    Input(Pull),
    Output,
}

type SharedCallback = Arc<Mutex<EdgeCallback>>;

#[derive(Default)]
struct RigState {
    elapsed: Duration,
    cart: i64,
    cart_frac: f64,
    angle: i64,
    left_closed: bool,
    right_closed: bool,
    held: HashMap<u8, bool>,
    modes: HashMap<u8, PinMode>,
    outputs: HashMap<u8, Level>,
    duty: HashMap<u8, u8>,
    watchers: HashMap<u8, SharedCallback>,
}

struct Pending {
    callback: SharedCallback,
    edge: Edge,
}

pub struct SimRig {
    layout: RigLayout,
    epoch: Instant,
    state: Mutex<RigState>,
}

impl std::fmt::Debug for SimRig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimRig")
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

impl Default for SimRig {
    fn default() -> Self {
        Self::new(RigLayout::default())
    }
}

#[inline]
fn gray(steps: i64) -> (bool, bool) {
    // rem_euclid(4) is always in 0..4
    GRAY[steps.rem_euclid(4) as usize]
}

#[allow(clippy::cast_possible_truncation)]
#[inline]
fn tick_of(elapsed: Duration) -> u32 {
    // Wrapping microsecond tick, like the hardware counter.
    elapsed.as_micros() as u32
}

impl RigState {
    fn velocity(&self, layout: &RigLayout) -> f64 {
        let duty = self.duty.get(&layout.motor_pwm).copied().unwrap_or(0);
        if duty == 0 {
            return 0.0;
        }
        let sign = match self.outputs.get(&layout.motor_dir) {
            Some(Level::High) => 1.0,
            _ => -1.0,
        };
        sign * f64::from(duty) / 255.0 * layout.steps_per_sec_full_duty
    }

    fn switch_level(&self, layout: &RigLayout, closed: bool) -> Level {
        Level::from_bool(layout.switches_normally_up != closed)
    }

    fn left_active(&self, layout: &RigLayout) -> bool {
        self.held
            .get(&layout.left_switch)
            .copied()
            .unwrap_or(self.left_closed)
    }

    fn right_active(&self, layout: &RigLayout) -> bool {
        self.held
            .get(&layout.right_switch)
            .copied()
            .unwrap_or(self.right_closed)
    }

    fn input_level(&self, layout: &RigLayout, pin: u8) -> Option<Level> {
        if pin == layout.left_switch {
            return Some(self.switch_level(layout, self.left_active(layout)));
        }
        if pin == layout.right_switch {
            return Some(self.switch_level(layout, self.right_active(layout)));
        }
        let (pa, pb) = gray(self.cart);
        let (aa, ab) = gray(self.angle);
        if pin == layout.position_a {
            Some(Level::from_bool(pa))
        } else if pin == layout.position_b {
            Some(Level::from_bool(pb))
        } else if pin == layout.angle_a {
            Some(Level::from_bool(aa))
        } else if pin == layout.angle_b {
            Some(Level::from_bool(ab))
        } else {
            None
        }
    }

    fn emit(&self, pin: u8, level: Level, out: &mut Vec<Pending>) {
        if let Some(cb) = self.watchers.get(&pin) {
            out.push(Pending {
                callback: Arc::clone(cb),
                edge: Edge {
                    pin,
                    level,
                    tick_us: tick_of(self.elapsed),
                },
            });
        }
    }

    fn emit_phase_change(
        &self,
        before: (bool, bool),
        after: (bool, bool),
        pins: (u8, u8),
        out: &mut Vec<Pending>,
    ) {
        if before.0 != after.0 {
            self.emit(pins.0, Level::from_bool(after.0), out);
        }
        if before.1 != after.1 {
            self.emit(pins.1, Level::from_bool(after.1), out);
        }
    }

    /// Move the cart one step; returns false when the end stop blocks it.
    fn step_cart(&mut self, layout: &RigLayout, delta: i64, out: &mut Vec<Pending>) -> bool {
        let next = self.cart + delta;
        if next < layout.left_limit_steps - layout.overtravel_steps
            || next > layout.right_limit_steps + layout.overtravel_steps
        {
            return false;
        }
        let before = gray(self.cart);
        self.cart = next;
        self.emit_phase_change(
            before,
            gray(next),
            (layout.position_a, layout.position_b),
            out,
        );
        self.update_switches(layout, out);
        true
    }

    fn step_angle(&mut self, layout: &RigLayout, delta: i64, out: &mut Vec<Pending>) {
        let before = gray(self.angle);
        self.angle += delta;
        self.emit_phase_change(
            before,
            gray(self.angle),
            (layout.angle_a, layout.angle_b),
            out,
        );
    }

    fn update_switches(&mut self, layout: &RigLayout, out: &mut Vec<Pending>) {
        let left = if self.left_closed {
            self.cart <= layout.left_limit_steps + layout.switch_hysteresis_steps
        } else {
            self.cart <= layout.left_limit_steps
        };
        if left != self.left_closed {
            self.left_closed = left;
            if !self.held.contains_key(&layout.left_switch) {
                self.emit(layout.left_switch, self.switch_level(layout, left), out);
            }
        }
        let right = if self.right_closed {
            self.cart >= layout.right_limit_steps - layout.switch_hysteresis_steps
        } else {
            self.cart >= layout.right_limit_steps
        };
        if right != self.right_closed {
            self.right_closed = right;
            if !self.held.contains_key(&layout.right_switch) {
                self.emit(layout.right_switch, self.switch_level(layout, right), out);
            }
        }
    }
}

impl SimRig {
    pub fn new(layout: RigLayout) -> Self {
        let mut state = RigState::default();
        // A rig whose origin lies outside the switches starts with them closed.
        state.left_closed = state.cart <= layout.left_limit_steps;
        state.right_closed = state.cart >= layout.right_limit_steps;
        Self {
            layout,
            epoch: Instant::now(),
            state: Mutex::new(state),
        }
    }

    pub fn layout(&self) -> &RigLayout {
        &self.layout
    }

    fn lock(&self) -> MutexGuard<'_, RigState> {
        // The state holds plain data; a poisoned lock still has a usable value.
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn dispatch(pending: Vec<Pending>) {
        for p in pending {
            let mut cb = p
                .callback
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            (cb)(p.edge);
        }
    }

    /// Advance virtual time by `d`, moving the cart under motor power.
    pub fn advance(&self, d: Duration) {
        let mut left = d;
        while !left.is_zero() {
            let dt = left.min(SUBSTEP);
            left -= dt;
            let mut pending = Vec::new();
            {
                let mut st = self.lock();
                st.elapsed += dt;
                let v = st.velocity(&self.layout);
                if v == 0.0 {
                    // Nothing can change until someone powers the motor.
                    st.cart_frac = 0.0;
                    st.elapsed += left;
                    break;
                }
                st.cart_frac += v * dt.as_secs_f64();
                while st.cart_frac >= 1.0 {
                    st.cart_frac -= 1.0;
                    if !st.step_cart(&self.layout, 1, &mut pending) {
                        st.cart_frac = 0.0;
                    }
                }
                while st.cart_frac <= -1.0 {
                    st.cart_frac += 1.0;
                    if !st.step_cart(&self.layout, -1, &mut pending) {
                        st.cart_frac = 0.0;
                    }
                }
            }
            Self::dispatch(pending);
        }
    }

    /// Push the cart by hand to `target`, one step at a time.
    pub fn move_cart_to(&self, target: i64) {
        loop {
            let mut pending = Vec::new();
            {
                let mut st = self.lock();
                if st.cart == target {
                    break;
                }
                let delta = (target - st.cart).signum();
                st.elapsed += MANUAL_STEP;
                if !st.step_cart(&self.layout, delta, &mut pending) {
                    break;
                }
            }
            Self::dispatch(pending);
        }
    }

    /// Swing the pendulum by hand to `target` angle steps.
    pub fn set_angle_steps(&self, target: i64) {
        loop {
            let mut pending = Vec::new();
            {
                let mut st = self.lock();
                if st.angle == target {
                    break;
                }
                let delta = (target - st.angle).signum();
                st.elapsed += MANUAL_STEP;
                st.step_angle(&self.layout, delta, &mut pending);
            }
            Self::dispatch(pending);
        }
    }

    /// Force a switch closed (`Some(true)`), open (`Some(false)`) or back to
    /// following the cart (`None`).
    pub fn hold_switch(&self, pin: u8, active: Option<bool>) {
        let mut pending = Vec::new();
        {
            let mut st = self.lock();
            let before = st.input_level(&self.layout, pin);
            match active {
                Some(a) => {
                    st.held.insert(pin, a);
                }
                None => {
                    st.held.remove(&pin);
                }
            }
            let after = st.input_level(&self.layout, pin);
            if let Some(level) = after
                && before != after
            {
                st.emit(pin, level, &mut pending);
            }
        }
        Self::dispatch(pending);
    }

    pub fn cart_steps(&self) -> i64 {
        self.lock().cart
    }

    pub fn angle_steps(&self) -> i64 {
        self.lock().angle
    }

    pub fn duty(&self, pin: u8) -> u8 {
        self.lock().duty.get(&pin).copied().unwrap_or(0)
    }

    pub fn output_level(&self, pin: u8) -> Option<Level> {
        self.lock().outputs.get(&pin).copied()
    }

    pub fn mode(&self, pin: u8) -> Option<PinMode> {
        self.lock().modes.get(&pin).copied()
    }

    pub fn is_watched(&self, pin: u8) -> bool {
        self.lock().watchers.contains_key(&pin)
    }

    pub fn elapsed(&self) -> Duration {
        self.lock().elapsed
    }

    fn require_output(st: &RigState, pin: u8) -> GpioResult<()> {
        match st.modes.get(&pin) {
            Some(PinMode::Output) => Ok(()),
            _ => Err(HwError::WrongMode {
                pin,
                mode: "output",
            }
            .into()),
        }
    }
}

impl Gpio for SimRig {
    fn set_input(&self, pin: u8, pull: Pull) -> GpioResult<()> {
        let mut st = self.lock();
        st.modes.insert(pin, PinMode::Input(pull));
        st.outputs.remove(&pin);
        st.duty.remove(&pin);
        Ok(())
    }

    fn set_output(&self, pin: u8) -> GpioResult<()> {
        let mut st = self.lock();
        st.modes.insert(pin, PinMode::Output);
        st.outputs.insert(pin, Level::Low);
        Ok(())
    }

    fn read(&self, pin: u8) -> GpioResult<Level> {
        let st = self.lock();
        if let Some(level) = st.outputs.get(&pin) {
            return Ok(*level);
        }
        st.input_level(&self.layout, pin)
            .ok_or_else(|| HwError::UnknownPin(pin).into())
    }

    fn write(&self, pin: u8, level: Level) -> GpioResult<()> {
        let mut st = self.lock();
        Self::require_output(&st, pin)?;
        st.outputs.insert(pin, level);
        Ok(())
    }

    fn set_pwm(&self, pin: u8, duty: u8) -> GpioResult<()> {
        let mut st = self.lock();
        Self::require_output(&st, pin)?;
        st.duty.insert(pin, duty);
        Ok(())
    }

    fn watch(&self, pin: u8, callback: EdgeCallback) -> GpioResult<()> {
        let mut st = self.lock();
        if st.input_level(&self.layout, pin).is_none() {
            return Err(HwError::UnknownPin(pin).into());
        }
        st.watchers.insert(pin, Arc::new(Mutex::new(callback)));
        Ok(())
    }

    fn unwatch(&self, pin: u8) -> GpioResult<()> {
        self.lock().watchers.remove(&pin);
        Ok(())
    }

    fn release(&self, pin: u8) -> GpioResult<()> {
        let mut st = self.lock();
        st.watchers.remove(&pin);
        st.duty.remove(&pin);
        st.outputs.remove(&pin);
        st.modes.insert(pin, PinMode::Input(Pull::Off));
        Ok(())
    }

    fn tick_us(&self) -> u32 {
        tick_of(self.lock().elapsed)
    }
}

impl Clock for SimRig {
    fn now(&self) -> Instant {
        self.epoch + self.lock().elapsed
    }

    fn sleep(&self, d: Duration) {
        self.advance(d);
    }
}
