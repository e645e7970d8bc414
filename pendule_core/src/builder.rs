//! Type-state builder for `PlantController`.
//!
//! `build()` only exists once the actuator, both switches and both encoders
//! have been supplied. `try_build()` is always available and reports the
//! first missing piece.

use std::marker::PhantomData;
use std::sync::Arc;

use pendule_traits::{Clock, MonotonicClock};

use crate::actuator::Actuator;
use crate::encoder::QuadratureEncoder;
use crate::error::{BuildError, Result};
use crate::plant::{CalibrationParams, PlantController, PlantParams, PwmOffsets};
use crate::switch::DebouncedSwitch;

pub struct Missing;
pub struct Set;

pub struct PlantBuilder<A, S, E> {
    actuator: Option<Actuator>,
    switches: Option<(DebouncedSwitch, DebouncedSwitch)>,
    encoders: Option<(QuadratureEncoder, QuadratureEncoder)>,
    params: Option<PlantParams>,
    offsets: Option<PwmOffsets>,
    homing: Option<CalibrationParams>,
    clock: Option<Arc<dyn Clock + Send + Sync>>,
    _a: PhantomData<A>,
    _s: PhantomData<S>,
    _e: PhantomData<E>,
}

impl Default for PlantBuilder<Missing, Missing, Missing> {
    fn default() -> Self {
        Self {
            actuator: None,
            switches: None,
            encoders: None,
            params: None,
            offsets: None,
            homing: None,
            clock: None,
            _a: PhantomData,
            _s: PhantomData,
            _e: PhantomData,
        }
    }
}

impl PlantController {
    /// Start building a plant.
    pub fn builder() -> PlantBuilder<Missing, Missing, Missing> {
        PlantBuilder::default()
    }
}

fn validate(params: &PlantParams, homing: &CalibrationParams) -> Result<()> {
    if !(params.meters_per_step.is_finite() && params.meters_per_step > 0.0) {
        return Err(eyre::Report::new(BuildError::InvalidConfig(
            "meters_per_step must be > 0",
        )));
    }
    if !(params.radians_per_step.is_finite() && params.radians_per_step > 0.0) {
        return Err(eyre::Report::new(BuildError::InvalidConfig(
            "radians_per_step must be > 0",
        )));
    }
    if !params.safety_margin_meters.is_finite() {
        return Err(eyre::Report::new(BuildError::InvalidConfig(
            "safety margin must be finite",
        )));
    }
    if !params.rest_angle_offset.is_finite() {
        return Err(eyre::Report::new(BuildError::InvalidConfig(
            "rest angle offset must be finite",
        )));
    }
    if homing.poll.is_zero() || homing.center_poll.is_zero() {
        return Err(eyre::Report::new(BuildError::InvalidConfig(
            "calibration poll intervals must be > 0",
        )));
    }
    if homing.timeout.is_zero() {
        return Err(eyre::Report::new(BuildError::InvalidConfig(
            "calibration timeout must be > 0",
        )));
    }
    Ok(())
}

impl<A, S, E> PlantBuilder<A, S, E> {
    /// Fallible build available in any type-state.
    pub fn try_build(self) -> Result<PlantController> {
        let actuator = self
            .actuator
            .ok_or_else(|| eyre::Report::new(BuildError::MissingActuator))?;
        let (left, right) = self
            .switches
            .ok_or_else(|| eyre::Report::new(BuildError::MissingSwitches))?;
        let (position, angle) = self
            .encoders
            .ok_or_else(|| eyre::Report::new(BuildError::MissingEncoders))?;
        let params = self.params.unwrap_or_default();
        let homing = self.homing.unwrap_or_default();
        validate(&params, &homing)?;
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(MonotonicClock::new()));

        Ok(PlantController::from_parts(
            actuator,
            left,
            right,
            position,
            angle,
            clock,
            params,
            self.offsets.unwrap_or_default(),
            homing,
        ))
    }

    pub fn with_params(mut self, params: PlantParams) -> Self {
        self.params = Some(params);
        self
    }

    pub fn with_pwm_offsets(mut self, offsets: PwmOffsets) -> Self {
        self.offsets = Some(offsets);
        self
    }

    pub fn with_calibration(mut self, homing: CalibrationParams) -> Self {
        self.homing = Some(homing);
        self
    }

    /// Clock used for settling and homing waits; defaults to `MonotonicClock`.
    pub fn with_clock(mut self, clock: Arc<dyn Clock + Send + Sync>) -> Self {
        self.clock = Some(clock);
        self
    }

    fn retag<A2, S2, E2>(self) -> PlantBuilder<A2, S2, E2> {
        PlantBuilder {
            actuator: self.actuator,
            switches: self.switches,
            encoders: self.encoders,
            params: self.params,
            offsets: self.offsets,
            homing: self.homing,
            clock: self.clock,
            _a: PhantomData,
            _s: PhantomData,
            _e: PhantomData,
        }
    }
}

impl<S, E> PlantBuilder<Missing, S, E> {
    pub fn with_actuator(mut self, actuator: Actuator) -> PlantBuilder<Set, S, E> {
        self.actuator = Some(actuator);
        self.retag()
    }
}

impl<A, E> PlantBuilder<A, Missing, E> {
    pub fn with_switches(
        mut self,
        left: DebouncedSwitch,
        right: DebouncedSwitch,
    ) -> PlantBuilder<A, Set, E> {
        self.switches = Some((left, right));
        self.retag()
    }
}

impl<A, S> PlantBuilder<A, S, Missing> {
    pub fn with_encoders(
        mut self,
        position: QuadratureEncoder,
        angle: QuadratureEncoder,
    ) -> PlantBuilder<A, S, Set> {
        self.encoders = Some((position, angle));
        self.retag()
    }
}

impl PlantBuilder<Set, Set, Set> {
    /// Validate and build. Only available once every component is set.
    pub fn build(self) -> Result<PlantController> {
        self.try_build()
    }
}

/// Claim every pin named in `cfg` on `gpio` and assemble an uncalibrated plant.
pub fn build_plant(
    gpio: Arc<dyn pendule_traits::Gpio>,
    clock: Arc<dyn Clock + Send + Sync>,
    cfg: &pendule_config::Config,
) -> Result<PlantController> {
    let actuator = Actuator::new(Arc::clone(&gpio), cfg.motor.pwm_pin, cfg.motor.direction_pin)?;
    let left = DebouncedSwitch::new(Arc::clone(&gpio), (&cfg.left_switch).into())?;
    let right = DebouncedSwitch::new(Arc::clone(&gpio), (&cfg.right_switch).into())?;
    let position = QuadratureEncoder::new(
        Arc::clone(&gpio),
        cfg.position_encoder.pin_a,
        cfg.position_encoder.pin_b,
    )?;
    let angle = QuadratureEncoder::new(gpio, cfg.angle_encoder.pin_a, cfg.angle_encoder.pin_b)?;

    PlantController::builder()
        .with_actuator(actuator)
        .with_switches(left, right)
        .with_encoders(position, angle)
        .with_params(cfg.into())
        .with_pwm_offsets((&cfg.pwm_offsets).into())
        .with_calibration((&cfg.calibration).into())
        .with_clock(clock)
        .build()
}
