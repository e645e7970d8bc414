use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use pendule_core::{
    Actuator, CalibrationParams, DebouncedSwitch, Phase, PlantController, PlantError,
    PlantParams, PwmOffsets, QuadratureEncoder, SwitchParams,
};
use pendule_hardware::{RigLayout, SimRig};
use pendule_traits::{Clock, Gpio, Level};
use proptest::prelude::*;

const HOMING_PWM: i32 = 40;

/// 1/1024 m per quarter step and a 50-step margin keep the numbers exact.
fn params() -> PlantParams {
    PlantParams {
        meters_per_step: 0.003_906_25,
        safety_margin_meters: 0.048_828_125,
        ..PlantParams::default()
    }
}

fn homing() -> CalibrationParams {
    CalibrationParams {
        settle: Duration::from_millis(50),
        timeout: Duration::from_secs(10),
        ..CalibrationParams::default()
    }
}

struct Wiring {
    layout: RigLayout,
    left_pin: u8,
    right_pin: u8,
    position_pins: (u8, u8),
    offsets: PwmOffsets,
    homing: CalibrationParams,
}

impl Default for Wiring {
    fn default() -> Self {
        let layout = RigLayout::default();
        Self {
            left_pin: layout.left_switch,
            right_pin: layout.right_switch,
            position_pins: (layout.position_a, layout.position_b),
            layout,
            offsets: PwmOffsets::default(),
            homing: homing(),
        }
    }
}

type SleepHook = Box<dyn Fn(&SimRig) + Send + Sync>;

/// Rig clock that runs a hook after every sleep, standing in for things
/// that happen while the control thread waits.
struct HookedClock {
    rig: Arc<SimRig>,
    hook: SleepHook,
}

impl Clock for HookedClock {
    fn now(&self) -> Instant {
        self.rig.now()
    }

    fn sleep(&self, d: Duration) {
        self.rig.sleep(d);
        (self.hook)(&self.rig);
    }
}

fn assemble(w: Wiring) -> (Arc<SimRig>, PlantController) {
    assemble_hooked(w, None)
}

fn assemble_hooked(w: Wiring, hook: Option<SleepHook>) -> (Arc<SimRig>, PlantController) {
    let rig = Arc::new(SimRig::new(w.layout.clone()));
    let gpio: Arc<dyn Gpio> = rig.clone();
    let clock: Arc<dyn Clock + Send + Sync> = match hook {
        Some(hook) => Arc::new(HookedClock {
            rig: Arc::clone(&rig),
            hook,
        }),
        None => rig.clone(),
    };
    let l = &w.layout;
    let actuator = Actuator::new(Arc::clone(&gpio), l.motor_pwm, l.motor_dir).expect("actuator");
    let left = DebouncedSwitch::new(Arc::clone(&gpio), SwitchParams::new(w.left_pin)).expect("left");
    let right =
        DebouncedSwitch::new(Arc::clone(&gpio), SwitchParams::new(w.right_pin)).expect("right");
    let position =
        QuadratureEncoder::new(Arc::clone(&gpio), w.position_pins.0, w.position_pins.1)
            .expect("position");
    let angle = QuadratureEncoder::new(gpio, l.angle_a, l.angle_b).expect("angle");
    let plant = PlantController::builder()
        .with_actuator(actuator)
        .with_switches(left, right)
        .with_encoders(position, angle)
        .with_params(params())
        .with_pwm_offsets(w.offsets)
        .with_calibration(w.homing)
        .with_clock(clock)
        .build()
        .expect("plant");
    (rig, plant)
}

fn calibrated() -> (Arc<SimRig>, PlantController) {
    let (rig, mut plant) = assemble(Wiring::default());
    plant.calibrate(HOMING_PWM).expect("calibration");
    (rig, plant)
}

fn plant_error(err: &eyre::Report) -> PlantError {
    match err.downcast_ref::<PlantError>() {
        Some(e) => e.clone(),
        None => panic!("unexpected error: {err:?}"),
    }
}

fn failure_message(err: &eyre::Report) -> String {
    match plant_error(err) {
        PlantError::CalibrationFailed(msg) => msg,
        other => panic!("expected a calibration failure, got {other:?}"),
    }
}

#[test]
fn homing_finds_both_switches_and_centers() {
    let (rig, plant) = calibrated();
    let cal = plant.calibration().unwrap();
    assert_eq!((cal.min_steps, cal.max_steps, cal.mid_steps), (-1000, 1000, 0));
    assert_eq!(cal.margin_steps, 50);
    assert!((cal.soft_limit_meters - 0.927_734_375).abs() < 1e-12);
    assert_eq!(plant.phase(), Phase::Calibrated);

    // Centering stops within one poll of the midpoint.
    let cart = rig.cart_steps();
    assert!((0..=70).contains(&cart), "cart at {cart}");
    assert_eq!(i64::from(plant.position_steps()), cart);
    assert_eq!(rig.duty(rig.layout().motor_pwm), 0);
    assert!(rig.is_watched(rig.layout().left_switch));
}

#[test]
fn passing_the_soft_maximum_latches_the_estop() {
    let (rig, plant) = calibrated();
    rig.move_cart_to(951);
    assert!(plant.is_emergency_stopped());
    assert_eq!(plant.phase(), Phase::EmergencyStopped);
    let reason = "soft maximum position limit reached".to_string();
    assert_eq!(plant.fault_reason(), Some(reason.clone()));

    let err = plant.set_command(10).unwrap_err();
    assert_eq!(plant_error(&err), PlantError::EmergencyStop(reason.clone()));
    let err = plant.calibration().unwrap_err();
    assert_eq!(plant_error(&err), PlantError::EmergencyStop(reason.clone()));
    let err = plant.position().unwrap_err();
    assert_eq!(plant_error(&err), PlantError::EmergencyStop(reason));

    // Nothing derived from the homing run survives the latch.
    assert!(plant.min_position_steps().is_err());
    assert!(plant.max_position_steps().is_err());
    assert!(plant.mid_position_steps().is_err());
    assert!(plant.soft_limit_meters().is_err());
    assert!(plant.steps_to_meters(0).is_err());
    assert_eq!(rig.duty(rig.layout().motor_pwm), 0);
}

#[test]
fn limit_switch_latches_the_estop() {
    let (rig, mut plant) = calibrated();
    plant.set_command(60).unwrap();
    rig.hold_switch(rig.layout().left_switch, Some(true));
    assert_eq!(plant.fault_reason().as_deref(), Some("left switch hit"));
    assert_eq!(rig.duty(rig.layout().motor_pwm), 0);
    assert!(plant.update(0.02).is_err());

    // The latch has no reset, even through a new homing run.
    rig.hold_switch(rig.layout().left_switch, None);
    let err = plant.calibrate(HOMING_PWM).unwrap_err();
    assert!(failure_message(&err).contains("emergency stop is latched"));
}

#[test]
fn first_estop_reason_wins() {
    let (_rig, plant) = calibrated();
    let handle = plant.estop_handle();
    plant.estop("operator");
    handle.trigger("second");
    assert!(handle.is_tripped());
    assert_eq!(plant.fault_reason().as_deref(), Some("operator"));
}

#[test]
fn swapped_position_pins_are_detected() {
    let layout = RigLayout::default();
    let (rig, mut plant) = assemble(Wiring {
        position_pins: (layout.position_b, layout.position_a),
        ..Wiring::default()
    });
    let err = plant.calibrate(HOMING_PWM).unwrap_err();
    assert!(failure_message(&err).contains("counts the wrong way"));
    assert!(!plant.is_calibrated());
    assert_eq!(plant.phase(), Phase::Uninitialized);
    assert_eq!(rig.duty(layout.motor_pwm), 0);
}

#[test]
fn active_switch_blocks_homing() {
    let (rig, mut plant) = assemble(Wiring::default());
    rig.hold_switch(rig.layout().left_switch, Some(true));
    let err = plant.calibrate(HOMING_PWM).unwrap_err();
    assert!(failure_message(&err).contains("left switch is not at rest"));

    // A failed attempt leaves nothing armed and can simply be retried.
    assert!(!rig.is_watched(rig.layout().left_switch));
    rig.hold_switch(rig.layout().left_switch, None);
    plant.calibrate(HOMING_PWM).expect("second attempt");
    assert!(plant.is_calibrated());
}

#[test]
fn pendulum_off_rest_blocks_homing() {
    let (rig, mut plant) = assemble(Wiring::default());
    rig.set_angle_steps(5);
    let err = plant.calibrate(HOMING_PWM).unwrap_err();
    assert!(failure_message(&err).contains("not hanging at rest"));
    assert_eq!(rig.cart_steps(), 0);
}

#[test]
fn swinging_pendulum_blocks_homing() {
    let nudged = AtomicBool::new(false);
    // One swing out and back during the settle window; the count ends at 0.
    let hook: SleepHook = Box::new(move |rig: &SimRig| {
        if !nudged.swap(true, Ordering::AcqRel) {
            rig.set_angle_steps(3);
            rig.set_angle_steps(0);
        }
    });
    let (rig, mut plant) = assemble_hooked(Wiring::default(), Some(hook));
    let err = plant.calibrate(HOMING_PWM).unwrap_err();
    assert_eq!(failure_message(&err), "the pendulum is moving");
    assert!(!plant.is_calibrated());
    assert_eq!(rig.angle_steps(), 0);
    assert_eq!(rig.cart_steps(), 0);
    assert_eq!(rig.duty(rig.layout().motor_pwm), 0);
}

#[test]
fn cancel_flag_aborts_homing_mid_seek() {
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    let hook: SleepHook = Box::new(move |rig: &SimRig| {
        if rig.cart_steps() > 200 {
            flag.store(true, Ordering::Release);
        }
    });
    let (rig, mut plant) = assemble_hooked(Wiring::default(), Some(hook));
    plant.set_cancel_flag(Arc::clone(&cancel));

    let err = plant.calibrate(HOMING_PWM).unwrap_err();
    match plant_error(&err) {
        PlantError::Aborted(what) => assert!(what.contains("seeking the right switch"), "{what}"),
        other => panic!("expected an abort, got {other:?}"),
    }
    assert!(!plant.is_calibrated());
    assert_eq!(plant.phase(), Phase::Uninitialized);
    let l = rig.layout().clone();
    assert_eq!(rig.duty(l.motor_pwm), 0);
    assert!(!rig.is_watched(l.left_switch) && !rig.is_watched(l.right_switch));

    // The motor stays off: the cart never reaches the switch.
    let cart = rig.cart_steps();
    assert!((200..1000).contains(&cart), "cart at {cart}");
    rig.sleep(Duration::from_secs(1));
    assert_eq!(rig.cart_steps(), cart);
}

#[test]
fn cancel_flag_is_honoured_while_settling() {
    let (rig, mut plant) = assemble(Wiring::default());
    let cancel = Arc::new(AtomicBool::new(true));
    plant.set_cancel_flag(Arc::clone(&cancel));
    let err = plant.calibrate(HOMING_PWM).unwrap_err();
    assert!(matches!(plant_error(&err), PlantError::Aborted(ref w) if w.contains("settle")));
    assert_eq!(rig.cart_steps(), 0);

    cancel.store(false, Ordering::Release);
    plant.calibrate(HOMING_PWM).expect("retry after the flag clears");
}

#[test]
fn crossed_switch_wiring_aborts_homing() {
    let layout = RigLayout {
        left_switch: 18,
        right_switch: 17,
        ..RigLayout::default()
    };
    let (rig, mut plant) = assemble(Wiring {
        layout,
        left_pin: 17,
        right_pin: 18,
        ..Wiring::default()
    });
    let err = plant.calibrate(HOMING_PWM).unwrap_err();
    assert!(failure_message(&err).contains("hit the wrong switch"));
    assert_eq!(rig.duty(rig.layout().motor_pwm), 0);
    assert!(!rig.is_watched(17) && !rig.is_watched(18));
}

#[test]
fn dead_switch_times_out() {
    let (rig, mut plant) = assemble(Wiring {
        homing: CalibrationParams {
            timeout: Duration::from_secs(2),
            ..homing()
        },
        ..Wiring::default()
    });
    rig.hold_switch(rig.layout().right_switch, Some(false));
    let err = plant.calibrate(HOMING_PWM).unwrap_err();
    let msg = failure_message(&err);
    assert!(msg.contains("timed out"), "{msg}");
    assert!(msg.contains("seeking the right switch"), "{msg}");
    assert_eq!(rig.duty(rig.layout().motor_pwm), 0);
}

#[test]
fn homing_pwm_must_be_in_range() {
    let (_rig, mut plant) = assemble(Wiring::default());
    for pwm in [0, -10, 256] {
        let err = plant.calibrate(pwm).unwrap_err();
        assert!(matches!(plant_error(&err), PlantError::InvalidArgument(_)));
    }
}

#[test]
fn uncalibrated_plant_refuses_queries() {
    let (_rig, mut plant) = assemble(Wiring::default());
    assert_eq!(
        plant_error(&plant.position().unwrap_err()),
        PlantError::NotCalibrated("position")
    );
    assert!(matches!(
        plant_error(&plant.set_command(10).unwrap_err()),
        PlantError::NotCalibrated(_)
    ));
    assert!(plant.steps_to_meters(0).is_err());
    assert!(plant.soft_limit_meters().is_err());
    assert!(plant.update(0.02).is_err());
    assert_eq!(plant.phase(), Phase::Uninitialized);
}

#[test]
fn offsets_shape_and_saturate_commands() {
    let (rig, mut plant) = assemble(Wiring {
        offsets: PwmOffsets::new(10, 10, 0),
        ..Wiring::default()
    });
    plant.calibrate(HOMING_PWM).unwrap();
    let l = rig.layout().clone();

    assert!(!plant.set_command(300).unwrap());
    assert_eq!((rig.duty(l.motor_pwm), rig.output_level(l.motor_dir)), (255, Some(Level::High)));

    assert!(plant.set_command(-100).unwrap());
    assert_eq!((rig.duty(l.motor_pwm), rig.output_level(l.motor_dir)), (110, Some(Level::Low)));
    assert_eq!(plant.applied_pwm(), -110);

    assert!(plant.set_command(0).unwrap());
    assert_eq!(rig.duty(l.motor_pwm), 0);

    plant.set_pwm_offsets(PwmOffsets::default());
    assert!(plant.set_command(255).unwrap());
}

#[test]
fn update_tracks_position_and_velocity() {
    let (rig, mut plant) = calibrated();
    let mps = plant.meters_per_step();
    let rps = plant.radians_per_step();
    let start = rig.cart_steps();
    #[allow(clippy::cast_precision_loss)]
    let expected_start = mps * start as f64;
    assert!((plant.position().unwrap() - expected_start).abs() < 1e-12);
    assert!(plant.linear_velocity().unwrap().abs() < 1e-12);

    rig.move_cart_to(start + 100);
    rig.set_angle_steps(8);
    plant.update(0.02).unwrap();
    assert!((plant.position().unwrap() - (expected_start + 100.0 * mps)).abs() < 1e-12);
    assert!((plant.linear_velocity().unwrap() - 100.0 * mps / 0.02).abs() < 1e-9);
    assert!((plant.angle().unwrap() - 8.0 * rps).abs() < 1e-12);
    assert!((plant.angular_velocity().unwrap() - 8.0 * rps / 0.02).abs() < 1e-9);

    for dt in [0.0, -1.0, f64::NAN] {
        assert!(matches!(
            plant_error(&plant.update(dt).unwrap_err()),
            PlantError::InvalidArgument(_)
        ));
    }
}

#[test]
fn conversion_factors_are_quartered() {
    let (_rig, plant) = assemble(Wiring::default());
    assert!((plant.meters_per_step() - 0.000_976_562_5).abs() < f64::EPSILON);
    let rps = PlantParams::default().radians_per_step / 4.0;
    assert!((plant.steps_to_radians(4) - 4.0 * rps).abs() < 1e-15);
}

#[test]
fn step_conversion_is_relative_to_the_midpoint() {
    let (_rig, plant) = calibrated();
    let mps = plant.meters_per_step();
    let mut runner = proptest::test_runner::TestRunner::default();
    runner
        .run(&any::<i32>(), |s| {
            let got = plant.steps_to_meters(s).expect("calibrated");
            prop_assert_eq!(got, mps * f64::from(s));
            Ok(())
        })
        .unwrap();
}
