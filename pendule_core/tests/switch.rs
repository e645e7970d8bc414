use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use pendule_core::{DebouncedSwitch, PlantError, SwitchCallback, SwitchParams};
use pendule_hardware::{PinMode, SimRig};
use pendule_traits::{Gpio, Level, Pull};
use rstest::rstest;

const LEFT: u8 = 17;

fn rig_switch(params: SwitchParams) -> (Arc<SimRig>, DebouncedSwitch) {
    let rig = Arc::new(SimRig::default());
    let gpio: Arc<dyn Gpio> = rig.clone();
    let sw = DebouncedSwitch::new(gpio, params).expect("switch");
    (rig, sw)
}

fn counter() -> (Arc<AtomicUsize>, SwitchCallback) {
    let n = Arc::new(AtomicUsize::new(0));
    let n2 = Arc::clone(&n);
    (
        n,
        Arc::new(move || {
            n2.fetch_add(1, Ordering::SeqCst);
        }),
    )
}

#[rstest]
#[case(true, true, Pull::Up)]
#[case(false, true, Pull::Down)]
#[case(true, false, Pull::Off)]
#[case(false, false, Pull::Off)]
fn resistor_follows_rest_level(
    #[case] normally_up: bool,
    #[case] internal: bool,
    #[case] pull: Pull,
) {
    let params = SwitchParams {
        normally_up,
        use_internal_resistor: internal,
        ..SwitchParams::new(LEFT)
    };
    let (rig, _sw) = rig_switch(params);
    assert_eq!(rig.mode(LEFT), Some(PinMode::Input(pull)));
}

#[test]
fn cached_state_needs_armed_interrupts() {
    let (_rig, sw) = rig_switch(SwitchParams::new(LEFT));
    let err = sw.at_rest_cached().unwrap_err();
    assert_eq!(
        err.downcast_ref::<PlantError>(),
        Some(&PlantError::InterruptsDisabled)
    );
    assert!(sw.at_rest().expect("direct read"));
}

#[test]
fn edges_inside_the_window_are_swallowed() {
    let (_rig, sw) = rig_switch(SwitchParams::new(LEFT));
    let (n, cb) = counter();
    sw.enable_interrupts(Some(cb)).unwrap();

    assert!(sw.handle_edge(LEFT, Level::Low, 1_000).unwrap());
    assert!(!sw.handle_edge(LEFT, Level::Low, 2_000).unwrap());
    assert!(!sw.handle_edge(LEFT, Level::High, 5_999).unwrap());
    assert_eq!(n.load(Ordering::SeqCst), 1);
    assert!(!sw.at_rest_cached().unwrap());
    assert!(sw.has_triggered());

    assert!(sw.handle_edge(LEFT, Level::High, 6_000).unwrap());
    assert!(sw.at_rest_cached().unwrap());
    assert_eq!(n.load(Ordering::SeqCst), 1);
}

#[test]
fn window_survives_tick_wraparound() {
    let (_rig, sw) = rig_switch(SwitchParams::new(LEFT));
    sw.enable_interrupts(None).unwrap();
    assert!(sw.handle_edge(LEFT, Level::Low, u32::MAX - 1_000).unwrap());
    assert!(!sw.handle_edge(LEFT, Level::High, 2_000).unwrap());
    assert!(sw.handle_edge(LEFT, Level::High, 4_000).unwrap());
}

#[test]
fn zero_window_accepts_every_edge() {
    let params = SwitchParams {
        debounce_us: 0,
        ..SwitchParams::new(LEFT)
    };
    let (_rig, sw) = rig_switch(params);
    let (n, cb) = counter();
    sw.enable_interrupts(Some(cb)).unwrap();
    for tick in 0..4 {
        sw.handle_edge(LEFT, Level::Low, tick).unwrap();
    }
    assert_eq!(n.load(Ordering::SeqCst), 4);
}

#[test]
fn foreign_pin_is_rejected() {
    let (_rig, sw) = rig_switch(SwitchParams::new(LEFT));
    assert_eq!(
        sw.handle_edge(18, Level::Low, 0),
        Err(PlantError::TransitionOnUnknownPin { pin: 18 })
    );
    assert!(!sw.has_triggered());
}

#[test]
fn arming_seeds_cache_from_the_pin() {
    let (rig, sw) = rig_switch(SwitchParams::new(LEFT));
    rig.hold_switch(LEFT, Some(true));
    sw.enable_interrupts(None).unwrap();
    assert!(!sw.at_rest_cached().unwrap());
    assert!(rig.is_watched(LEFT));
}

#[test]
fn normally_down_switch_is_active_high() {
    let params = SwitchParams {
        normally_up: false,
        ..SwitchParams::new(LEFT)
    };
    let (_rig, sw) = rig_switch(params);
    let (n, cb) = counter();
    sw.enable_interrupts(Some(cb)).unwrap();
    assert!(sw.handle_edge(LEFT, Level::High, 0).unwrap());
    assert_eq!(n.load(Ordering::SeqCst), 1);
    assert!(!sw.at_rest_cached().unwrap());
}

#[test]
fn cart_closing_the_switch_runs_the_callback_once() {
    let (rig, sw) = rig_switch(SwitchParams::new(LEFT));
    let (n, cb) = counter();
    sw.enable_interrupts(Some(cb)).unwrap();

    rig.move_cart_to(-1_010);
    assert_eq!(n.load(Ordering::SeqCst), 1);
    assert!(!sw.at_rest_cached().unwrap());

    rig.advance(Duration::from_millis(10));
    rig.move_cart_to(-900);
    assert!(sw.at_rest_cached().unwrap());
    assert_eq!(n.load(Ordering::SeqCst), 1);
}

#[test]
fn rearming_swaps_the_callback_only() {
    let (rig, sw) = rig_switch(SwitchParams::new(LEFT));
    let (first_n, first) = counter();
    let (second_n, second) = counter();
    sw.enable_interrupts(Some(first)).unwrap();
    rig.hold_switch(LEFT, Some(true));
    rig.advance(Duration::from_millis(10));
    rig.hold_switch(LEFT, Some(false));
    assert!(sw.at_rest_cached().unwrap());

    sw.enable_interrupts(Some(second)).unwrap();
    rig.advance(Duration::from_millis(10));
    rig.hold_switch(LEFT, Some(true));
    assert_eq!(first_n.load(Ordering::SeqCst), 1);
    assert_eq!(second_n.load(Ordering::SeqCst), 1);
}

#[test]
fn disabled_switch_stops_notifying() {
    let (rig, sw) = rig_switch(SwitchParams::new(LEFT));
    let (n, cb) = counter();
    sw.enable_interrupts(Some(cb)).unwrap();
    sw.disable_interrupts().unwrap();
    assert!(!rig.is_watched(LEFT));
    rig.hold_switch(LEFT, Some(true));
    assert_eq!(n.load(Ordering::SeqCst), 0);
    assert!(!sw.interrupts_enabled());
}

#[test]
fn drop_releases_the_pin() {
    let (rig, sw) = rig_switch(SwitchParams::new(LEFT));
    sw.enable_interrupts(None).unwrap();
    drop(sw);
    assert!(!rig.is_watched(LEFT));
    assert_eq!(rig.mode(LEFT), Some(PinMode::Input(Pull::Off)));
}
