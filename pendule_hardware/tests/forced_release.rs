use std::sync::Arc;
use std::time::Duration;

use pendule_hardware::{ActivationToken, PinMode, SimRig, release_registered};
use pendule_traits::{Clock, Gpio, Level, Pull};

// Registration is process-wide, so the whole sequence lives in one test.
#[test]
fn registered_backend_floats_while_the_token_is_still_alive() {
    assert_eq!(release_registered(), None);

    let rig = Arc::new(SimRig::default());
    let l = rig.layout().clone();
    let token = ActivationToken::acquire(rig.clone()).expect("acquire");
    let gpio = token.gpio();
    gpio.set_output(l.motor_pwm).unwrap();
    gpio.set_output(l.motor_dir).unwrap();
    gpio.write(l.motor_dir, Level::High).unwrap();
    gpio.set_pwm(l.motor_pwm, 120).unwrap();
    gpio.set_input(l.left_switch, Pull::Up).unwrap();
    rig.sleep(Duration::from_millis(10));
    assert!(rig.cart_steps() > 0);

    assert_eq!(release_registered(), Some(0));
    assert_eq!(rig.duty(l.motor_pwm), 0);
    for pin in [l.motor_pwm, l.motor_dir, l.left_switch] {
        assert_eq!(rig.mode(pin), Some(PinMode::Input(Pull::Off)), "pin {pin}");
    }
    let cart = rig.cart_steps();
    rig.sleep(Duration::from_millis(100));
    assert_eq!(rig.cart_steps(), cart);

    drop(token);
    assert_eq!(release_registered(), None);
}
