#![no_main]
use libfuzzer_sys::fuzz_target;
use pendule_core::StateMessage;
use pendule_core::channel::parse_command;

fuzz_target!(|data: &str| {
    if let Ok(msg) = data.parse::<StateMessage>() {
        // Re-encoding a finite record yields a parseable record.
        let finite = [
            msg.time,
            msg.position,
            msg.angle,
            msg.linear_velocity,
            msg.angular_velocity,
        ]
        .iter()
        .all(|v| v.is_finite());
        if finite {
            assert!(msg.encode().parse::<StateMessage>().is_ok());
        }
    }
    if let Ok(pwm) = parse_command(data) {
        assert_eq!(parse_command(&pwm.to_string()), Ok(pwm));
    }
});
