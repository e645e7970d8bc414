//! Human-readable error descriptions, exit codes and JSON error objects.

use pendule_core::{BuildError, ChannelError, PlantError};
use pendule_hardware::HwError;

/// Map an eyre::Report to a human-readable explanation with likely causes and fix hints.
pub fn humanize(err: &eyre::Report) -> String {
    if let Some(be) = err.downcast_ref::<BuildError>() {
        return match be {
            BuildError::MissingActuator => {
                "What happened: No motor driver was provided to the plant.\nLikely causes: The actuator failed to initialize or was not wired into the builder.\nHow to fix: Check the [motor] pins and pass the actuator via with_actuator(...).".to_string()
            }
            BuildError::MissingSwitches => {
                "What happened: The limit switches were not provided to the plant.\nLikely causes: A switch failed to initialize.\nHow to fix: Check [left_switch] and [right_switch] in the config.".to_string()
            }
            BuildError::MissingEncoders => {
                "What happened: The encoders were not provided to the plant.\nLikely causes: An encoder failed to initialize.\nHow to fix: Check [position_encoder] and [angle_encoder] in the config.".to_string()
            }
            BuildError::InvalidConfig(msg) => format!(
                "What happened: Invalid configuration ({msg}).\nLikely causes: Missing or out-of-range values in the TOML.\nHow to fix: Edit the config file, then rerun. `pendule template` prints a sample."
            ),
        };
    }

    if let Some(pe) = err.downcast_ref::<PlantError>() {
        return match pe {
            PlantError::EmergencyStop(reason) => format!(
                "What happened: Emergency stop ({reason}).\nLikely causes: The cart reached a limit switch or the safety distance, or the controller drove it too hard.\nHow to fix: Move the cart back to the middle by hand, check the controller, then restart the process."
            ),
            PlantError::CalibrationFailed(reason) => format!(
                "What happened: Calibration failed ({reason}).\nLikely causes: A switch is pressed or miswired, the pendulum is swinging, or the encoder is wired backwards.\nHow to fix: Free both switches, let the pendulum hang still, check left/right and encoder pin order, then rerun."
            ),
            PlantError::Aborted(what) => format!(
                "What happened: Stopped on request ({what}).\nLikely causes: Ctrl-C or SIGTERM during homing.\nHow to fix: Nothing to fix; the motor was stopped and the pins released. Rerun when ready."
            ),
            PlantError::NotCalibrated(what) => format!(
                "What happened: The plant was used before calibration ({what}).\nLikely causes: Calibration was skipped or did not finish.\nHow to fix: Run `pendule calibrate` to check the homing sequence."
            ),
            PlantError::Hardware(msg) => format!(
                "What happened: A GPIO call failed ({msg}).\nLikely causes: Missing GPIO permissions or another process owns the pins.\nHow to fix: Run as a user in the gpio group and stop other GPIO users; `pendule reset-gpio` floats every pin."
            ),
            PlantError::Config(msg) => format!(
                "What happened: The pin setup was rejected ({msg}).\nLikely causes: Two components share a pin or a pin is not wired.\nHow to fix: Give every signal its own pin in the config."
            ),
            other => format!(
                "What happened: {other}.\nLikely causes: See logs.\nHow to fix: Re-run with --log-level=debug or set RUST_LOG for more detail."
            ),
        };
    }

    if let Some(ce) = err.downcast_ref::<ChannelError>() {
        return match ce {
            ChannelError::ServerUnavailable(waited) => format!(
                "What happened: No state arrived from the server within {waited:?}.\nLikely causes: `pendule serve` is not running, is still calibrating, or the host/ports differ.\nHow to fix: Start the server and check [sockets] and --host."
            ),
            ChannelError::Io(e) => format!(
                "What happened: Socket error ({e}).\nLikely causes: The address is invalid or the port is in use.\nHow to fix: Check [sockets] in the config."
            ),
        };
    }

    if let Some(hw) = err.downcast_ref::<HwError>() {
        return match hw {
            HwError::TokenInUse => {
                "What happened: GPIO is already active in this process.\nLikely causes: A second plant was started in the same process.\nHow to fix: Drop the first plant before starting another.".to_string()
            }
            other => format!(
                "What happened: GPIO setup failed ({other}).\nLikely causes: Not running on a Raspberry Pi or missing permissions for /dev/gpiomem.\nHow to fix: Run on the rig as a user in the gpio group."
            ),
        };
    }

    // String-based heuristics for errors coming from init or config
    let msg = err.to_string();
    let lower = msg.to_ascii_lowercase();

    if lower.contains("failed to read config") {
        return format!(
            "What happened: {msg}.\nLikely causes: Wrong --config path.\nHow to fix: Pass --config FILE or create one with `pendule template > etc/pendule.toml`."
        );
    }

    if lower.contains("invalid configuration") || lower.contains("must be") {
        return format!(
            "What happened: Configuration is invalid or incomplete ({msg}).\nLikely causes: Missing tables, shared pins or out-of-range values.\nHow to fix: Edit the TOML config and try again."
        );
    }

    let mut cause = String::new();
    if let Some(src) = err.source() {
        cause = format!(" Cause: {src}");
    }
    format!(
        "Something went wrong.{cause}\nHow to fix: Re-run with --log-level=debug for details. Original: {msg}"
    )
}

/// Stable short name of the error kind.
pub fn reason_name(err: &eyre::Report) -> &'static str {
    if let Some(pe) = err.downcast_ref::<PlantError>() {
        return match pe {
            PlantError::EmergencyStop(_) => "EmergencyStop",
            PlantError::CalibrationFailed(_) => "CalibrationFailed",
            PlantError::Aborted(_) => "Aborted",
            PlantError::NotCalibrated(_) => "NotCalibrated",
            PlantError::Hardware(_) => "Hardware",
            PlantError::Config(_) => "Config",
            PlantError::InterruptsDisabled => "InterruptsDisabled",
            PlantError::TransitionOnUnknownPin { .. } => "TransitionOnUnknownPin",
            PlantError::InvalidArgument(_) => "InvalidArgument",
        };
    }
    if err.downcast_ref::<BuildError>().is_some() {
        return "Config";
    }
    if err.downcast_ref::<HwError>().is_some() {
        return "Hardware";
    }
    if let Some(ChannelError::ServerUnavailable(_)) = err.downcast_ref::<ChannelError>() {
        return "ServerUnavailable";
    }
    "Error"
}

/// Exit codes: emergency stop 2, calibration failed 3, not calibrated 4,
/// hardware 5, interrupted 130, anything else 1.
pub fn exit_code_for_error(err: &eyre::Report) -> i32 {
    match reason_name(err) {
        "EmergencyStop" => 2,
        "CalibrationFailed" => 3,
        "NotCalibrated" => 4,
        "Hardware" => 5,
        "Aborted" => 130,
        _ => 1,
    }
}

/// Structured JSON for errors when --json is enabled.
pub fn format_error_json(err: &eyre::Report) -> String {
    use serde_json::json;

    let detail = match err.downcast_ref::<PlantError>() {
        Some(PlantError::EmergencyStop(r) | PlantError::CalibrationFailed(r)) => Some(r.clone()),
        _ => None,
    };
    let obj = match detail {
        Some(d) => json!({ "reason": reason_name(err), "details": d, "message": humanize(err) }),
        None => json!({ "reason": reason_name(err), "message": humanize(err) }),
    };
    obj.to_string()
}
