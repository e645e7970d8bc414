#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
//! Config schema for the pendulum interface.
//!
//! - `Config` and sub-structs are deserialized from TOML and validated.
//! - `template()` returns a commented sample file with the defaults of a
//!   stock rig.
use serde::Deserialize;
use std::collections::HashSet;

use pendule_traits::MAX_USER_PIN;

const fn default_true() -> bool {
    true
}

const fn default_debounce_us() -> u32 {
    5_000
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct SwitchCfg {
    pub pin: u8,
    /// Raw level reads high when the switch is at rest.
    #[serde(default = "default_true")]
    pub normally_up: bool,
    /// Enable the internal pull-up (normally up) or pull-down resistor.
    #[serde(default = "default_true")]
    pub use_internal_pull_resistor: bool,
    /// Transitions closer than this to the last accepted one are ignored.
    #[serde(default = "default_debounce_us")]
    pub debounce_us: u32,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct EncoderCfg {
    pub pin_a: u8,
    pub pin_b: u8,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
pub struct MotorCfg {
    pub pwm_pin: u8,
    pub direction_pin: u8,
    /// Software PWM carrier frequency (hardware backend only).
    #[serde(default = "MotorCfg::default_frequency")]
    pub pwm_frequency_hz: f64,
}

impl MotorCfg {
    const fn default_frequency() -> f64 {
        800.0
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
pub struct SafetyThresholds {
    /// Minimum distance from the switches (meters) before the emergency stop trips.
    pub hard: f64,
    /// Extra distance inside the hard limit (meters) where outward commands are zeroed.
    pub soft: f64,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(default)]
pub struct PwmOffsets {
    pub low: i32,
    pub high: i32,
    #[serde(rename = "static")]
    pub static_: i32,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct CalibrationCfg {
    /// PWM magnitude used while homing.
    pub pwm: i32,
    /// Time the pendulum must stay still before homing starts.
    pub settle_ms: u64,
    /// Upper bound for each homing phase.
    pub timeout_ms: u64,
    pub poll_ms: u64,
    pub center_poll_ms: u64,
}

impl Default for CalibrationCfg {
    fn default() -> Self {
        Self {
            pwm: 40,
            settle_ms: 1_000,
            timeout_ms: 30_000,
            poll_ms: 100,
            center_poll_ms: 20,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Sockets {
    /// Address the server binds.
    pub host: String,
    pub state_port: u16,
    pub command_port: u16,
    /// State subscribers that do not renew within this window are dropped.
    pub subscriber_ttl_ms: u64,
}

impl Default for Sockets {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            state_port: 10_001,
            command_port: 10_002,
            subscriber_ttl_ms: 3_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct WatchdogCfg {
    /// Longest tolerated gap between commands before the applied PWM is zeroed.
    pub idle_ms: u64,
}

impl Default for WatchdogCfg {
    fn default() -> Self {
        Self { idle_ms: 1_000 }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct ServeCfg {
    /// How long the loop may block waiting for a command each period (0 = poll).
    pub command_wait_ms: u64,
    /// Pause between calibration and the first loop iteration.
    pub warmup_ms: u64,
}

impl Default for ServeCfg {
    fn default() -> Self {
        Self {
            command_wait_ms: 0,
            warmup_ms: 1_000,
        }
    }
}

#[derive(Debug, Deserialize, Default, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Logging {
    pub file: Option<String>,  // path to .log (JSON lines)
    pub level: Option<String>, // "info","debug"
    /// Log rotation policy: "never" | "daily" | "hourly" (default: never)
    pub rotation: Option<String>,
}

const fn default_period_ms() -> u64 {
    20
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Config {
    pub left_switch: SwitchCfg,
    pub right_switch: SwitchCfg,
    pub position_encoder: EncoderCfg,
    pub angle_encoder: EncoderCfg,
    pub motor: MotorCfg,
    /// Cart travel per encoder cycle (meters).
    pub meters_per_step: f64,
    /// Pendulum rotation per encoder cycle (radians).
    pub radians_per_step: f64,
    /// Subtracted from the raw angle reading.
    #[serde(default)]
    pub angle_offset: f64,
    pub safety_thresholds: SafetyThresholds,
    #[serde(default)]
    pub pwm_offsets: PwmOffsets,
    #[serde(default)]
    pub calibration: CalibrationCfg,
    #[serde(default = "default_period_ms")]
    pub period_ms: u64,
    #[serde(default)]
    pub sockets: Sockets,
    #[serde(default)]
    pub watchdog: WatchdogCfg,
    #[serde(default)]
    pub serve: ServeCfg,
    #[serde(default)]
    pub logging: Logging,
}

pub fn load_toml(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str::<Config>(s)
}

/// Read and parse a config file.
pub fn load_file(path: &std::path::Path) -> eyre::Result<Config> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| eyre::eyre!("failed to read config {}: {e}", path.display()))?;
    load_toml(&text).map_err(|e| eyre::eyre!("invalid configuration {}: {e}", path.display()))
}

impl Config {
    pub fn validate(&self) -> eyre::Result<()> {
        // Pins
        let pins = [
            ("left_switch.pin", self.left_switch.pin),
            ("right_switch.pin", self.right_switch.pin),
            ("position_encoder.pin_a", self.position_encoder.pin_a),
            ("position_encoder.pin_b", self.position_encoder.pin_b),
            ("angle_encoder.pin_a", self.angle_encoder.pin_a),
            ("angle_encoder.pin_b", self.angle_encoder.pin_b),
            ("motor.pwm_pin", self.motor.pwm_pin),
            ("motor.direction_pin", self.motor.direction_pin),
        ];
        let mut seen = HashSet::new();
        for (name, pin) in pins {
            if pin > MAX_USER_PIN {
                eyre::bail!("{name} must be a BCM pin in 0..={MAX_USER_PIN} (got {pin})");
            }
            if !seen.insert(pin) {
                eyre::bail!("{name} reuses pin {pin}; every signal needs its own pin");
            }
        }

        // Conversions
        if !(self.meters_per_step.is_finite() && self.meters_per_step > 0.0) {
            eyre::bail!("meters_per_step must be > 0");
        }
        if !(self.radians_per_step.is_finite() && self.radians_per_step > 0.0) {
            eyre::bail!("radians_per_step must be > 0");
        }
        if !self.angle_offset.is_finite() {
            eyre::bail!("angle_offset must be finite");
        }

        // Safety
        if !self.safety_thresholds.hard.is_finite() || !self.safety_thresholds.soft.is_finite() {
            eyre::bail!("safety_thresholds must be finite");
        }

        // Offsets
        for (name, v) in [
            ("pwm_offsets.low", self.pwm_offsets.low),
            ("pwm_offsets.high", self.pwm_offsets.high),
            ("pwm_offsets.static", self.pwm_offsets.static_),
        ] {
            if !(-255..=255).contains(&v) {
                eyre::bail!("{name} must be in [-255, 255]");
            }
        }

        // Calibration
        if !(1..=255).contains(&self.calibration.pwm) {
            eyre::bail!("calibration.pwm must be in [1, 255]");
        }
        if self.calibration.poll_ms == 0 || self.calibration.center_poll_ms == 0 {
            eyre::bail!("calibration poll intervals must be >= 1 ms");
        }
        if self.calibration.timeout_ms == 0 {
            eyre::bail!("calibration.timeout_ms must be >= 1");
        }

        // Loop
        if self.period_ms == 0 {
            eyre::bail!("period_ms must be > 0");
        }
        if self.period_ms > 1_000 {
            eyre::bail!("period_ms is unreasonably large (>1s)");
        }
        if self.serve.command_wait_ms >= self.period_ms {
            eyre::bail!("serve.command_wait_ms must be < period_ms");
        }
        if self.watchdog.idle_ms == 0 {
            eyre::bail!("watchdog.idle_ms must be >= 1");
        }

        // Sockets
        if self.sockets.state_port == 0 || self.sockets.command_port == 0 {
            eyre::bail!("sockets ports must be > 0");
        }
        if self.sockets.state_port == self.sockets.command_port {
            eyre::bail!("sockets.state_port and sockets.command_port must differ");
        }
        if self.sockets.host.trim().is_empty() {
            eyre::bail!("sockets.host must not be empty");
        }

        // Logging
        if let Some(rotation) = self.logging.rotation.as_deref()
            && !matches!(rotation, "never" | "daily" | "hourly")
        {
            eyre::bail!("logging.rotation must be one of never|daily|hourly");
        }
        Ok(())
    }
}

impl Config {
    /// Non-fatal findings worth showing to the operator.
    pub fn warnings(&self) -> Vec<String> {
        let mut out = Vec::new();
        if self.safety_thresholds.hard.abs() < f64::EPSILON {
            out.push(
                "safety_thresholds.hard is 0: the emergency stop only trips at the switches"
                    .to_string(),
            );
        }
        if self.safety_thresholds.hard < 0.0 {
            out.push("safety_thresholds.hard is negative; its magnitude is used".to_string());
        }
        if self.safety_thresholds.soft <= 0.0 {
            out.push("safety_thresholds.soft <= 0 disables the soft limit".to_string());
        }
        if self.pwm_offsets.low < 0 || self.pwm_offsets.high < 0 {
            out.push("negative pwm_offsets.low/high are clamped to 0".to_string());
        }
        out
    }
}

/// Commented sample configuration for a stock rig.
pub fn template() -> &'static str {
    TEMPLATE
}

const TEMPLATE: &str = r#"# Physical constants of the rig.
# Conversion coefficients for the encoders.
meters_per_step = 9.992676761711276e-06  # 0.846/84653
radians_per_step = 0.0015707963267948967  # 2*pi/4000

# Subtracted from the raw angle. The pendulum reads zero hanging down and pi
# pointing up; tweak this if it does not balance exactly at pi.
angle_offset = 0.0

# Control loop period.
period_ms = 20

# Left limit switch (encoder side).
[left_switch]
# GPIO pin (BCM numbering) reading the switch.
pin = 17
# Pin reads high when the switch is at rest.
normally_up = true
# Enable the internal pull-up (normally up) or pull-down resistor.
use_internal_pull_resistor = true
# Ignore transitions closer than this to the last accepted one (microseconds).
debounce_us = 5000

# Right limit switch (motor side).
[right_switch]
pin = 18
normally_up = true
use_internal_pull_resistor = true
debounce_us = 5000

# Encoder on the transmission belt.
[position_encoder]
pin_a = 20
pin_b = 21

# Encoder acting as the pendulum pivot.
[angle_encoder]
pin_a = 19
pin_b = 26

[motor]
# PWM signal to the motor controller.
pwm_pin = 24
# Direction select; high drives the cart toward the right switch.
direction_pin = 16
pwm_frequency_hz = 800.0

# Safety distances, in meters.
[safety_thresholds]
# Minimum distance from the switches. Crossing it latches the emergency stop.
# Negative values are inverted; zero is legal but unsafe.
hard = 0.05
# Distance inside the hard threshold where outward commands are zeroed.
# A non-positive value disables the soft limit.
soft = 0.1

# Offsets added to non-zero PWM commands.
[pwm_offsets]
# Subtracted from negative commands (clamped to >= 0).
low = 10
# Added to positive commands (clamped to >= 0).
high = 10
# Added to every non-zero command.
static = 0

[calibration]
# PWM magnitude used while homing.
pwm = 40
settle_ms = 1000
timeout_ms = 30000
poll_ms = 100
center_poll_ms = 20

[sockets]
# Address to bind; 0.0.0.0 accepts clients on every interface.
host = "0.0.0.0"
state_port = 10001
command_port = 10002
subscriber_ttl_ms = 3000

[watchdog]
# Zero the command after this long without one.
idle_ms = 1000

[serve]
command_wait_ms = 0
warmup_ms = 1000

[logging]
# file = "pendule.log"
level = "info"
rotation = "never"
"#;
