use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlantError {
    #[error("plant is not calibrated ({0})")]
    NotCalibrated(&'static str),
    #[error("calibration failed: {0}")]
    CalibrationFailed(String),
    #[error("emergency stop: {0}")]
    EmergencyStop(String),
    #[error("aborted: {0}")]
    Aborted(String),
    #[error("switch interrupts are disabled")]
    InterruptsDisabled,
    #[error("transition reported on pin {pin}, which this component does not own")]
    TransitionOnUnknownPin { pin: u8 },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("hardware error: {0}")]
    Hardware(String),
    #[error("configuration error: {0}")]
    Config(String),
}

#[derive(Debug, Error, Clone)]
pub enum BuildError {
    #[error("missing actuator")]
    MissingActuator,
    #[error("missing limit switches")]
    MissingSwitches,
    #[error("missing encoders")]
    MissingEncoders,
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("no state received from the server within {0:?}")]
    ServerUnavailable(Duration),
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = eyre::Result<T>;
pub use eyre::Report;
