//! Text records exchanged with the remote controller.
//!
//! State: `time position angle linear_velocity angular_velocity`, five
//! decimal numbers separated by single spaces. Command: one signed integer.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("expected 5 fields in state record, found {0}")]
    FieldCount(usize),
    #[error("field {index} is not a number: {value:?}")]
    BadNumber { index: usize, value: String },
    #[error("command is not an integer: {0:?}")]
    BadCommand(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StateMessage {
    pub time: f64,
    pub position: f64,
    pub angle: f64,
    pub linear_velocity: f64,
    pub angular_velocity: f64,
}

impl StateMessage {
    pub fn encode(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for StateMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.6} {:.6} {:.6} {:.6} {:.6}",
            self.time, self.position, self.angle, self.linear_velocity, self.angular_velocity
        )
    }
}

impl FromStr for StateMessage {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(WireError::FieldCount(fields.len()));
        }
        let mut v = [0.0_f64; 5];
        for (index, (slot, raw)) in v.iter_mut().zip(&fields).enumerate() {
            *slot = raw.parse().map_err(|_| WireError::BadNumber {
                index,
                value: (*raw).to_string(),
            })?;
        }
        Ok(Self {
            time: v[0],
            position: v[1],
            angle: v[2],
            linear_velocity: v[3],
            angular_velocity: v[4],
        })
    }
}

pub fn encode_command(pwm: i32) -> String {
    pwm.to_string()
}

/// Parse a command record. Surrounding whitespace is tolerated.
pub fn parse_command(s: &str) -> Result<i32, WireError> {
    let t = s.trim();
    t.parse::<i32>()
        .map_err(|_| WireError::BadCommand(t.to_string()))
}
