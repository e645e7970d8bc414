//! State/command exchange with a remote controller.
//!
//! Each direction keeps only the newest record: a sender replaces whatever
//! the peer has not read yet, and a receiver drains to the latest pending
//! record. Transports implement [`Outbox`] and [`Inbox`]; the server and
//! client roles are generic over them.

pub mod local;
pub mod udp;
pub mod wire;

use std::io;
use std::time::Duration;

use crate::error::ChannelError;
pub use wire::{StateMessage, WireError, encode_command, parse_command};

/// How long a receive may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    NonBlocking,
    For(Duration),
    Forever,
}

impl Wait {
    /// `ms <= 0` polls once.
    pub fn from_millis(ms: i64) -> Self {
        match u64::try_from(ms) {
            Ok(0) | Err(_) => Self::NonBlocking,
            Ok(ms) => Self::For(Duration::from_millis(ms)),
        }
    }
}

/// Sending half of one direction. Never blocks; an unread record is replaced.
pub trait Outbox: Send {
    fn send_latest(&mut self, record: &str) -> io::Result<()>;
}

/// Receiving half of one direction. Returns the newest pending record.
pub trait Inbox: Send {
    fn recv_latest(&mut self, wait: Wait) -> io::Result<Option<String>>;
}

/// Plant side: publishes state, receives PWM commands.
pub struct ChannelServer<O, I> {
    state_out: O,
    command_in: I,
    command: i32,
    missed: u64,
}

impl<O: Outbox, I: Inbox> ChannelServer<O, I> {
    pub fn new(state_out: O, command_in: I) -> Self {
        Self {
            state_out,
            command_in,
            command: 0,
            missed: 0,
        }
    }

    /// Publish one state record. Transport failures are logged, not returned.
    pub fn send_state(
        &mut self,
        time: f64,
        position: f64,
        angle: f64,
        linear_velocity: f64,
        angular_velocity: f64,
    ) {
        let record = StateMessage {
            time,
            position,
            angle,
            linear_velocity,
            angular_velocity,
        }
        .encode();
        if let Err(e) = self.state_out.send_latest(&record) {
            tracing::warn!(error = %e, "failed to publish state");
        }
    }

    /// Try to receive a command, blocking up to `wait_ms` (`<= 0` polls).
    ///
    /// Returns true and resets the missed counter when a well-formed command
    /// arrived; otherwise bumps the counter and keeps the previous command.
    pub fn read_command(&mut self, wait_ms: i64) -> bool {
        let received = match self.command_in.recv_latest(Wait::from_millis(wait_ms)) {
            Ok(Some(record)) => match parse_command(&record) {
                Ok(pwm) => Some(pwm),
                Err(e) => {
                    tracing::warn!(error = %e, "dropping malformed command");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(error = %e, "command receive failed");
                None
            }
        };
        match received {
            Some(pwm) => {
                self.command = pwm;
                self.missed = 0;
                true
            }
            None => {
                self.missed = self.missed.saturating_add(1);
                false
            }
        }
    }

    /// Last successfully received command.
    pub fn command(&self) -> i32 {
        self.command
    }

    /// Consecutive `read_command` calls without a command.
    pub fn missed_messages(&self) -> u64 {
        self.missed
    }
}

/// Controller side: receives state, sends PWM commands.
pub struct ChannelClient<O, I> {
    command_out: O,
    state_in: I,
    state: Option<StateMessage>,
}

impl<O: Outbox, I: Inbox> ChannelClient<O, I> {
    pub fn new(command_out: O, state_in: I) -> Self {
        Self {
            command_out,
            state_in,
            state: None,
        }
    }

    /// Fetch the newest state record. Returns whether a valid one arrived.
    pub fn read_state(&mut self, wait: Wait) -> bool {
        match self.state_in.recv_latest(wait) {
            Ok(Some(record)) => match record.parse::<StateMessage>() {
                Ok(msg) => {
                    self.state = Some(msg);
                    true
                }
                Err(e) => {
                    tracing::warn!(error = %e, "dropping malformed state");
                    false
                }
            },
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(error = %e, "state receive failed");
                false
            }
        }
    }

    /// Latest state received so far.
    pub fn state(&self) -> Option<StateMessage> {
        self.state
    }

    pub fn send_command(&mut self, pwm: i32) -> io::Result<()> {
        self.command_out.send_latest(&encode_command(pwm))
    }

    /// Block until the server publishes, or fail after `timeout`.
    pub fn wait_for_server(&mut self, timeout: Duration) -> Result<(), ChannelError> {
        if self.read_state(Wait::For(timeout)) {
            Ok(())
        } else {
            Err(ChannelError::ServerUnavailable(timeout))
        }
    }
}
