use thiserror::Error;

#[derive(Debug, Error)]
pub enum HwError {
    #[error("gpio error: {0}")]
    Gpio(String),
    #[error("gpio library is already activated in this process")]
    TokenInUse,
    #[error("pin {pin} is not configured as an {mode}")]
    WrongMode { pin: u8, mode: &'static str },
    #[error("pin {0} is not wired on this rig")]
    UnknownPin(u8),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HwError>;
