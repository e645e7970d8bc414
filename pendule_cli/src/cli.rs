//! CLI argument definitions and shared statics.

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::OnceLock;

pub static FILE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();
/// Whether the user asked for JSON output (controls structured error output).
pub static JSON_MODE: OnceLock<bool> = OnceLock::new();

#[derive(Parser, Debug)]
#[command(name = "pendule", version, about = "Inverted pendulum plant interface")]
pub struct Cli {
    /// Path to config TOML
    #[arg(long, value_name = "FILE", default_value = "etc/pendule.toml")]
    pub config: PathBuf,

    /// Log as JSON lines and print results as JSON
    #[arg(long, action = ArgAction::SetTrue)]
    pub json: bool,

    /// Console log level (error|warn|info|debug|trace)
    #[arg(long = "log-level", value_name = "LEVEL", default_value = "info")]
    pub log_level: String,

    /// Command to execute
    #[command(subcommand)]
    pub cmd: Commands,
}

/// Memory locking mode for real-time operation.
#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum RtLock {
    /// Do not lock memory
    None,
    /// Lock currently resident pages
    Current,
    /// Lock current and future pages
    All,
}

impl RtLock {
    #[inline]
    pub fn os_default() -> Self {
        if cfg!(target_os = "linux") {
            RtLock::Current
        } else {
            RtLock::None
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Calibrate the plant and serve state/commands to a remote controller
    Serve {
        /// Enable real-time mode (SCHED_FIFO, affinity, mlockall)
        #[arg(
            long,
            action = ArgAction::SetTrue,
            long_help = "Enable real-time mode on Linux.\n\nAttempts SCHED_FIFO priority, pins the process to one CPU and calls mlockall to keep the control loop out of page faults. Usually needs root, CAP_SYS_NICE and a sufficient memlock ulimit."
        )]
        rt: bool,
        /// SCHED_FIFO priority (1..=max); defaults to the maximum
        #[arg(long, value_name = "PRIO")]
        rt_prio: Option<i32>,
        /// Memory locking mode for --rt: none, current, or all
        #[arg(
            long,
            value_enum,
            value_name = "MODE",
            long_help = "Select memory locking mode when --rt is enabled.\n- none: do not lock memory.\n- current: lock currently resident pages.\n- all: lock current and future pages.\nDefault: current on Linux, none elsewhere."
        )]
        rt_lock: Option<RtLock>,
        /// CPU index to pin the process to (defaults to 0)
        #[arg(long, value_name = "CPU")]
        rt_cpu: Option<usize>,
        /// Print loop latency statistics on exit
        #[arg(long, action = ArgAction::SetTrue)]
        stats: bool,
        /// Stop after this many control periods
        #[arg(long, value_name = "N")]
        max_periods: Option<u64>,
    },
    /// Run the homing sequence once and print the result
    Calibrate,
    /// Connect to a running server and print the streamed state
    Monitor {
        /// Server address
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        /// Give up if no state arrives within this many milliseconds
        #[arg(long = "wait-ms", value_name = "MS", default_value_t = 2_000)]
        wait_ms: u64,
        /// Stop after printing this many states
        #[arg(long, value_name = "N")]
        count: Option<u64>,
        /// PWM command to send with every received state
        #[arg(long, value_name = "PWM", allow_hyphen_values = true)]
        command: Option<i32>,
    },
    /// Print a commented configuration template
    Template,
    /// Float every user GPIO pin and exit
    ResetGpio,
}
