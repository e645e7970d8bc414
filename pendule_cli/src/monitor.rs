//! `monitor`: a minimal remote controller that prints the streamed state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use pendule_config::Config;
use pendule_core::channel::udp::connect_client;
use pendule_core::{ChannelError, StateMessage, Wait};

pub struct MonitorArgs {
    pub host: String,
    pub wait_ms: u64,
    pub count: Option<u64>,
    /// Sent after every received state so the server watchdog stays fed.
    pub command: Option<i32>,
}

fn print_state(state: &StateMessage, json: bool) {
    if json {
        println!(
            "{}",
            serde_json::json!({
                "time": state.time,
                "position": state.position,
                "angle": state.angle,
                "linear_velocity": state.linear_velocity,
                "angular_velocity": state.angular_velocity,
            })
        );
    } else {
        println!("{}", state.encode());
    }
}

pub fn run_monitor(
    cfg: &Config,
    args: &MonitorArgs,
    json: bool,
    shutdown: &AtomicBool,
) -> eyre::Result<()> {
    let wait = Duration::from_millis(args.wait_ms);
    let mut client = connect_client(
        &args.host,
        cfg.sockets.state_port,
        cfg.sockets.command_port,
        Duration::from_millis(cfg.sockets.subscriber_ttl_ms),
    )
    .map_err(ChannelError::Io)?;
    tracing::info!(host = %args.host, port = cfg.sockets.state_port, "waiting for server");

    if let Some(pwm) = args.command {
        client.send_command(pwm).map_err(ChannelError::Io)?;
    }
    client.wait_for_server(wait)?;

    let mut printed = 0u64;
    loop {
        if let Some(state) = client.state() {
            print_state(&state, json);
            printed += 1;
        }
        if let Some(pwm) = args.command
            && let Err(e) = client.send_command(pwm)
        {
            tracing::warn!(error = %e, "command send failed");
        }
        if args.count.is_some_and(|n| printed >= n) || shutdown.load(Ordering::Acquire) {
            break;
        }
        if !client.read_state(Wait::For(wait)) {
            return Err(ChannelError::ServerUnavailable(wait).into());
        }
    }
    tracing::info!(printed, "monitor finished");
    Ok(())
}
