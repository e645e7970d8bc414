//! `serve` and `calibrate`: plant assembly, homing and the remote-control loop.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use pendule_config::Config;
use pendule_core::channel::udp::bind_server;
use pendule_core::{ChannelError, LoopStats, PlantController, ServeCfg, build_plant};
use pendule_hardware::ActivationToken;
use pendule_traits::Clock;

use crate::backend;
use crate::rt::{RtOptions, setup_rt_once};

pub struct ServeArgs {
    pub rt: Option<RtOptions>,
    pub stats: bool,
    pub max_periods: Option<u64>,
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

fn calibrated_plant(
    token: &ActivationToken,
    clock: Arc<dyn Clock + Send + Sync>,
    cfg: &Config,
    shutdown: &Arc<AtomicBool>,
) -> eyre::Result<PlantController> {
    let mut plant = build_plant(token.gpio(), clock, cfg)?;
    plant.set_cancel_flag(Arc::clone(shutdown));
    tracing::info!(pwm = cfg.calibration.pwm, "homing");
    plant.calibrate(cfg.calibration.pwm)?;
    Ok(plant)
}

pub fn run_calibrate(cfg: &Config, json: bool, shutdown: &Arc<AtomicBool>) -> eyre::Result<()> {
    let backend = backend::open(cfg)?;
    let token = ActivationToken::acquire(backend.gpio)?;
    let plant = calibrated_plant(&token, backend.clock, cfg, shutdown)?;
    let c = plant.calibration()?;
    if json {
        println!(
            "{}",
            serde_json::json!({
                "timestamp": unix_timestamp(),
                "min_steps": c.min_steps,
                "max_steps": c.max_steps,
                "mid_steps": c.mid_steps,
                "margin_steps": c.margin_steps,
                "soft_limit_m": c.soft_limit_meters,
                "position_m": plant.position()?,
                "angle_rad": plant.angle()?,
            })
        );
    } else {
        println!(
            "Calibrated: min={} max={} mid={} margin={} steps, soft limit {:.4} m",
            c.min_steps, c.max_steps, c.mid_steps, c.margin_steps, c.soft_limit_meters
        );
        println!(
            "Cart at {:.4} m, pendulum at {:.4} rad",
            plant.position()?,
            plant.angle()?
        );
    }
    Ok(())
}

pub fn run_serve(
    cfg: &Config,
    args: &ServeArgs,
    json: bool,
    shutdown: &Arc<AtomicBool>,
) -> eyre::Result<()> {
    if let Some(opts) = args.rt {
        setup_rt_once(opts);
    }

    let backend = backend::open(cfg)?;
    let token = ActivationToken::acquire(backend.gpio)?;
    let clock = backend.clock;
    let mut plant = calibrated_plant(&token, Arc::clone(&clock), cfg, shutdown)?;

    let mut server = bind_server(
        &cfg.sockets.host,
        cfg.sockets.state_port,
        cfg.sockets.command_port,
        Duration::from_millis(cfg.sockets.subscriber_ttl_ms),
    )
    .map_err(ChannelError::Io)?;

    let serve_cfg = ServeCfg {
        max_periods: args.max_periods,
        ..ServeCfg::from(cfg)
    };
    let stats = pendule_core::serve(&mut plant, &mut server, clock.as_ref(), &serve_cfg, shutdown)?;

    if args.stats {
        print_stats(&stats, serve_cfg.period);
    }
    if json {
        println!(
            "{}",
            serde_json::json!({
                "timestamp": unix_timestamp(),
                "iterations": stats.iterations,
                "missed_deadlines": stats.missed_deadlines,
                "watchdog_trips": stats.watchdog_trips,
                "soft_limit_clamps": stats.soft_limit_clamps,
                "saturated": stats.saturated,
                "missed_messages": server.missed_messages(),
            })
        );
    } else {
        println!(
            "Served {} periods ({} missed commands, {} watchdog trips).",
            stats.iterations,
            server.missed_messages(),
            stats.watchdog_trips
        );
    }
    Ok(())
}

/// Print latency/jitter stats to stderr.
fn print_stats(stats: &LoopStats, period: Duration) {
    eprintln!("\n--- Pendule Stats ---");
    eprintln!("Periods: {}", stats.iterations);
    eprintln!("Period (us): {}", period.as_micros());
    eprintln!(
        "Wake-up latency min/avg/max/stdev (us): {} / {:.1} / {} / {:.1}",
        stats.latency_min_us(),
        stats.latency_mean_us(),
        stats.latency_max_us(),
        stats.latency_stdev_us()
    );
    eprintln!("Missed deadlines (> period): {}", stats.missed_deadlines);
    eprintln!("Saturated commands: {}", stats.saturated);
    eprintln!("---------------------\n");
}
