mod backend;
mod cli;
mod error_fmt;
mod monitor;
mod rt;
mod serve;

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use cli::{Cli, Commands, FILE_GUARD, JSON_MODE, RtLock};
use error_fmt::{exit_code_for_error, format_error_json, humanize};
use eyre::WrapErr;

fn main() {
    let cli = Cli::parse();
    let _ = JSON_MODE.set(cli.json);
    if let Err(e) = color_eyre::install() {
        eprintln!("Warning: color-eyre not installed: {e}");
    }

    if let Err(err) = run(cli) {
        tracing::error!(error = %err, "command failed");
        if JSON_MODE.get().copied().unwrap_or(false) {
            println!("{}", format_error_json(&err));
        } else {
            eprintln!("{}", humanize(&err));
        }
        std::process::exit(exit_code_for_error(&err));
    }
}

fn run(cli: Cli) -> eyre::Result<()> {
    let Cli {
        config,
        json,
        log_level,
        cmd,
    } = cli;

    match cmd {
        Commands::Template => {
            print!("{}", pendule_config::template());
            Ok(())
        }
        Commands::ResetGpio => {
            init_tracing(json, &log_level, None)?;
            reset_gpio(json)
        }
        cmd => {
            let cfg = load_config(&config)?;
            init_tracing(json, &log_level, Some(&cfg.logging))?;
            for warning in cfg.warnings() {
                tracing::warn!(%warning, "config");
            }
            let shutdown = install_shutdown_handler();
            match cmd {
                Commands::Serve {
                    rt,
                    rt_prio,
                    rt_lock,
                    rt_cpu,
                    stats,
                    max_periods,
                } => serve::run_serve(
                    &cfg,
                    &serve::ServeArgs {
                        rt: rt.then_some(rt::RtOptions {
                            prio: rt_prio,
                            lock: rt_lock.unwrap_or_else(RtLock::os_default),
                            cpu: rt_cpu,
                        }),
                        stats,
                        max_periods,
                    },
                    json,
                    &shutdown,
                ),
                Commands::Calibrate => serve::run_calibrate(&cfg, json, &shutdown),
                Commands::Monitor {
                    host,
                    wait_ms,
                    count,
                    command,
                } => monitor::run_monitor(
                    &cfg,
                    &monitor::MonitorArgs {
                        host,
                        wait_ms,
                        count,
                        command,
                    },
                    json,
                    &shutdown,
                ),
                Commands::Template | Commands::ResetGpio => Ok(()),
            }
        }
    }
}

fn load_config(path: &Path) -> eyre::Result<pendule_config::Config> {
    let cfg = pendule_config::load_file(path)?;
    cfg.validate()
        .map_err(|e| eyre::eyre!("invalid configuration {}: {e}", path.display()))?;
    Ok(cfg)
}

/// Console logs go to stderr so stdout stays machine-readable; the optional
/// file sink always writes JSON lines.
fn init_tracing(
    json: bool,
    level: &str,
    logging: Option<&pendule_config::Logging>,
) -> eyre::Result<()> {
    use tracing_subscriber::{EnvFilter, Layer, fmt, prelude::*};

    let console_filter =
        || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let console_json = json.then(|| {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_filter(console_filter())
    });
    let console_pretty = (!json).then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(console_filter())
    });

    let file_layer = match logging.and_then(|l| l.file.as_deref().map(|f| (l, f))) {
        Some((l, file)) => {
            let path = Path::new(file);
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .ok_or_else(|| eyre::eyre!("logging.file must name a file (got {file})"))?;
            let appender = match l.rotation.as_deref() {
                Some("daily") => tracing_appender::rolling::daily(dir, name),
                Some("hourly") => tracing_appender::rolling::hourly(dir, name),
                _ => tracing_appender::rolling::never(dir, name),
            };
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let _ = FILE_GUARD.set(guard);
            Some(
                fmt::layer()
                    .json()
                    .with_ansi(false)
                    .with_writer(writer)
                    .with_filter(EnvFilter::new(l.level.as_deref().unwrap_or("info"))),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(console_json)
        .with(console_pretty)
        .with(file_layer)
        .try_init()
        .wrap_err("failed to install the log subscriber")
}

/// First Ctrl-C asks the running command to stop; a second one floats every
/// pin and exits at once.
fn install_shutdown_handler() -> Arc<AtomicBool> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    let installed = ctrlc::set_handler(move || {
        if flag.swap(true, Ordering::AcqRel) {
            // exit() skips destructors, so release the pins here.
            match pendule_hardware::release_registered() {
                Some(failures) => eprintln!(
                    "Interrupted twice; pins released ({failures} failures), exiting now."
                ),
                None => eprintln!("Interrupted twice; exiting now."),
            }
            std::process::exit(130);
        }
        tracing::info!("shutdown requested");
    });
    if let Err(e) = installed {
        tracing::warn!(error = %e, "failed to install Ctrl-C handler");
    }
    shutdown
}

fn reset_gpio(json: bool) -> eyre::Result<()> {
    let gpio = backend::open_bare()?;
    let failures = pendule_hardware::reset_pins(gpio.as_ref());
    let released = usize::from(pendule_hardware::MAX_USER_PIN) + 1 - failures;
    if json {
        println!(
            "{}",
            serde_json::json!({ "released": released, "failures": failures })
        );
    } else {
        println!("Released {released} pins ({failures} failures).");
    }
    if failures > 0 {
        eyre::bail!("{failures} pins could not be released");
    }
    Ok(())
}
