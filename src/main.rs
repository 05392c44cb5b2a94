#![warn(clippy::all)]

// main entry point
use clap::Parser;
use log::{error, info};
use netdivert::diverter::Diverter;
use netdivert::error::{DivertError, Result};
use netdivert::platform::{LinuxPlatform, Platform};
use netdivert::settings::file::{default_config_path, load_settings, save_settings};
use netdivert::settings::{DiverterSettings, NetworkMode, SettingsBuilder};
use netdivert::utils::{init_logger, log_statistics, verbosity_level};
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

/// Diverts a sandboxed host's traffic to local listeners.
#[derive(Debug, Parser)]
#[command(name = "netdivert", version, about)]
struct Cli {
    /// Configuration file (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Network mode, overriding the configuration file
    #[arg(short, long, value_enum)]
    mode: Option<NetworkMode>,

    /// Restrict the nonlocal hook to one interface (MultiHost only)
    #[arg(short, long)]
    interface: Option<String>,

    /// Log every packet to a foreign address, not only the first
    #[arg(long)]
    log_every_occurrence: bool,

    /// Write the effective configuration to this path and exit
    #[arg(long, value_name = "PATH")]
    save_config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Main entry point for netdivert
fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_logger(verbosity_level(cli.verbose)) {
        eprintln!("Failed to initialize logger: {}", e);
        std::process::exit(1);
    }

    info!("netdivert starting up");

    if let Err(e) = run(cli) {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let settings = resolve_settings(&cli)?;

    if let Some(path) = &cli.save_config {
        save_settings(path, &settings)?;
        return Ok(());
    }

    let platform: Arc<dyn Platform> = Arc::new(LinuxPlatform::new());
    let interval = Duration::from_secs(settings.statistics_interval_secs);
    let mut diverter = Diverter::new(settings, platform)?;

    let (shutdown_tx, shutdown_rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(());
    })
    .map_err(|e| DivertError::Startup(format!("Failed to install signal handler: {}", e)))?;

    diverter.start()?;
    info!("Diverting traffic, press Ctrl-C to stop");

    if interval.is_zero() {
        let _ = shutdown_rx.recv();
    } else {
        loop {
            match shutdown_rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => log_statistics(&diverter.statistics().snapshot()),
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    info!("Shutdown requested");
    diverter.stop();
    Ok(())
}

/// Loads the configuration file, then applies command-line overrides.
fn resolve_settings(cli: &Cli) -> Result<DiverterSettings> {
    let loaded = match &cli.config {
        Some(path) => load_settings(path)?,
        None => match default_config_path().filter(|path| path.exists()) {
            Some(path) => load_settings(&path)?,
            None => {
                info!("No configuration file found, using defaults");
                DiverterSettings::default()
            }
        },
    };

    let mut builder = SettingsBuilder::from_settings(loaded);
    if let Some(mode) = cli.mode {
        builder = builder.mode(mode);
    }
    if let Some(iface) = &cli.interface {
        builder = builder.restrict_interface(iface.as_str());
    }
    if cli.log_every_occurrence {
        builder = builder.log_every_occurrence(true);
    }

    let settings = builder.build();
    settings.validate()?;
    Ok(settings)
}
